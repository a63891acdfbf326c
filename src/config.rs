use crate::error::{StreamError, StreamResult};
use crate::signal::{ProcessingParams, SignalProcessor};
use crate::streaming::ring_buffer::DEFAULT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Session recorder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    /// Samples kept in the live ring buffer
    pub ring_capacity: usize,
    /// Directory for session CSV files; `None` disables persistence
    pub data_dir: Option<PathBuf>,
    /// How long `stop` waits for the producer task
    pub stop_timeout_ms: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_CAPACITY,
            data_dir: None,
            stop_timeout_ms: 5000,
        }
    }
}

impl RecorderSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Live broadcaster settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Tick period
    pub interval_ms: u64,
    /// Most new samples sent in one payload
    pub cap_per_tick: usize,
    /// Samples processed per tick for filter context
    pub context_window: usize,
    /// Per-sink publish deadline
    pub sink_timeout_ms: u64,
    /// Buffer size for channel sinks
    pub channel_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            cap_per_tick: 100,
            context_window: 110,
            sink_timeout_ms: 50,
            channel_capacity: 64,
        }
    }
}

impl BroadcastSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

/// Runtime settings for the acquisition pipeline
///
/// Sources, in increasing precedence: defaults, a JSON file, `EPHYS_*`
/// environment variables (a `.env` file is honoured), command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub recorder: RecorderSettings,
    pub broadcast: BroadcastSettings,
    pub processing: ProcessingParams,
}

impl Settings {
    /// Defaults overridden by environment variables
    pub fn from_env() -> StreamResult<Self> {
        Self::load(None)
    }

    /// Defaults, then the optional JSON file, then environment variables.
    pub fn load(path: Option<&Path>) -> StreamResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        dotenvy::dotenv().ok();
        settings.apply_overrides(|key| env::var(key).ok())?;
        Ok(settings)
    }

    /// Load settings from a JSON file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> StreamResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `EPHYS_*` overrides from any key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> StreamResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let recorder = &mut self.recorder;
        override_parsed(&lookup, "EPHYS_RING_CAPACITY", &mut recorder.ring_capacity)?;
        if let Some(dir) = lookup("EPHYS_DATA_DIR") {
            recorder.data_dir = if dir.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        override_parsed(&lookup, "EPHYS_STOP_TIMEOUT_MS", &mut recorder.stop_timeout_ms)?;

        let broadcast = &mut self.broadcast;
        override_parsed(&lookup, "EPHYS_BROADCAST_INTERVAL_MS", &mut broadcast.interval_ms)?;
        override_parsed(&lookup, "EPHYS_BROADCAST_CAP", &mut broadcast.cap_per_tick)?;
        override_parsed(&lookup, "EPHYS_CONTEXT_WINDOW", &mut broadcast.context_window)?;
        override_parsed(&lookup, "EPHYS_SINK_TIMEOUT_MS", &mut broadcast.sink_timeout_ms)?;

        let processing = &mut self.processing;
        override_parsed(&lookup, "EPHYS_NOISE_FLOOR_UV", &mut processing.noise_floor_uv)?;
        override_parsed(&lookup, "EPHYS_PROMINENCE_UV", &mut processing.prominence_uv)?;
        override_parsed(&lookup, "EPHYS_HEIGHT_FLOOR_UV", &mut processing.height_floor_uv)?;

        self.validate()
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.recorder.ring_capacity == 0 {
            return Err(StreamError::InvalidConfig(
                "ring capacity must be at least 1".to_string(),
            ));
        }
        if self.broadcast.interval_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "broadcast interval must be positive".to_string(),
            ));
        }
        if self.broadcast.cap_per_tick == 0 || self.broadcast.context_window == 0 {
            return Err(StreamError::InvalidConfig(
                "broadcast cap and context window must be at least 1".to_string(),
            ));
        }
        SignalProcessor::new(self.processing.clone()).map(|_| ())
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, target: &mut T) -> StreamResult<()>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| {
            StreamError::InvalidConfig(format!("{} has an invalid value: {:?}", key, raw))
        })?;
    }
    Ok(())
}
