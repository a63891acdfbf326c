// Pluggable sample sources for the acquisition pipeline
//
// New sources are added by:
// 1. Implementing the SampleSource trait
// 2. Adding a variant to SampleSourceConfig
// 3. Registering in the factory function
//
// Current implementations:
// - Bridge: hardware bridge subprocess speaking line-delimited JSON
// - Simulated: synthetic fungal-like spiking signal for demos
// - Replay: plays back a recorded session CSV
// - Scripted: in-memory samples and errors for tests and embedding

mod bridge;
mod replay;
mod scripted;
mod simulated;

use crate::acquisition::AcquisitionConfig;
use crate::error::StreamResult;
use crate::streaming::types::Sample;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub use bridge::{BridgeSource, DEFAULT_POLL_INTERVAL_MS};
pub use replay::ReplaySource;
pub use scripted::{ScriptCalls, ScriptStep, ScriptedSource};
pub use simulated::{SimulatedSource, SpikeModel, SIMULATED_DT};

/// Stream of sample batches produced by a source
///
/// `Err` items carrying a transient error may be followed by more batches; a
/// fatal error is the last item.
pub type SampleStream<'a> = BoxStream<'a, StreamResult<Vec<Sample>>>;

/// Configuration for the available source types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SampleSourceConfig {
    /// Hardware bridge subprocess
    #[serde(rename = "bridge")]
    Bridge {
        /// Executable to launch (e.g. "python3")
        program: String,
        #[serde(default)]
        args: Vec<String>,
        /// Delay between readiness polls
        #[serde(default)]
        poll_interval_ms: Option<u64>,
    },

    /// Synthetic spiking signal
    #[serde(rename = "simulated")]
    Simulated {
        #[serde(default)]
        seed: Option<u64>,
        /// Pace output at 10 S/s instead of producing as fast as it is pulled
        #[serde(default = "default_true")]
        realtime: bool,
    },

    /// Recorded session played back from CSV
    #[serde(rename = "replay")]
    Replay {
        path: PathBuf,
        /// Playback speed relative to the recorded timestamps; `None` plays
        /// back without delays
        #[serde(default)]
        speed: Option<f64>,
        #[serde(default)]
        loop_playback: bool,
    },
}

fn default_true() -> bool {
    true
}

impl SampleSourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SampleSourceConfig::Bridge { .. } => "bridge",
            SampleSourceConfig::Simulated { .. } => "simulated",
            SampleSourceConfig::Replay { .. } => "replay",
        }
    }
}

/// Metadata about a sample source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Source type name ("bridge", "simulated", ...)
    pub kind: String,

    /// Channels that will appear in the stream
    pub channels: Vec<u8>,

    /// Nominal interval between sampling rounds
    pub sample_interval_ms: u64,

    /// True for sources that do not read real hardware
    pub simulated: bool,

    /// Source-specific properties (e.g. program path, file path)
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Trait for all sample sources
///
/// Lifecycle: `connect` → `configure` → `stream` (consumed until stop or
/// failure) → `stop` → optionally `stream` again → `disconnect`.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Acquire the device or open the input. Connecting twice is a no-op.
    async fn connect(&mut self) -> StreamResult<()>;

    /// Apply acquisition parameters. Fails with `InvalidConfig` when the
    /// source cannot honour them.
    async fn configure(&mut self, config: &AcquisitionConfig) -> StreamResult<()>;

    /// Lazily produce batches in timestamp order.
    ///
    /// Nothing happens until the stream is polled. Dropping the stream stops
    /// producing; every call starts a fresh stream with timestamps relative
    /// to its own start.
    fn stream(&mut self) -> SampleStream<'_>;

    /// Tell the device to stop acquiring after the stream was dropped.
    async fn stop(&mut self) -> StreamResult<()>;

    /// Release the device or input.
    async fn disconnect(&mut self) -> StreamResult<()>;

    fn is_connected(&self) -> bool;

    fn metadata(&self) -> SourceMetadata;
}

/// Factory function to create a SampleSource from configuration
pub fn create_source(config: SampleSourceConfig) -> StreamResult<Box<dyn SampleSource>> {
    match config {
        SampleSourceConfig::Bridge {
            program,
            args,
            poll_interval_ms,
        } => Ok(Box::new(BridgeSource::new(
            program,
            args,
            poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        ))),

        SampleSourceConfig::Simulated { seed, realtime } => {
            Ok(Box::new(SimulatedSource::new(seed, realtime)))
        }

        SampleSourceConfig::Replay {
            path,
            speed,
            loop_playback,
        } => Ok(Box::new(ReplaySource::new(path, speed, loop_playback)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_tagging() {
        let json = r#"{"type":"simulated","seed":7}"#;
        let config: SampleSourceConfig = serde_json::from_str(json).unwrap();
        match &config {
            SampleSourceConfig::Simulated { seed, realtime } => {
                assert_eq!(*seed, Some(7));
                assert!(*realtime);
            }
            other => panic!("unexpected config: {:?}", other),
        }
        assert_eq!(config.kind(), "simulated");

        let json = r#"{"type":"bridge","program":"python3","args":["bridge.py"]}"#;
        let config: SampleSourceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), "bridge");
    }

    #[test]
    fn test_factory_builds_simulated() {
        let source = create_source(SampleSourceConfig::Simulated {
            seed: Some(1),
            realtime: false,
        })
        .unwrap();
        assert!(!source.is_connected());
        assert!(source.metadata().simulated);
    }

    #[test]
    fn test_factory_rejects_bad_replay_speed() {
        let result = create_source(SampleSourceConfig::Replay {
            path: PathBuf::from("session.csv"),
            speed: Some(0.0),
            loop_playback: false,
        });
        assert!(result.is_err());
    }
}
