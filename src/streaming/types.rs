// Common types for the streaming module

use crate::acquisition::AcquisitionConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single converted reading from a sample source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the stream started (monotonic)
    pub timestamp: f64,
    pub channel: u8,
    /// Raw converter count (24-bit signed)
    pub raw_count: i32,
    /// Physical value in microvolts
    pub voltage_uv: f64,
}

impl Sample {
    pub fn new(timestamp: f64, channel: u8, raw_count: i32, voltage_uv: f64) -> Self {
        Self {
            timestamp,
            channel,
            raw_count,
            voltage_uv,
        }
    }
}

/// Lifecycle of the session recorder
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    #[default]
    Idle,
    Configuring,
    Recording,
}

/// Point-in-time view of a recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub duration_s: f64,
    pub sample_count: u64,
    pub peak_count: u64,
    pub csv_path: Option<PathBuf>,
    pub config: AcquisitionConfig,
    /// Set when the source failed mid-session
    pub interrupted: bool,
    pub error: Option<String>,
}

/// Answer to a status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderStatus {
    pub connected: bool,
    pub state: RecordingState,
    pub session: Option<SessionInfo>,
    pub last_session: Option<SessionInfo>,
    pub elapsed_s: f64,
}

impl RecorderStatus {
    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }
}
