//! Session persistence
//!
//! Every recorded sample is appended to `session_<id>.csv` in the data
//! directory:
//!
//! ```text
//! timestamp_s,channel,raw_adc,voltage_uv
//! 0.1000,1,215,1.000
//! ```
//!
//! Rows are flushed every [`FLUSH_EVERY`] samples and when the session ends.

use crate::error::{StreamError, StreamResult};
use crate::streaming::types::Sample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

pub const CSV_HEADER: [&str; 4] = ["timestamp_s", "channel", "raw_adc", "voltage_uv"];

/// Rows written between flushes
pub const FLUSH_EVERY: u64 = 100;

/// `session_<id>.csv`
pub fn session_filename(session_id: &str) -> String {
    format!("session_{}.csv", session_id)
}

/// Per-user default location for recorded sessions
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("ephys-stream").join("sessions"))
}

/// Append-only CSV writer for one session
pub struct SessionCsvWriter {
    writer: csv::Writer<File>,
    path: PathBuf,
    rows: u64,
}

impl SessionCsvWriter {
    /// Create the file (and its directory) and write the header.
    pub fn create(path: impl Into<PathBuf>) -> StreamResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut writer = csv::Writer::from_writer(File::create(&path)?);
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;

        Ok(Self {
            writer,
            path,
            rows: 0,
        })
    }

    pub fn append(&mut self, sample: &Sample) -> StreamResult<()> {
        self.writer.write_record([
            format!("{:.4}", sample.timestamp),
            sample.channel.to_string(),
            sample.raw_count.to_string(),
            format!("{:.3}", sample.voltage_uv),
        ])?;
        self.rows += 1;

        if self.rows % FLUSH_EVERY == 0 {
            self.writer.flush()?;
        }
        Ok(())
    }

    /// Flush outstanding rows and close the file. Returns the row count.
    pub fn finish(mut self) -> StreamResult<u64> {
        self.writer.flush()?;
        Ok(self.rows)
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp_s: f64,
    channel: u8,
    raw_adc: i32,
    voltage_uv: f64,
}

/// Read a session file back into samples, in file order.
pub fn load_session(path: &Path) -> StreamResult<Vec<Sample>> {
    let mut reader = csv::Reader::from_path(path)?;
    reader
        .deserialize::<CsvRow>()
        .map(|row| {
            let row = row?;
            Ok(Sample::new(row.timestamp_s, row.channel, row.raw_adc, row.voltage_uv))
        })
        .collect()
}

/// A session file found in the data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFile {
    pub id: String,
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Sessions in `data_dir`, newest id first. A missing directory has none.
pub fn list_sessions(data_dir: &Path) -> StreamResult<Vec<SessionFile>> {
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut sessions = Vec::new();
    for entry in entries {
        let entry = entry?;
        let filename = entry.file_name().to_string_lossy().into_owned();
        let Some(id) = filename
            .strip_prefix("session_")
            .and_then(|rest| rest.strip_suffix(".csv"))
        else {
            continue;
        };

        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        sessions.push(SessionFile {
            id: id.to_string(),
            filename: filename.clone(),
            path: entry.path(),
            size_bytes: metadata.len(),
            created_at,
        });
    }

    sessions.sort_by(|a, b| b.filename.cmp(&a.filename));
    Ok(sessions)
}

/// Path of an existing session file
pub fn find_session(data_dir: &Path, session_id: &str) -> StreamResult<PathBuf> {
    let path = data_dir.join(session_filename(session_id));
    if path.is_file() {
        Ok(path)
    } else {
        Err(StreamError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Session not found: {}", session_id),
        )))
    }
}
