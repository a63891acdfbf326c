// Live handle to a recording session
//
// Counters are atomics: the producer task bumps `sample_count`, the
// broadcaster bumps `peak_count`, and any number of status readers load them.
// The end-of-session record is written exactly once.

use crate::acquisition::AcquisitionConfig;
use crate::streaming::ring_buffer::RingBuffer;
use crate::streaming::types::SessionInfo;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
struct SessionEnd {
    stopped_at: DateTime<Utc>,
    duration_s: f64,
    interrupted: bool,
    error: Option<String>,
}

pub struct ActiveSession {
    id: String,
    /// Increases by one for every session a recorder opens
    serial: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    config: AcquisitionConfig,
    ring: Arc<RingBuffer>,
    csv_path: Option<PathBuf>,
    sample_count: AtomicU64,
    peak_count: AtomicU64,
    finished: AtomicBool,
    end: RwLock<Option<SessionEnd>>,
}

impl ActiveSession {
    pub(crate) fn new(
        id: String,
        serial: u64,
        config: AcquisitionConfig,
        ring: Arc<RingBuffer>,
        csv_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            serial,
            started_at: Utc::now(),
            started: Instant::now(),
            config,
            ring,
            csv_path,
            sample_count: AtomicU64::new(0),
            peak_count: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            end: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Sample history of this session
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn csv_path(&self) -> Option<&PathBuf> {
        self.csv_path.as_ref()
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::Acquire)
    }

    pub fn peak_count(&self) -> u64 {
        self.peak_count.load(Ordering::Acquire)
    }

    pub(crate) fn record_sample(&self) {
        self.sample_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Add newly reported peaks to the running total.
    pub fn add_peaks(&self, count: u64) -> u64 {
        self.peak_count.fetch_add(count, Ordering::AcqRel) + count
    }

    /// Seconds since start, frozen once the session has ended
    pub fn elapsed_s(&self) -> f64 {
        match self.end.read().as_ref() {
            Some(end) => end.duration_s,
            None => self.started.elapsed().as_secs_f64(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Record the end of the session. Only the first call has any effect;
    /// returns whether this call was it.
    pub(crate) fn finish(&self, interrupted: bool, error: Option<String>) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        *self.end.write() = Some(SessionEnd {
            stopped_at: Utc::now(),
            duration_s: self.started.elapsed().as_secs_f64(),
            interrupted,
            error,
        });
        true
    }

    pub fn info(&self) -> SessionInfo {
        let end = self.end.read().clone();
        SessionInfo {
            id: self.id.clone(),
            started_at: self.started_at,
            stopped_at: end.as_ref().map(|e| e.stopped_at),
            duration_s: self.elapsed_s(),
            sample_count: self.sample_count(),
            peak_count: self.peak_count(),
            csv_path: self.csv_path.clone(),
            config: self.config.clone(),
            interrupted: end.as_ref().is_some_and(|e| e.interrupted),
            error: end.and_then(|e| e.error),
        }
    }
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("sample_count", &self.sample_count())
            .field("peak_count", &self.peak_count())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ActiveSession {
        let (_writer, ring) = RingBuffer::with_capacity(4);
        ActiveSession::new("s".into(), 1, AcquisitionConfig::default(), ring, None)
    }

    #[test]
    fn test_counters() {
        let session = session();
        session.record_sample();
        session.record_sample();
        assert_eq!(session.add_peaks(3), 3);
        assert_eq!(session.add_peaks(0), 3);

        let info = session.info();
        assert_eq!(info.sample_count, 2);
        assert_eq!(info.peak_count, 3);
        assert!(info.stopped_at.is_none());
    }

    #[test]
    fn test_finish_only_once() {
        let session = session();
        assert!(session.finish(true, Some("unplugged".into())));
        assert!(!session.finish(false, None));

        let info = session.info();
        assert!(info.interrupted);
        assert_eq!(info.error.as_deref(), Some("unplugged"));
        assert!(info.stopped_at.is_some());
        assert_eq!(session.elapsed_s(), info.duration_s);
    }
}
