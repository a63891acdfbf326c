// Lock-free sample ring for live display and windowed processing
//
// Single writer, any number of readers. Each slot carries its own sequence
// number (a per-slot seqlock), so the writer never waits on a reader and a
// reader never returns a (time, voltage) pair from two different writes.
// Snapshots copy out the region behind the write cursor and re-validate every
// slot; if the writer lapped the region while copying, the copy is retried.

use crate::streaming::types::Sample;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

/// About five minutes of history at 10 S/s
pub const DEFAULT_CAPACITY: usize = 3000;

/// Extra attempts a snapshot makes after detecting that the writer wrapped
/// over the region being copied.
const SNAPSHOT_RETRIES: usize = 2;

/// A (time, voltage) pair as stored in the ring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferedSample {
    pub time: f64,
    pub voltage: f64,
}

impl From<&Sample> for BufferedSample {
    fn from(sample: &Sample) -> Self {
        Self {
            time: sample.timestamp,
            voltage: sample.voltage_uv,
        }
    }
}

struct Slot {
    /// `2 * cursor + 1` while being written, `2 * cursor + 2` once complete
    seq: AtomicU64,
    time: AtomicU64,
    voltage: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            seq: AtomicU64::new(0),
            time: AtomicU64::new(0),
            voltage: AtomicU64::new(0),
        }
    }
}

/// Metrics for ring monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RingMetrics {
    pub capacity: usize,
    pub filled: usize,
    pub write_cursor: u64,
    /// Snapshots that had to be retried because the writer lapped them
    pub snapshot_retries: u64,
}

/// Fixed-capacity circular store with overwrite-oldest semantics
pub struct RingBuffer {
    slots: Box<[Slot]>,
    capacity: usize,
    cursor: AtomicU64,
    snapshot_retries: AtomicU64,
}

/// The only handle allowed to push into a [`RingBuffer`]
///
/// Deliberately not `Clone`: holding the writer is what makes the ring
/// single-producer.
pub struct RingWriter {
    ring: Arc<RingBuffer>,
}

impl RingBuffer {
    /// Create a ring and its writer. A zero capacity is bumped to one slot.
    pub fn with_capacity(capacity: usize) -> (RingWriter, Arc<RingBuffer>) {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| Slot::empty()).collect();

        let ring = Arc::new(Self {
            slots,
            capacity,
            cursor: AtomicU64::new(0),
            snapshot_retries: AtomicU64::new(0),
        });

        (
            RingWriter {
                ring: Arc::clone(&ring),
            },
            ring,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of pushes since the ring was created
    pub fn write_cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn filled(&self) -> usize {
        self.write_cursor().min(self.capacity as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.write_cursor() == 0
    }

    /// Copy out the most recent `min(n, filled)` samples, oldest first.
    ///
    /// `None` returns everything currently held. Requests beyond the capacity
    /// are capped.
    pub fn snapshot(&self, n: Option<usize>) -> Vec<BufferedSample> {
        self.snapshot_with_cursor(n).1
    }

    /// Like [`snapshot`](Self::snapshot), also returning the write cursor the
    /// copy ends at. The newest returned sample was written at `cursor - 1`.
    pub fn snapshot_with_cursor(&self, n: Option<usize>) -> (u64, Vec<BufferedSample>) {
        let wanted = n.unwrap_or(self.capacity).min(self.capacity);
        let mut attempt = 0;

        loop {
            let cursor = self.write_cursor();
            let count = (cursor.min(self.capacity as u64) as usize).min(wanted);
            if count == 0 {
                return (cursor, Vec::new());
            }

            let start = cursor - count as u64;
            let mut out = Vec::with_capacity(count);
            let mut lapped = false;

            for position in start..cursor {
                match self.read_slot(position) {
                    Some(sample) => out.push(sample),
                    None => {
                        // Everything older than an overwritten slot is gone as
                        // well; keep only the newer suffix.
                        lapped = true;
                        out.clear();
                    }
                }
            }

            if !lapped || attempt >= SNAPSHOT_RETRIES {
                return (cursor, out);
            }

            attempt += 1;
            self.snapshot_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Most recent sample, if any
    pub fn latest(&self) -> Option<BufferedSample> {
        self.snapshot(Some(1)).pop()
    }

    pub fn metrics(&self) -> RingMetrics {
        let write_cursor = self.write_cursor();
        RingMetrics {
            capacity: self.capacity,
            filled: write_cursor.min(self.capacity as u64) as usize,
            write_cursor,
            snapshot_retries: self.snapshot_retries.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, position: u64) -> &Slot {
        &self.slots[(position % self.capacity as u64) as usize]
    }

    fn read_slot(&self, position: u64) -> Option<BufferedSample> {
        let slot = self.slot(position);
        let expected = 2 * position + 2;

        if slot.seq.load(Ordering::Acquire) != expected {
            return None;
        }

        let time = f64::from_bits(slot.time.load(Ordering::Relaxed));
        let voltage = f64::from_bits(slot.voltage.load(Ordering::Relaxed));

        fence(Ordering::Acquire);
        if slot.seq.load(Ordering::Relaxed) != expected {
            return None;
        }

        Some(BufferedSample { time, voltage })
    }
}

impl RingWriter {
    /// Append a pair, overwriting the oldest slot once the ring is full.
    pub fn push(&mut self, time: f64, voltage: f64) {
        let ring = &*self.ring;
        // Only this handle advances the cursor.
        let position = ring.cursor.load(Ordering::Relaxed);
        let slot = ring.slot(position);

        slot.seq.store(2 * position + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        slot.time.store(time.to_bits(), Ordering::Relaxed);
        slot.voltage.store(voltage.to_bits(), Ordering::Relaxed);
        slot.seq.store(2 * position + 2, Ordering::Release);

        ring.cursor.store(position + 1, Ordering::Release);
    }

    pub fn push_sample(&mut self, sample: &Sample) {
        self.push(sample.timestamp, sample.voltage_uv);
    }

    /// Shared read handle to the ring being written
    pub fn ring(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pushed(n: usize, capacity: usize) -> (RingWriter, Arc<RingBuffer>) {
        let (mut writer, ring) = RingBuffer::with_capacity(capacity);
        for i in 0..n {
            writer.push(i as f64, i as f64 * 2.0);
        }
        (writer, ring)
    }

    #[test]
    fn test_empty_snapshot() {
        let (_writer, ring) = RingBuffer::with_capacity(8);
        assert!(ring.snapshot(None).is_empty());
        assert!(ring.snapshot(Some(5)).is_empty());
        assert!(ring.latest().is_none());
        assert_eq!(ring.filled(), 0);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_snapshot_returns_last_pushed_in_order() {
        for &(n, capacity) in &[(3, 8), (8, 8), (9, 8), (25, 8), (1, 1), (5, 1)] {
            let (_writer, ring) = pushed(n, capacity);
            let expected = n.min(capacity);
            let snapshot = ring.snapshot(None);

            assert_eq!(snapshot.len(), expected, "n={} capacity={}", n, capacity);
            for (offset, sample) in snapshot.iter().enumerate() {
                let i = (n - expected + offset) as f64;
                assert_eq!(sample.time, i);
                assert_eq!(sample.voltage, i * 2.0);
            }
        }
    }

    #[test]
    fn test_overwrite_drops_strictly_oldest() {
        let (mut writer, ring) = pushed(4, 4);
        assert_eq!(ring.snapshot(None).first().unwrap().time, 0.0);

        writer.push(4.0, 8.0);
        let times: Vec<f64> = ring.snapshot(None).iter().map(|s| s.time).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0, 4.0]);

        writer.push(5.0, 10.0);
        let times: Vec<f64> = ring.snapshot(None).iter().map(|s| s.time).collect();
        assert_eq!(times, vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_partial_and_oversized_requests() {
        let (_writer, ring) = pushed(10, 6);
        let last_three: Vec<f64> = ring.snapshot(Some(3)).iter().map(|s| s.time).collect();
        assert_eq!(last_three, vec![7.0, 8.0, 9.0]);

        assert_eq!(ring.snapshot(Some(100)).len(), 6);
        assert!(ring.snapshot(Some(0)).is_empty());
        assert_eq!(ring.latest().unwrap().time, 9.0);
    }

    #[test]
    fn test_cursor_and_metrics() {
        let (_writer, ring) = pushed(12, 5);
        assert_eq!(ring.write_cursor(), 12);
        assert_eq!(ring.filled(), 5);

        let metrics = ring.metrics();
        assert_eq!(metrics.capacity, 5);
        assert_eq!(metrics.filled, 5);
        assert_eq!(metrics.write_cursor, 12);

        let (cursor, samples) = ring.snapshot_with_cursor(Some(2));
        assert_eq!(cursor, 12);
        assert_eq!(samples.last().unwrap().time, 11.0);
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let (mut writer, ring) = RingBuffer::with_capacity(0);
        writer.push(1.0, 1.0);
        writer.push(2.0, 2.0);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.snapshot(None), vec![BufferedSample { time: 2.0, voltage: 2.0 }]);
    }
}
