// Payload sinks for the live broadcaster
//
// A sink is anything that accepts live payloads: a bounded channel feeding a
// UI or socket task, or a newline-delimited JSON writer task. Sinks are held in a
// registry; a publish fans out to all of them concurrently with a per-sink
// deadline.

use crate::error::{StreamError, StreamResult};
use crate::streaming::broadcaster::LivePayload;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Receives payloads from the broadcaster
///
/// An `Err` from `publish` means the sink is gone and it will be removed from
/// the registry.
#[async_trait]
pub trait PayloadSink: Send + Sync {
    async fn publish(&self, payload: Arc<LivePayload>) -> StreamResult<()>;

    fn name(&self) -> &str;
}

/// Bounded channel sink; payloads are dropped while the receiver lags
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<Arc<LivePayload>>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<LivePayload>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            name: name.into(),
            tx,
            dropped: AtomicU64::new(0),
        };
        (sink, rx)
    }

    /// Payloads dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PayloadSink for ChannelSink {
    async fn publish(&self, payload: Arc<LivePayload>) -> StreamResult<()> {
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(StreamError::SinkClosed),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Writes each payload as one JSON line
///
/// `publish` only queues the encoded line. A writer task owns the output, so
/// a publish cut short by the registry deadline never leaves half a line
/// behind. Lines are dropped while the queue is full. A write error ends the
/// task and the sink reports itself closed.
pub struct NdjsonSink {
    name: String,
    lines: mpsc::Sender<Vec<u8>>,
    dropped: AtomicU64,
}

impl NdjsonSink {
    /// Spawn the writer task. The task flushes and exits once the sink is
    /// dropped, or fails on the first write error.
    pub fn spawn<W>(
        name: impl Into<String>,
        writer: W,
        capacity: usize,
    ) -> (Self, JoinHandle<StreamResult<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let (lines, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(write_lines(name.clone(), writer, rx));
        let sink = Self {
            name,
            lines,
            dropped: AtomicU64::new(0),
        };
        (sink, task)
    }

    /// Lines dropped because the writer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn write_lines<W>(
    name: String,
    mut writer: W,
    mut lines: mpsc::Receiver<Vec<u8>>,
) -> StreamResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        let written = async {
            writer.write_all(&line).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            log::warn!("Sink {} stopped after write error: {}", name, e);
            return Err(e.into());
        }
    }
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl PayloadSink for NdjsonSink {
    async fn publish(&self, payload: Arc<LivePayload>) -> StreamResult<()> {
        let mut line = serde_json::to_vec(payload.as_ref())?;
        line.push(b'\n');

        match self.lines.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Sink {} is behind, payload dropped", self.name);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(StreamError::SinkClosed),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub type SinkId = u64;

/// Outcome of publishing one payload to every sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub timed_out: usize,
    pub removed: usize,
}

/// Registered sinks, keyed by registration order
#[derive(Default)]
pub struct SinkRegistry {
    sinks: RwLock<BTreeMap<SinkId, Arc<dyn PayloadSink>>>,
    next_id: AtomicU64,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn PayloadSink>) -> SinkId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::info!("Sink registered: {} (id {})", sink.name(), id);
        self.sinks.write().insert(id, sink);
        id
    }

    pub fn unregister(&self, id: SinkId) -> bool {
        let removed = self.sinks.write().remove(&id);
        if let Some(sink) = &removed {
            log::info!("Sink unregistered: {} (id {})", sink.name(), id);
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    /// Publish to every sink concurrently, each bounded by `timeout`.
    ///
    /// Sinks that fail are removed. Sinks that time out stay registered and
    /// miss this payload.
    pub async fn publish_all(&self, payload: Arc<LivePayload>, timeout: Duration) -> PublishReport {
        let sinks: Vec<(SinkId, Arc<dyn PayloadSink>)> = self
            .sinks
            .read()
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();

        let deliveries = sinks.into_iter().map(|(id, sink)| {
            let payload = Arc::clone(&payload);
            async move {
                let result = tokio::time::timeout(timeout, sink.publish(payload)).await;
                (id, sink, result)
            }
        });

        let mut report = PublishReport::default();
        for (id, sink, result) in join_all(deliveries).await {
            match result {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    log::warn!("Removing sink {} after publish error: {}", sink.name(), e);
                    self.sinks.write().remove(&id);
                    report.removed += 1;
                }
                Err(_) => {
                    log::debug!("Sink {} timed out, payload dropped", sink.name());
                    report.timed_out += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::broadcaster::LiveStats;
    use tokio::io::AsyncReadExt;

    fn payload(session_id: &str) -> Arc<LivePayload> {
        Arc::new(LivePayload {
            session_id: session_id.to_string(),
            times: vec![0.0, 0.1],
            raw_uv: vec![1.0, 2.0],
            filtered_uv: vec![0.0, 0.0],
            peaks: Vec::new(),
            stats: LiveStats::default(),
        })
    }

    struct SlowSink;

    #[async_trait]
    impl PayloadSink for SlowSink {
        async fn publish(&self, _payload: Arc<LivePayload>) -> StreamResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new("ui", 1);
        sink.publish(payload("a")).await.unwrap();
        sink.publish(payload("b")).await.unwrap();
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().session_id, "a");

        drop(rx);
        assert!(matches!(
            sink.publish(payload("c")).await,
            Err(StreamError::SinkClosed)
        ));
    }

    #[tokio::test]
    async fn test_ndjson_sink_writes_lines() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let (sink, task) = NdjsonSink::spawn("stdout", writer, 8);
        sink.publish(payload("a")).await.unwrap();
        sink.publish(payload("b")).await.unwrap();
        drop(sink);

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        task.await.unwrap().unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["session_id"], "a");
        assert_eq!(first["raw_uv"][1], 2.0);
    }

    #[tokio::test]
    async fn test_ndjson_lines_stay_whole_behind_slow_reader() {
        // The pipe holds less than one line, so every write stalls midway
        let (writer, mut reader) = tokio::io::duplex(32);
        let (sink, task) = NdjsonSink::spawn("live", writer, 4);
        let registry = SinkRegistry::new();
        registry.register(Arc::new(sink));

        for id in ["a", "b"] {
            let report = registry
                .publish_all(payload(id), Duration::from_millis(5))
                .await;
            assert_eq!(report.delivered, 1);
            assert_eq!(report.timed_out, 0);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(registry);

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        task.await.unwrap().unwrap();

        let ids: Vec<String> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["session_id"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_ndjson_sink_closes_on_write_error() {
        let (writer, reader) = tokio::io::duplex(32);
        drop(reader);
        let (sink, task) = NdjsonSink::spawn("live", writer, 4);

        sink.publish(payload("a")).await.unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(matches!(
            sink.publish(payload("b")).await,
            Err(StreamError::SinkClosed)
        ));
    }

    #[tokio::test]
    async fn test_registry_removes_closed_and_keeps_slow() {
        let registry = SinkRegistry::new();
        let (open, mut open_rx) = ChannelSink::new("open", 4);
        let (closed, closed_rx) = ChannelSink::new("closed", 4);
        drop(closed_rx);

        registry.register(Arc::new(open));
        registry.register(Arc::new(closed));
        registry.register(Arc::new(SlowSink));
        assert_eq!(registry.len(), 3);

        let report = registry
            .publish_all(payload("s"), Duration::from_millis(20))
            .await;
        assert_eq!(
            report,
            PublishReport {
                delivered: 1,
                timed_out: 1,
                removed: 1
            }
        );
        assert_eq!(registry.len(), 2);
        assert!(open_rx.recv().await.is_some());
    }

    #[test]
    fn test_register_unregister() {
        let registry = SinkRegistry::new();
        assert!(registry.is_empty());
        let (sink, _rx) = ChannelSink::new("ui", 1);
        let id = registry.register(Arc::new(sink));
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }
}
