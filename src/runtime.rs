//! Application-level aggregate that wires recorder, broadcaster and sinks

use crate::config::Settings;
use crate::error::{StreamError, StreamResult};
use crate::signal::SignalProcessor;
use crate::streaming::broadcaster::LiveBroadcaster;
use crate::streaming::recorder::SessionRecorder;
use crate::streaming::sink::SinkRegistry;
use crate::streaming::source::SampleSource;
use crate::streaming::types::SessionInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything a host process needs to run acquisition
///
/// Built once by the caller and shared by reference; nothing here is global.
pub struct AcquisitionRuntime {
    settings: Settings,
    recorder: Arc<SessionRecorder>,
    broadcaster: Arc<LiveBroadcaster>,
    sinks: Arc<SinkRegistry>,
    cancel: CancellationToken,
    broadcast_task: Mutex<Option<JoinHandle<()>>>,
}

impl AcquisitionRuntime {
    /// Build the pipeline and start the broadcaster. Must be called inside a
    /// tokio runtime.
    pub fn init(source: Box<dyn SampleSource>, settings: Settings) -> StreamResult<Self> {
        settings.validate()?;
        let processor = SignalProcessor::new(settings.processing.clone())?;

        let recorder = Arc::new(SessionRecorder::new(source, settings.recorder.clone()));
        let sinks = Arc::new(SinkRegistry::new());
        let broadcaster = Arc::new(LiveBroadcaster::new(
            Arc::clone(&recorder),
            Arc::clone(&sinks),
            processor,
            settings.broadcast.clone(),
        ));

        let cancel = CancellationToken::new();
        let task = Arc::clone(&broadcaster).spawn(cancel.child_token());

        log::info!(
            "Acquisition runtime ready (ring {} samples, data dir {})",
            settings.recorder.ring_capacity,
            settings
                .recorder
                .data_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(Self {
            settings,
            recorder,
            broadcaster,
            sinks,
            cancel,
            broadcast_task: Mutex::new(Some(task)),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn recorder(&self) -> &Arc<SessionRecorder> {
        &self.recorder
    }

    pub fn broadcaster(&self) -> &Arc<LiveBroadcaster> {
        &self.broadcaster
    }

    pub fn sinks(&self) -> &Arc<SinkRegistry> {
        &self.sinks
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); hosts can tie their own
    /// tasks to it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the current session and publish its final live update.
    ///
    /// The returned summary includes peaks reported by that last update. A
    /// stop timeout is still flushed before the error is returned.
    pub async fn stop(&self) -> StreamResult<SessionInfo> {
        let stopped = self.recorder.stop().await;
        if stopped.is_ok() || matches!(stopped, Err(StreamError::Timeout(_))) {
            self.broadcaster.flush().await;
        }
        let info = stopped?;
        Ok(self.last_session_info().unwrap_or(info))
    }

    /// Summary of the most recently ended session, after its final live
    /// update has gone out. Use this when the session ended on its own.
    pub async fn finished_session(&self) -> Option<SessionInfo> {
        self.broadcaster.flush().await;
        self.last_session_info()
    }

    fn last_session_info(&self) -> Option<SessionInfo> {
        self.recorder.last_session().map(|s| s.info())
    }

    /// Finalize any recording, stop the broadcaster and release the source.
    pub async fn shutdown(&self) -> StreamResult<()> {
        log::info!("Shutting down acquisition runtime");
        match self.stop().await {
            Ok(_) | Err(StreamError::NotRecording) => {}
            Err(e) => log::warn!("Error stopping recording during shutdown: {}", e),
        }
        self.cancel.cancel();

        let task = self.broadcast_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Broadcaster task failed: {}", e);
            }
        }

        self.recorder.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionConfig;
    use crate::streaming::broadcaster::TickOutcome;
    use crate::streaming::sink::ChannelSink;
    use crate::streaming::source::ScriptedSource;
    use crate::streaming::types::{RecordingState, Sample};
    use std::time::Duration;

    #[tokio::test]
    async fn test_runtime_streams_and_shuts_down() {
        let samples: Vec<Sample> = (0..30)
            .map(|i| Sample::new(i as f64 * 0.1, 1, 0, 1.0))
            .collect();
        let source = ScriptedSource::from_samples(samples, 10)
            .batch_delay(Duration::from_millis(5))
            .hold_open(true);

        let mut settings = Settings::default();
        settings.broadcast.interval_ms = 10;
        let runtime = AcquisitionRuntime::init(Box::new(source), settings).unwrap();

        let (sink, mut rx) = ChannelSink::new("test", 64);
        runtime.sinks().register(Arc::new(sink));
        runtime
            .recorder()
            .start(AcquisitionConfig::default())
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!payload.times.is_empty());

        runtime.shutdown().await.unwrap();
        assert_eq!(runtime.recorder().state(), RecordingState::Idle);
        assert!(!runtime.recorder().is_connected());
        assert!(runtime.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_reports_peak_in_last_samples() {
        // One bump whose top sits two samples before the end of the session
        let samples: Vec<Sample> = (0..60usize)
            .map(|i| {
                let v = match i.abs_diff(57) {
                    0 => 80.0,
                    1 => 60.0,
                    2 => 30.0,
                    _ => 0.0,
                };
                Sample::new(i as f64 * 0.1, 1, 0, v)
            })
            .collect();
        let source = ScriptedSource::from_samples(samples, 60).hold_open(true);

        let mut settings = Settings::default();
        settings.broadcast.interval_ms = 60_000;
        let runtime = AcquisitionRuntime::init(Box::new(source), settings).unwrap();
        let (sink, mut rx) = ChannelSink::new("test", 8);
        runtime.sinks().register(Arc::new(sink));

        let recorder = runtime.recorder();
        recorder.start(AcquisitionConfig::default()).await.unwrap();
        for _ in 0..200 {
            if recorder.active_session().is_some_and(|s| s.sample_count() == 60) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The tail peak has not settled for the live tick
        let live = runtime.broadcaster().tick().await;
        assert!(!matches!(live, TickOutcome::Published { ref payload, .. } if !payload.peaks.is_empty()));

        let info = runtime.stop().await.unwrap();
        assert_eq!(info.peak_count, 1);

        let mut payloads = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            payloads.push(payload);
        }
        let sent: usize = payloads.iter().map(|p| p.times.len()).sum();
        assert_eq!(sent, 60);

        let last = payloads.last().unwrap();
        assert!(last.times.is_empty());
        assert_eq!(last.peaks.len(), 1);
        assert!((last.peaks[0].time - 5.7).abs() < 1e-9);
        assert_eq!(last.stats.peak_count, 1);

        assert!(runtime.finished_session().await.is_some_and(|s| s.peak_count == 1));
        runtime.shutdown().await.unwrap();
    }

    #[test]
    fn test_init_rejects_invalid_settings() {
        let mut settings = Settings::default();
        settings.processing.smoothing_window = 4;
        let result = AcquisitionRuntime::init(Box::new(ScriptedSource::new(Vec::new())), settings);
        assert!(result.is_err());
    }
}
