// Live broadcaster - fixed-cadence processing and fan-out to sinks
//
// On every tick the broadcaster reads the newest samples of the active
// session's ring plus a trailing context window, runs the signal processor
// over the window and publishes raw values, filtered values, newly settled
// peaks and running statistics to every registered sink.
//
// Two watermarks track progress: the ring cursor already sent, and the time
// of the newest peak already reported. Both reset when a new session starts.
// Peaks closer than half a smoothing window to the newest sample wait for the
// next tick; once the session has ended they are flushed in a final pass.

use crate::config::BroadcastSettings;
use crate::signal::{Peak, Polarity, SignalProcessor};
use crate::streaming::recorder::SessionRecorder;
use crate::streaming::session::ActiveSession;
use crate::streaming::sink::{PublishReport, SinkRegistry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A peak as sent to live clients
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakReport {
    pub time: f64,
    pub height_uv: f64,
    pub width_s: f64,
    pub polarity: Polarity,
}

impl From<&Peak> for PeakReport {
    fn from(peak: &Peak) -> Self {
        Self {
            time: peak.time,
            height_uv: peak.height,
            width_s: peak.width,
            polarity: peak.polarity,
        }
    }
}

/// Running session statistics included with every payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveStats {
    pub sample_count: u64,
    pub peak_count: u64,
    pub elapsed_s: f64,
    /// Reported peaks per second of session time
    pub spike_freq_hz: f64,
    pub latest_uv: f64,
}

/// One live update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePayload {
    pub session_id: String,
    pub times: Vec<f64>,
    pub raw_uv: Vec<f64>,
    pub filtered_uv: Vec<f64>,
    pub peaks: Vec<PeakReport>,
    pub stats: LiveStats,
}

/// What a single tick did
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// Not recording, or nobody listening
    Skipped,
    /// Nothing written since the last tick
    NoNewData,
    Published {
        payload: Arc<LivePayload>,
        report: PublishReport,
    },
}

#[derive(Debug)]
struct Watermarks {
    session: Option<Arc<ActiveSession>>,
    cursor: u64,
    peak_time: f64,
    flushed: bool,
}

impl Watermarks {
    fn new() -> Self {
        Self {
            session: None,
            cursor: 0,
            peak_time: f64::NEG_INFINITY,
            flushed: false,
        }
    }

    /// Start over when `session` is not the one being tracked.
    fn track(&mut self, session: &Arc<ActiveSession>) {
        let same = self
            .session
            .as_ref()
            .is_some_and(|s| s.serial() == session.serial());
        if !same {
            *self = Self::new();
            self.session = Some(Arc::clone(session));
        }
    }
}

pub struct LiveBroadcaster {
    recorder: Arc<SessionRecorder>,
    sinks: Arc<SinkRegistry>,
    processor: SignalProcessor,
    settings: BroadcastSettings,
    watermarks: Mutex<Watermarks>,
}

impl LiveBroadcaster {
    pub fn new(
        recorder: Arc<SessionRecorder>,
        sinks: Arc<SinkRegistry>,
        processor: SignalProcessor,
        settings: BroadcastSettings,
    ) -> Self {
        Self {
            recorder,
            sinks,
            processor,
            settings,
            watermarks: Mutex::new(Watermarks::new()),
        }
    }

    pub fn sinks(&self) -> &Arc<SinkRegistry> {
        &self.sinks
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.settings
    }

    /// Run one broadcast cycle.
    pub async fn tick(&self) -> TickOutcome {
        if let Some(outcome @ TickOutcome::Published { .. }) = self.flush().await {
            return outcome;
        }

        let session = match self.recorder.active_session() {
            Some(session) if self.recorder.is_recording() => session,
            _ => return TickOutcome::Skipped,
        };

        if self.sinks.is_empty() {
            self.catch_up(&session);
            return TickOutcome::Skipped;
        }

        let payload = {
            let mut marks = self.watermarks.lock();
            marks.track(&session);
            self.build_payload(&mut marks, &session, false)
        };
        match payload {
            Some(payload) => self.publish(payload).await,
            None => TickOutcome::NoNewData,
        }
    }

    /// Final pass over the tracked session once it has ended: sends samples
    /// written since the last tick and every peak still waiting to settle.
    ///
    /// Returns `None` if there is no ended session left to flush. Each
    /// session is flushed at most once.
    pub async fn flush(&self) -> Option<TickOutcome> {
        let payload = {
            let mut marks = self.watermarks.lock();
            let session = match &marks.session {
                Some(session) if session.is_finished() && !marks.flushed => Arc::clone(session),
                _ => return None,
            };
            marks.flushed = true;

            if self.sinks.is_empty() {
                log::debug!("No sinks registered, session {} not flushed", session.id());
                return Some(TickOutcome::Skipped);
            }
            self.build_payload(&mut marks, &session, true)
        };

        Some(match payload {
            Some(payload) => self.publish(payload).await,
            None => TickOutcome::NoNewData,
        })
    }

    async fn publish(&self, payload: LivePayload) -> TickOutcome {
        let payload = Arc::new(payload);
        log::debug!(
            "Broadcasting {} samples, {} peaks for session {}",
            payload.times.len(),
            payload.peaks.len(),
            payload.session_id
        );

        let report = self
            .sinks
            .publish_all(Arc::clone(&payload), self.settings.sink_timeout())
            .await;
        TickOutcome::Published { payload, report }
    }

    /// Move the watermarks to the present without sending anything.
    fn catch_up(&self, session: &Arc<ActiveSession>) {
        let mut marks = self.watermarks.lock();
        marks.track(session);

        let (cursor, latest) = session.ring().snapshot_with_cursor(Some(1));
        marks.cursor = cursor;
        if let Some(sample) = latest.last() {
            marks.peak_time = marks.peak_time.max(sample.time);
        }
    }

    /// Build the next payload and advance the watermarks. On the final pass
    /// peaks are reported without waiting for them to settle, and the
    /// payload may carry peaks but no new samples.
    fn build_payload(
        &self,
        marks: &mut Watermarks,
        session: &ActiveSession,
        final_pass: bool,
    ) -> Option<LivePayload> {
        let cap = self.settings.cap_per_tick;
        let (cursor, window) = session
            .ring()
            .snapshot_with_cursor(Some(self.settings.context_window.max(cap)));

        let new_count = (cursor.saturating_sub(marks.cursor) as usize)
            .min(cap)
            .min(window.len());
        marks.cursor = cursor;
        if new_count == 0 && !final_pass {
            return None;
        }

        let times: Vec<f64> = window.iter().map(|s| s.time).collect();
        let voltages: Vec<f64> = window.iter().map(|s| s.voltage).collect();
        let display_from = window.len() - new_count;

        let (filtered, peaks) = if window.len() >= self.processor.params().smoothing_window {
            let result = self.processor.process_window(&times, &voltages);
            let settled_before = if final_pass {
                window.len()
            } else {
                window.len().saturating_sub(self.processor.settle_margin())
            };
            let peaks: Vec<PeakReport> = result
                .peaks
                .iter()
                .filter(|p| p.index < settled_before && p.time > marks.peak_time)
                .map(PeakReport::from)
                .collect();
            (result.filtered[display_from..].to_vec(), peaks)
        } else {
            (voltages[display_from..].to_vec(), Vec::new())
        };

        if new_count == 0 && peaks.is_empty() {
            return None;
        }
        if let Some(newest) = peaks.iter().map(|p| p.time).reduce(f64::max) {
            marks.peak_time = newest;
        }

        let peak_count = if peaks.is_empty() {
            session.peak_count()
        } else {
            session.add_peaks(peaks.len() as u64)
        };
        let elapsed_s = session.elapsed_s();
        let raw_uv = voltages[display_from..].to_vec();

        Some(LivePayload {
            session_id: session.id().to_string(),
            stats: LiveStats {
                sample_count: session.sample_count(),
                peak_count,
                elapsed_s,
                spike_freq_hz: if elapsed_s > 0.0 {
                    peak_count as f64 / elapsed_s
                } else {
                    0.0
                },
                latest_uv: window.last().map(|s| s.voltage).unwrap_or(0.0),
            },
            times: times[display_from..].to_vec(),
            raw_uv,
            filtered_uv: filtered,
            peaks,
        })
    }

    /// Tick on a fixed cadence until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval(self.settings.interval());
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!(
                "Live broadcaster started ({} ms interval)",
                self.settings.interval_ms
            );

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        log::info!("Live broadcaster cancelled");
                        break;
                    }

                    _ = tick.tick() => {
                        if let TickOutcome::Published { report, .. } = self.tick().await {
                            if report.removed > 0 {
                                log::info!("{} sink(s) removed, {} remaining", report.removed, self.sinks.len());
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionConfig;
    use crate::config::RecorderSettings;
    use crate::signal::ProcessingParams;
    use crate::streaming::sink::ChannelSink;
    use crate::streaming::source::{ScriptStep, ScriptedSource};
    use crate::streaming::types::Sample;
    use std::time::Duration;

    /// Flat signal with one smooth positive bump centred on `centre`
    fn bump_samples(range: std::ops::Range<usize>, centre: usize) -> Vec<Sample> {
        range
            .map(|i| {
                let v = match i.abs_diff(centre) {
                    0 => 80.0,
                    1 => 60.0,
                    2 => 30.0,
                    _ => 0.0,
                };
                Sample::new(i as f64 * 0.1, 1, 0, v)
            })
            .collect()
    }

    fn broadcaster(recorder: &Arc<SessionRecorder>) -> LiveBroadcaster {
        LiveBroadcaster::new(
            Arc::clone(recorder),
            Arc::new(SinkRegistry::new()),
            SignalProcessor::new(ProcessingParams::default()).unwrap(),
            BroadcastSettings::default(),
        )
    }

    async fn wait_for_samples(recorder: &SessionRecorder, n: u64) {
        for _ in 0..200 {
            if recorder.active_session().is_some_and(|s| s.sample_count() >= n) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("samples did not arrive");
    }

    #[tokio::test]
    async fn test_skips_when_idle() {
        let recorder = Arc::new(SessionRecorder::new(
            Box::new(ScriptedSource::new(Vec::new())),
            RecorderSettings::default(),
        ));
        let broadcaster = broadcaster(&recorder);
        let (sink, _rx) = ChannelSink::new("ui", 4);
        broadcaster.sinks().register(Arc::new(sink));

        assert!(matches!(broadcaster.tick().await, TickOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_skipped_tick_advances_watermark() {
        let source = ScriptedSource::from_samples(bump_samples(0..30, 100), 10).hold_open(true);
        let recorder = Arc::new(SessionRecorder::new(Box::new(source), RecorderSettings::default()));
        let broadcaster = broadcaster(&recorder);

        recorder.start(AcquisitionConfig::default()).await.unwrap();
        wait_for_samples(&recorder, 30).await;

        assert!(matches!(broadcaster.tick().await, TickOutcome::Skipped));

        let (sink, _rx) = ChannelSink::new("ui", 4);
        broadcaster.sinks().register(Arc::new(sink));
        assert!(matches!(broadcaster.tick().await, TickOutcome::NoNewData));

        // A new session starts from its own beginning
        recorder.stop().await.unwrap();
        recorder.start(AcquisitionConfig::default()).await.unwrap();
        wait_for_samples(&recorder, 30).await;

        match broadcaster.tick().await {
            TickOutcome::Published { payload, .. } => {
                assert_eq!(payload.times.len(), 30);
                assert_eq!(payload.times[0], 0.0);
            }
            other => panic!("expected a payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peak_deferred_until_settled_and_reported_once() {
        let source = ScriptedSource::new(vec![
            ScriptStep::Batch(bump_samples(0..34, 30)),
            ScriptStep::Pause(Duration::from_millis(500)),
            ScriptStep::Batch(bump_samples(34..60, 30)),
        ])
        .hold_open(true);
        let recorder = Arc::new(SessionRecorder::new(Box::new(source), RecorderSettings::default()));
        let broadcaster = broadcaster(&recorder);
        let (sink, mut rx) = ChannelSink::new("ui", 8);
        broadcaster.sinks().register(Arc::new(sink));

        recorder.start(AcquisitionConfig::default()).await.unwrap();
        wait_for_samples(&recorder, 34).await;

        match broadcaster.tick().await {
            TickOutcome::Published { payload, report } => {
                assert_eq!(payload.raw_uv.len(), 34);
                assert_eq!(payload.filtered_uv.len(), 34);
                assert!(payload.peaks.is_empty());
                assert_eq!(report.delivered, 1);
            }
            other => panic!("expected a payload, got {:?}", other),
        }

        wait_for_samples(&recorder, 60).await;
        match broadcaster.tick().await {
            TickOutcome::Published { payload, .. } => {
                assert_eq!(payload.times.len(), 26);
                assert!((payload.times[0] - 3.4).abs() < 1e-9);
                assert_eq!(payload.peaks.len(), 1);
                let peak = payload.peaks[0];
                assert!((peak.time - 3.0).abs() < 1e-9);
                assert_eq!(peak.polarity, Polarity::Positive);
                assert!(peak.height_uv > 40.0);
                assert_eq!(payload.stats.peak_count, 1);
                assert_eq!(payload.stats.sample_count, 60);
                assert_eq!(payload.stats.latest_uv, 0.0);
            }
            other => panic!("expected a payload, got {:?}", other),
        }

        assert!(matches!(broadcaster.tick().await, TickOutcome::NoNewData));
        assert_eq!(recorder.active_session().unwrap().peak_count(), 1);
        assert_eq!(rx.recv().await.unwrap().raw_uv.len(), 34);
    }

    #[tokio::test]
    async fn test_tail_peak_flushed_after_stop() {
        let source = ScriptedSource::from_samples(bump_samples(0..60, 57), 60).hold_open(true);
        let recorder = Arc::new(SessionRecorder::new(Box::new(source), RecorderSettings::default()));
        let broadcaster = broadcaster(&recorder);
        let (sink, _rx) = ChannelSink::new("ui", 8);
        broadcaster.sinks().register(Arc::new(sink));

        recorder.start(AcquisitionConfig::default()).await.unwrap();
        wait_for_samples(&recorder, 60).await;

        match broadcaster.tick().await {
            TickOutcome::Published { payload, .. } => {
                assert_eq!(payload.times.len(), 60);
                assert!(payload.peaks.is_empty());
            }
            other => panic!("expected a payload, got {:?}", other),
        }

        recorder.stop().await.unwrap();
        match broadcaster.tick().await {
            TickOutcome::Published { payload, .. } => {
                assert!(payload.times.is_empty());
                assert_eq!(payload.peaks.len(), 1);
                assert!((payload.peaks[0].time - 5.7).abs() < 1e-9);
                assert_eq!(payload.stats.peak_count, 1);
            }
            other => panic!("expected the final payload, got {:?}", other),
        }
        assert_eq!(recorder.last_session().unwrap().peak_count(), 1);

        assert!(broadcaster.flush().await.is_none());
        assert!(matches!(broadcaster.tick().await, TickOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_new_samples_capped_per_tick() {
        let source = ScriptedSource::from_samples(bump_samples(0..250, 1000), 50).hold_open(true);
        let recorder = Arc::new(SessionRecorder::new(Box::new(source), RecorderSettings::default()));
        let broadcaster = broadcaster(&recorder);
        let (sink, _rx) = ChannelSink::new("ui", 8);
        broadcaster.sinks().register(Arc::new(sink));

        recorder.start(AcquisitionConfig::default()).await.unwrap();
        wait_for_samples(&recorder, 250).await;

        match broadcaster.tick().await {
            TickOutcome::Published { payload, .. } => {
                assert_eq!(payload.times.len(), 100);
                assert!((payload.times[99] - 24.9).abs() < 1e-9);
            }
            other => panic!("expected a payload, got {:?}", other),
        }
        assert!(matches!(broadcaster.tick().await, TickOutcome::NoNewData));
    }

    #[tokio::test]
    async fn test_spawned_task_publishes_and_cancels() {
        let source = ScriptedSource::from_samples(bump_samples(0..20, 100), 5)
            .batch_delay(Duration::from_millis(5))
            .hold_open(true);
        let recorder = Arc::new(SessionRecorder::new(Box::new(source), RecorderSettings::default()));
        let broadcaster = Arc::new(LiveBroadcaster::new(
            Arc::clone(&recorder),
            Arc::new(SinkRegistry::new()),
            SignalProcessor::new(ProcessingParams::default()).unwrap(),
            BroadcastSettings {
                interval_ms: 10,
                ..Default::default()
            },
        ));
        let (sink, mut rx) = ChannelSink::new("ui", 64);
        broadcaster.sinks().register(Arc::new(sink));

        let cancel = CancellationToken::new();
        let task = Arc::clone(&broadcaster).spawn(cancel.clone());
        recorder.start(AcquisitionConfig::default()).await.unwrap();

        let mut received = 0;
        while received < 20 {
            let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            received += payload.times.len();
        }
        assert_eq!(received, 20);

        cancel.cancel();
        task.await.unwrap();
        recorder.stop().await.unwrap();
    }
}
