// Replay source that plays back a recorded session CSV
//
// Useful for:
// - Re-running the live pipeline over an earlier recording
// - Testing without hardware
// - Demos with real data

use super::{SampleSource, SampleStream, SourceMetadata};
use crate::acquisition::AcquisitionConfig;
use crate::error::{StreamError, StreamResult};
use crate::persistence::load_session;
use crate::streaming::types::Sample;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

pub struct ReplaySource {
    path: PathBuf,
    speed: Option<f64>,
    loop_playback: bool,
    samples: Option<Arc<Vec<Sample>>>,
    channels: Vec<u8>,
}

impl ReplaySource {
    pub fn new(path: PathBuf, speed: Option<f64>, loop_playback: bool) -> StreamResult<Self> {
        if let Some(speed) = speed {
            if !(speed.is_finite() && speed > 0.0) {
                return Err(StreamError::InvalidConfig(format!(
                    "Replay speed must be positive, got {}",
                    speed
                )));
            }
        }

        Ok(Self {
            path,
            speed,
            loop_playback,
            samples: None,
            channels: Vec::new(),
        })
    }

    fn recorded_channels(&self) -> BTreeSet<u8> {
        self.samples
            .iter()
            .flat_map(|samples| samples.iter().map(|s| s.channel))
            .collect()
    }
}

/// Group consecutive samples that share a timestamp into one batch.
fn rounds(samples: &[Sample]) -> Vec<&[Sample]> {
    samples
        .chunk_by(|a, b| a.timestamp == b.timestamp)
        .collect()
}

#[async_trait]
impl SampleSource for ReplaySource {
    async fn connect(&mut self) -> StreamResult<()> {
        if self.samples.is_some() {
            return Ok(());
        }

        let path = self.path.clone();
        let samples = tokio::task::spawn_blocking(move || load_session(&path))
            .await
            .map_err(|e| StreamError::Connection(format!("Replay loader failed: {}", e)))?
            .map_err(|e| {
                StreamError::Connection(format!("Cannot open {}: {}", self.path.display(), e))
            })?;

        if samples.is_empty() {
            return Err(StreamError::Connection(format!(
                "{} contains no samples",
                self.path.display()
            )));
        }

        log::info!(
            "Loaded {} samples for replay from {}",
            samples.len(),
            self.path.display()
        );
        self.samples = Some(Arc::new(samples));
        self.channels = self.recorded_channels().into_iter().collect();
        Ok(())
    }

    async fn configure(&mut self, config: &AcquisitionConfig) -> StreamResult<()> {
        config.validate()?;
        if self.samples.is_none() {
            return Err(StreamError::InvalidConfig(format!(
                "{} is not loaded",
                self.path.display()
            )));
        }
        let recorded = self.recorded_channels();
        let enabled: Vec<u8> = config
            .enabled_channels()
            .map(|c| c.channel)
            .filter(|c| recorded.is_empty() || recorded.contains(c))
            .collect();

        if enabled.is_empty() {
            return Err(StreamError::InvalidConfig(format!(
                "None of the enabled channels are present in {}",
                self.path.display()
            )));
        }

        self.channels = enabled;
        Ok(())
    }

    fn stream(&mut self) -> SampleStream<'_> {
        let samples = self.samples.clone();
        let channels = self.channels.clone();
        let speed = self.speed;
        let loop_playback = self.loop_playback;

        Box::pin(async_stream::stream! {
            let Some(samples) = samples else {
                yield Err(StreamError::FatalSource("Replay source not connected".to_string()));
                return;
            };

            let first = samples[0].timestamp;
            let last = samples[samples.len() - 1].timestamp;
            let span = (last - first).max(0.0)
                + crate::signal::mean_interval(
                    &samples.iter().map(|s| s.timestamp).collect::<Vec<_>>(),
                    0.1,
                );
            let mut offset = 0.0;
            let mut previous: Option<f64> = None;

            loop {
                for round in rounds(&samples) {
                    let batch: Vec<Sample> = round
                        .iter()
                        .filter(|s| channels.contains(&s.channel))
                        .map(|s| Sample {
                            timestamp: s.timestamp - first + offset,
                            ..*s
                        })
                        .collect();
                    let Some(t) = batch.first().map(|s| s.timestamp) else {
                        continue;
                    };

                    match (speed, previous) {
                        (Some(speed), Some(prev)) if t > prev => {
                            sleep(Duration::from_secs_f64((t - prev) / speed)).await;
                        }
                        (None, _) => tokio::task::yield_now().await,
                        _ => {}
                    }
                    previous = Some(t);
                    yield Ok(batch);
                }

                if !loop_playback {
                    log::info!("Replay reached end of file");
                    break;
                }
                offset += span;
            }
        })
    }

    async fn stop(&mut self) -> StreamResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> StreamResult<()> {
        self.samples = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.samples.is_some()
    }

    fn metadata(&self) -> SourceMetadata {
        let interval = self
            .samples
            .as_ref()
            .map(|samples| {
                let times: Vec<f64> = samples.iter().map(|s| s.timestamp).collect();
                crate::signal::mean_interval(&times, 0.1)
            })
            .unwrap_or(0.1);

        SourceMetadata {
            kind: "replay".to_string(),
            channels: self.channels.clone(),
            sample_interval_ms: (interval * 1000.0).round() as u64,
            simulated: true,
            properties: [
                ("file_path".to_string(), self.path.display().to_string()),
                ("loop_playback".to_string(), self.loop_playback.to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SessionCsvWriter;
    use futures::StreamExt;
    use tempfile::TempDir;

    fn write_session(dir: &TempDir, samples: &[Sample]) -> PathBuf {
        let path = dir.path().join("session_test.csv");
        let mut writer = SessionCsvWriter::create(&path).unwrap();
        for s in samples {
            writer.append(s).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn recorded() -> Vec<Sample> {
        (0..10)
            .map(|i| Sample::new(1.0 + i as f64 * 0.1, 1, i * 100, i as f64 * 2.5))
            .collect()
    }

    #[tokio::test]
    async fn test_replays_recorded_session() {
        let dir = TempDir::new().unwrap();
        let path = write_session(&dir, &recorded());

        let mut source = ReplaySource::new(path, None, false).unwrap();
        source.connect().await.unwrap();
        let replayed: Vec<Sample> = source.stream().map(|b| b.unwrap()).concat().await;

        assert_eq!(replayed.len(), 10);
        for (i, s) in replayed.iter().enumerate() {
            assert!((s.timestamp - i as f64 * 0.1).abs() < 1e-9);
            assert_eq!(s.raw_count, i as i32 * 100);
            assert_eq!(s.voltage_uv, i as f64 * 2.5);
        }
    }

    #[tokio::test]
    async fn test_looping_keeps_time_increasing() {
        let dir = TempDir::new().unwrap();
        let path = write_session(&dir, &recorded());

        let mut source = ReplaySource::new(path, None, true).unwrap();
        source.connect().await.unwrap();
        let replayed: Vec<Sample> = source
            .stream()
            .take(25)
            .map(|b| b.unwrap())
            .concat()
            .await;

        assert_eq!(replayed.len(), 25);
        assert!(replayed.windows(2).all(|w| w[1].timestamp > w[0].timestamp));
        assert!((replayed[10].timestamp - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_configure_filters_channels() {
        let dir = TempDir::new().unwrap();
        let path = write_session(&dir, &recorded());

        let mut source = ReplaySource::new(path, None, false).unwrap();
        source.connect().await.unwrap();

        let err = source
            .configure(&AcquisitionConfig::single(5, Default::default(), true))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));
        source.configure(&AcquisitionConfig::default()).await.unwrap();
        assert_eq!(source.metadata().channels, vec![1]);
    }

    #[tokio::test]
    async fn test_missing_file_is_connection_error() {
        let mut source = ReplaySource::new(PathBuf::from("/nonexistent/session.csv"), None, false)
            .unwrap();
        assert!(matches!(
            source.connect().await,
            Err(StreamError::Connection(_))
        ));
        assert!(ReplaySource::new(PathBuf::from("x.csv"), Some(-1.0), false).is_err());
    }
}
