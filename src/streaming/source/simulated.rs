// Simulated source producing fungal-like action potentials
//
// Baseline is Gaussian noise (~2 µV RMS). Spikes occur at roughly 0.12 Hz
// with amplitudes around 135 ± 70 µV, mostly positive. Useful for demos and
// development without the logger attached.

use super::{SampleSource, SampleStream, SourceMetadata};
use crate::acquisition::{AcquisitionConfig, ChannelConfig};
use crate::error::{StreamError, StreamResult};
use crate::streaming::types::Sample;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Time between simulated samples (10 S/s)
pub const SIMULATED_DT: f64 = 0.1;

/// Parameters of the synthetic signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeModel {
    pub noise_sd_uv: f64,
    /// Chance of a spike on any given sample
    pub spike_probability: f64,
    pub amplitude_mean_uv: f64,
    pub amplitude_sd_uv: f64,
    pub min_amplitude_uv: f64,
    pub positive_fraction: f64,
    /// Negative spikes are scaled by this factor
    pub negative_scale: f64,
}

impl Default for SpikeModel {
    fn default() -> Self {
        Self {
            noise_sd_uv: 2.0,
            spike_probability: 0.012,
            amplitude_mean_uv: 135.0,
            amplitude_sd_uv: 70.0,
            min_amplitude_uv: 20.0,
            positive_fraction: 0.7,
            negative_scale: 0.5,
        }
    }
}

impl SpikeModel {
    pub fn validate(&self) -> StreamResult<()> {
        let probabilities = [self.spike_probability, self.positive_fraction];
        if probabilities.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(StreamError::InvalidConfig(
                "spike probabilities must be within [0, 1]".to_string(),
            ));
        }
        self.distributions().map(|_| ())
    }

    fn distributions(&self) -> StreamResult<(Normal<f64>, Normal<f64>)> {
        let noise = Normal::new(0.0, self.noise_sd_uv)
            .map_err(|e| StreamError::InvalidConfig(format!("noise distribution: {}", e)))?;
        let amplitude = Normal::new(self.amplitude_mean_uv, self.amplitude_sd_uv)
            .map_err(|e| StreamError::InvalidConfig(format!("amplitude distribution: {}", e)))?;
        Ok((noise, amplitude))
    }

    fn sample_voltage<R: Rng>(&self, rng: &mut R, noise: &Normal<f64>, amplitude: &Normal<f64>) -> f64 {
        let mut voltage = noise.sample(rng);

        if rng.random_bool(self.spike_probability) {
            let size = amplitude.sample(rng).max(self.min_amplitude_uv);
            voltage += if rng.random_bool(self.positive_fraction) {
                size
            } else {
                -size * self.negative_scale
            };
        }

        voltage
    }
}

pub struct SimulatedSource {
    model: SpikeModel,
    rng: StdRng,
    realtime: bool,
    config: AcquisitionConfig,
    connected: bool,
}

impl SimulatedSource {
    /// A `seed` makes the signal reproducible. With `realtime` off, samples
    /// are produced as fast as the consumer pulls them.
    pub fn new(seed: Option<u64>, realtime: bool) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            model: SpikeModel::default(),
            rng,
            realtime,
            config: AcquisitionConfig::default(),
            connected: false,
        }
    }

    pub fn with_model(mut self, model: SpikeModel) -> StreamResult<Self> {
        model.validate()?;
        self.model = model;
        Ok(self)
    }
}

#[async_trait]
impl SampleSource for SimulatedSource {
    async fn connect(&mut self) -> StreamResult<()> {
        if !self.connected {
            log::info!("Simulated source ready (no hardware needed)");
        }
        self.connected = true;
        Ok(())
    }

    async fn configure(&mut self, config: &AcquisitionConfig) -> StreamResult<()> {
        config.validate()?;
        if !self.connected {
            return Err(StreamError::InvalidConfig(
                "Simulator is not connected".to_string(),
            ));
        }
        self.config = config.clone();
        Ok(())
    }

    fn stream(&mut self) -> SampleStream<'_> {
        let channels: Vec<ChannelConfig> = self.config.enabled_channels().cloned().collect();
        let model = self.model.clone();
        let realtime = self.realtime;
        let rng = &mut self.rng;

        Box::pin(async_stream::stream! {
            let (noise, amplitude) = match model.distributions() {
                Ok(d) => d,
                Err(e) => {
                    yield Err(StreamError::FatalSource(e.to_string()));
                    return;
                }
            };

            let mut ticker = interval(Duration::from_secs_f64(SIMULATED_DT));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut round: u64 = 0;

            loop {
                if realtime {
                    ticker.tick().await;
                } else {
                    tokio::task::yield_now().await;
                }

                let timestamp = round as f64 * SIMULATED_DT;
                let batch: Vec<Sample> = channels
                    .iter()
                    .map(|ch| {
                        let voltage = model.sample_voltage(&mut *rng, &noise, &amplitude);
                        Sample::new(
                            timestamp,
                            ch.channel,
                            ch.voltage_range.microvolts_to_counts(voltage),
                            voltage,
                        )
                    })
                    .collect();

                round += 1;
                yield Ok(batch);
            }
        })
    }

    async fn stop(&mut self) -> StreamResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> StreamResult<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            kind: "simulated".to_string(),
            channels: self.config.enabled_channels().map(|c| c.channel).collect(),
            sample_interval_ms: (SIMULATED_DT * 1000.0) as u64,
            simulated: true,
            properties: [("realtime".to_string(), self.realtime.to_string())]
                .into_iter()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(source: &mut SimulatedSource, batches: usize) -> Vec<Sample> {
        source
            .stream()
            .take(batches)
            .map(|batch| batch.unwrap())
            .concat()
            .await
    }

    #[tokio::test]
    async fn test_timestamps_advance_by_dt() {
        let mut source = SimulatedSource::new(Some(3), false);
        source.connect().await.unwrap();
        let samples = collect(&mut source, 25).await;

        assert_eq!(samples.len(), 25);
        for (i, sample) in samples.iter().enumerate() {
            assert!((sample.timestamp - i as f64 * SIMULATED_DT).abs() < 1e-9);
            assert_eq!(sample.channel, 1);
        }
    }

    #[tokio::test]
    async fn test_seed_is_reproducible() {
        let mut a = SimulatedSource::new(Some(42), false);
        let mut b = SimulatedSource::new(Some(42), false);
        assert_eq!(collect(&mut a, 50).await, collect(&mut b, 50).await);
    }

    #[tokio::test]
    async fn test_spikes_appear_over_a_long_run() {
        let model = SpikeModel {
            spike_probability: 0.2,
            ..Default::default()
        };
        let mut source = SimulatedSource::new(Some(9), false).with_model(model).unwrap();
        let samples = collect(&mut source, 500).await;

        let spikes = samples.iter().filter(|s| s.voltage_uv.abs() >= 10.0).count();
        assert!(spikes > 20, "only {} spikes", spikes);
        // Raw counts follow the ±39 mV conversion
        for s in &samples {
            let back = crate::acquisition::VoltageRange::Mv39.counts_to_microvolts(s.raw_count);
            assert!((back - s.voltage_uv).abs() < 0.01);
        }
    }

    #[tokio::test]
    async fn test_one_sample_per_enabled_channel() {
        let mut source = SimulatedSource::new(Some(1), false);
        let mut config = AcquisitionConfig::default();
        config.channels.push(ChannelConfig {
            channel: 4,
            ..Default::default()
        });
        assert!(matches!(
            source.configure(&config).await,
            Err(StreamError::InvalidConfig(_))
        ));

        source.connect().await.unwrap();
        source.configure(&config).await.unwrap();

        let first = source.stream().next().await.unwrap().unwrap();
        let channels: Vec<u8> = first.iter().map(|s| s.channel).collect();
        assert_eq!(channels, vec![1, 4]);
    }

    #[test]
    fn test_invalid_model_rejected() {
        let model = SpikeModel {
            noise_sd_uv: -1.0,
            ..Default::default()
        };
        assert!(SimulatedSource::new(None, false).with_model(model).is_err());

        let model = SpikeModel {
            spike_probability: 1.5,
            ..Default::default()
        };
        assert!(model.validate().is_err());
    }
}
