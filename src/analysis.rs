//! Offline analysis of recorded sessions
//!
//! Runs the live signal pipeline over a whole recorded channel at once and
//! reports descriptive statistics, the detected peaks and a binned spike rate.

use crate::error::{StreamError, StreamResult};
use crate::persistence::load_session;
use crate::signal::{Peak, Polarity, SignalProcessor};
use crate::streaming::types::Sample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Peaks counted in one time bin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateBin {
    pub start_s: f64,
    pub end_s: f64,
    pub peaks: usize,
    pub rate_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel: u8,
    pub samples: usize,
    pub duration_s: f64,
    pub sample_rate_hz: f64,
    pub mean_uv: f64,
    /// Sample standard deviation
    pub std_uv: f64,
    pub min_uv: f64,
    pub max_uv: f64,
    pub mean_amplitude_uv: f64,
    pub rms_noise_uv: f64,
    pub positive_peaks: usize,
    pub negative_peaks: usize,
    pub spike_frequency_hz: f64,
    pub peaks: Vec<Peak>,
    pub bins: Vec<RateBin>,
}

impl ChannelSummary {
    pub fn peak_count(&self) -> usize {
        self.positive_peaks + self.negative_peaks
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub source: Option<PathBuf>,
    pub total_samples: usize,
    pub channels: Vec<ChannelSummary>,
}

/// Analyze a session CSV.
pub fn analyze_file(
    path: &Path,
    processor: &SignalProcessor,
    bin_s: f64,
) -> StreamResult<SessionSummary> {
    let samples = load_session(path)?;
    let mut summary = analyze_samples(&samples, processor, bin_s)?;
    summary.source = Some(path.to_path_buf());
    Ok(summary)
}

/// Analyze samples already in memory, one summary per channel.
pub fn analyze_samples(
    samples: &[Sample],
    processor: &SignalProcessor,
    bin_s: f64,
) -> StreamResult<SessionSummary> {
    if !(bin_s.is_finite() && bin_s > 0.0) {
        return Err(StreamError::InvalidConfig(format!(
            "bin width must be positive, got {}",
            bin_s
        )));
    }

    let mut by_channel: BTreeMap<u8, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for sample in samples {
        let (times, voltages) = by_channel.entry(sample.channel).or_default();
        times.push(sample.timestamp);
        voltages.push(sample.voltage_uv);
    }

    let channels = by_channel
        .into_iter()
        .map(|(channel, (times, voltages))| {
            summarize_channel(channel, &times, &voltages, processor, bin_s)
        })
        .collect();

    Ok(SessionSummary {
        source: None,
        total_samples: samples.len(),
        channels,
    })
}

/// The processor runs once over the channel's complete series.
fn summarize_channel(
    channel: u8,
    times: &[f64],
    voltages: &[f64],
    processor: &SignalProcessor,
    bin_s: f64,
) -> ChannelSummary {
    let n = voltages.len();
    let duration_s = match (times.first(), times.last()) {
        (Some(first), Some(last)) => last - first,
        _ => 0.0,
    };

    let mean_uv = voltages.iter().sum::<f64>() / n.max(1) as f64;
    let std_uv = if n > 1 {
        let ss: f64 = voltages.iter().map(|v| (v - mean_uv).powi(2)).sum();
        (ss / (n - 1) as f64).sqrt()
    } else {
        0.0
    };

    let result = processor.process_window(times, voltages);
    let positive_peaks = result
        .peaks
        .iter()
        .filter(|p| p.polarity == Polarity::Positive)
        .count();

    ChannelSummary {
        channel,
        samples: n,
        duration_s,
        sample_rate_hz: if duration_s > 0.0 {
            n as f64 / duration_s
        } else {
            0.0
        },
        mean_uv,
        std_uv,
        min_uv: voltages.iter().copied().fold(f64::INFINITY, f64::min),
        max_uv: voltages.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean_amplitude_uv: result.mean_amplitude,
        rms_noise_uv: result.rms_noise,
        positive_peaks,
        negative_peaks: result.peaks.len() - positive_peaks,
        spike_frequency_hz: result.spike_frequency,
        bins: rate_bins(times, &result.peaks, bin_s),
        peaks: result.peaks,
    }
}

/// Count peaks in consecutive bins starting at the first timestamp. The last
/// bin is truncated at the final timestamp.
fn rate_bins(times: &[f64], peaks: &[Peak], bin_s: f64) -> Vec<RateBin> {
    let (start, end) = match (times.first(), times.last()) {
        (Some(&first), Some(&last)) if last > first => (first, last),
        _ => return Vec::new(),
    };

    let count = ((end - start) / bin_s).ceil().max(1.0) as usize;
    let mut bins: Vec<RateBin> = (0..count)
        .map(|i| {
            let start_s = start + i as f64 * bin_s;
            RateBin {
                start_s,
                end_s: (start_s + bin_s).min(end),
                peaks: 0,
                rate_hz: 0.0,
            }
        })
        .collect();

    for peak in peaks {
        let idx = (((peak.time - start) / bin_s).floor().max(0.0) as usize).min(count - 1);
        bins[idx].peaks += 1;
    }
    for bin in &mut bins {
        let width = bin.end_s - bin.start_s;
        bin.rate_hz = if width > 0.0 {
            bin.peaks as f64 / width
        } else {
            0.0
        };
    }
    bins
}
