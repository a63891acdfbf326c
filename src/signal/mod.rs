//! Signal processing for live and offline windows
//!
//! A window goes through three stages:
//! 1. Savitzky-Golay smoothing (11 samples, cubic)
//! 2. A noise gate that zeroes everything below the noise floor
//! 3. Bidirectional prominence-based peak detection
//!
//! Per-window statistics are computed from the raw values. The processor is
//! immutable after construction and safe to share between tasks.

pub mod peaks;
pub mod savgol;

pub use peaks::{Peak, PeakCriteria, Polarity};
pub use savgol::SavitzkyGolay;

use crate::error::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};

/// Tunable processing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingParams {
    /// Savitzky-Golay window length (odd)
    pub smoothing_window: usize,
    /// Savitzky-Golay polynomial order (< window)
    pub smoothing_order: usize,
    /// Values with |v| below this are treated as noise (µV)
    pub noise_floor_uv: f64,
    /// Minimum topographic prominence of a peak (µV)
    pub prominence_uv: f64,
    /// Minimum absolute peak height (µV)
    pub height_floor_uv: f64,
    /// Width is measured this fraction of the prominence below the top
    pub width_rel_height: f64,
    /// Sample interval assumed when a window has fewer than two timestamps
    pub default_interval_s: f64,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            smoothing_window: 11,
            smoothing_order: 3,
            noise_floor_uv: 5.0,
            prominence_uv: 10.0,
            height_floor_uv: 5.0,
            width_rel_height: 0.8,
            default_interval_s: 0.1,
        }
    }
}

impl ProcessingParams {
    pub fn validate(&self) -> StreamResult<()> {
        if !non_negative(self.noise_floor_uv) {
            return Err(StreamError::InvalidConfig(
                "noise floor must be non-negative".to_string(),
            ));
        }
        if !non_negative(self.prominence_uv) || !non_negative(self.height_floor_uv) {
            return Err(StreamError::InvalidConfig(
                "peak thresholds must be non-negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.width_rel_height) {
            return Err(StreamError::InvalidConfig(format!(
                "width relative height must be within [0, 1], got {}",
                self.width_rel_height
            )));
        }
        if !non_negative(self.default_interval_s) || self.default_interval_s == 0.0 {
            return Err(StreamError::InvalidConfig(
                "default sample interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

/// Output of [`SignalProcessor::process_window`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    /// Smoothed and gated voltages, same length as the input
    pub filtered: Vec<f64>,
    pub peaks: Vec<Peak>,
    /// Mean |raw| over samples above the noise floor
    pub mean_amplitude: f64,
    /// Peaks per second of window duration
    pub spike_frequency: f64,
    /// RMS of raw samples at or below the noise floor
    pub rms_noise: f64,
}

/// Replace every value with `|v| < floor` by zero.
pub fn gate(voltages: &[f64], floor: f64) -> Vec<f64> {
    voltages
        .iter()
        .map(|&v| if v.abs() < floor { 0.0 } else { v })
        .collect()
}

/// Mean spacing of a timestamp series, or `default` if it cannot be derived.
pub fn mean_interval(times: &[f64], default: f64) -> f64 {
    match (times.first(), times.last()) {
        (Some(first), Some(last)) if times.len() >= 2 => {
            let dt = (last - first) / (times.len() - 1) as f64;
            if dt > 0.0 && dt.is_finite() {
                dt
            } else {
                default
            }
        }
        _ => default,
    }
}

/// Detect positive and negative peaks with the default width level (80%).
pub fn detect_peaks(
    smoothed: &[f64],
    times: &[f64],
    prominence: f64,
    height_floor: f64,
) -> Vec<Peak> {
    let defaults = ProcessingParams::default();
    let criteria = PeakCriteria {
        prominence,
        height_floor,
        rel_height: defaults.width_rel_height,
        sample_interval: mean_interval(times, defaults.default_interval_s),
    };
    peaks::detect(smoothed, times, &criteria)
}

/// Smoothing, gating and peak detection over windows of samples
#[derive(Debug, Clone)]
pub struct SignalProcessor {
    params: ProcessingParams,
    smoother: SavitzkyGolay,
}

impl SignalProcessor {
    pub fn new(params: ProcessingParams) -> StreamResult<Self> {
        params.validate()?;
        let smoother = SavitzkyGolay::new(params.smoothing_window, params.smoothing_order)?;
        Ok(Self { params, smoother })
    }

    pub fn params(&self) -> &ProcessingParams {
        &self.params
    }

    /// Samples that must follow a peak before its smoothed value stops
    /// depending on future data.
    pub fn settle_margin(&self) -> usize {
        self.params.smoothing_window / 2
    }

    pub fn smooth(&self, voltages: &[f64]) -> Vec<f64> {
        self.smoother.apply(voltages)
    }

    pub fn gate(&self, voltages: &[f64]) -> Vec<f64> {
        gate(voltages, self.params.noise_floor_uv)
    }

    pub fn detect_peaks(&self, smoothed: &[f64], times: &[f64]) -> Vec<Peak> {
        let criteria = PeakCriteria {
            prominence: self.params.prominence_uv,
            height_floor: self.params.height_floor_uv,
            rel_height: self.params.width_rel_height,
            sample_interval: mean_interval(times, self.params.default_interval_s),
        };
        peaks::detect(smoothed, times, &criteria)
    }

    /// Run the full pipeline over one window. Never fails; degenerate input
    /// yields zeroed statistics.
    pub fn process_window(&self, times: &[f64], voltages: &[f64]) -> WindowResult {
        let n = times.len().min(voltages.len());
        if n == 0 {
            return WindowResult::default();
        }
        let times = &times[..n];
        let raw = &voltages[..n];

        let filtered = self.gate(&self.smooth(raw));
        let peaks = self.detect_peaks(&filtered, times);

        let floor = self.params.noise_floor_uv;
        let (signal_sum, signal_n, noise_sq, noise_n) =
            raw.iter()
                .fold((0.0, 0usize, 0.0, 0usize), |(ss, sn, ns, nn), &v| {
                    if v.abs() > floor {
                        (ss + v.abs(), sn + 1, ns, nn)
                    } else {
                        (ss, sn, ns + v * v, nn + 1)
                    }
                });

        let mean_amplitude = if signal_n > 0 {
            signal_sum / signal_n as f64
        } else {
            0.0
        };
        let rms_noise = if noise_n > 0 {
            (noise_sq / noise_n as f64).sqrt()
        } else {
            0.0
        };

        let duration = if n == 1 { 1.0 } else { times[n - 1] - times[0] };
        let spike_frequency = if duration > 0.0 {
            peaks.len() as f64 / duration
        } else {
            0.0
        };

        WindowResult {
            filtered,
            peaks,
            mean_amplitude,
            spike_frequency,
            rms_noise,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> SignalProcessor {
        SignalProcessor::new(ProcessingParams::default()).unwrap()
    }

    fn times(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * 0.1).collect()
    }

    #[test]
    fn test_gate_zeroes_below_floor() {
        let gated = gate(&[4.9, -4.9, 5.0, -5.0, 120.0, 0.0], 5.0);
        assert_eq!(gated, vec![0.0, 0.0, 5.0, -5.0, 120.0, 0.0]);
    }

    #[test]
    fn test_all_zero_window() {
        let result = processor().process_window(&times(20), &[0.0; 20]);
        assert!(result.peaks.is_empty());
        assert_eq!(result.filtered, vec![0.0; 20]);
        assert_eq!(result.mean_amplitude, 0.0);
        assert_eq!(result.spike_frequency, 0.0);
        assert_eq!(result.rms_noise, 0.0);
    }

    #[test]
    fn test_empty_and_single_sample_windows() {
        let p = processor();
        assert_eq!(p.process_window(&[], &[]), WindowResult::default());

        let single = p.process_window(&[3.0], &[2.0]);
        assert_eq!(single.filtered, vec![0.0]);
        assert!(single.peaks.is_empty());
        assert_eq!(single.rms_noise, 2.0);
    }

    #[test]
    fn test_window_with_spike() {
        let mut v = vec![0.0; 40];
        v[20] = 120.0;
        let t = times(40);
        let result = processor().process_window(&t, &v);

        let positives: Vec<&Peak> = result
            .peaks
            .iter()
            .filter(|p| p.polarity == Polarity::Positive)
            .collect();
        assert_eq!(positives.len(), 1);
        assert_eq!(positives[0].index, 20);
        assert!((positives[0].height - 120.0 * 89.0 / 429.0).abs() < 1e-9);
        assert!(positives[0].width > 0.0);

        assert_eq!(result.mean_amplitude, 120.0);
        assert_eq!(result.rms_noise, 0.0);
        let duration = t[39] - t[0];
        assert!((result.spike_frequency - result.peaks.len() as f64 / duration).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_split_on_floor() {
        let v = [3.0, -4.0, 10.0, -20.0];
        let result = processor().process_window(&times(4), &v);
        assert_eq!(result.mean_amplitude, 15.0);
        assert!((result.rms_noise - (25.0f64 / 2.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_mean_interval() {
        assert_eq!(mean_interval(&[], 0.1), 0.1);
        assert_eq!(mean_interval(&[4.0], 0.1), 0.1);
        assert!((mean_interval(&[0.0, 0.5, 1.0], 0.1) - 0.5).abs() < 1e-12);
        assert_eq!(mean_interval(&[1.0, 1.0], 0.1), 0.1);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = ProcessingParams {
            smoothing_window: 10,
            ..Default::default()
        };
        assert!(matches!(
            SignalProcessor::new(params),
            Err(StreamError::InvalidConfig(_))
        ));

        let params = ProcessingParams {
            width_rel_height: 1.5,
            ..Default::default()
        };
        assert!(SignalProcessor::new(params).is_err());
    }

    #[test]
    fn test_free_detect_peaks_mirrors_spike() {
        let mut x = vec![0.0; 21];
        x[10] = -50.0;
        let peaks = detect_peaks(&x, &times(21), 10.0, 5.0);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].polarity, Polarity::Negative);
        assert_eq!(peaks[0].index, 10);
    }
}
