//! Prominence-based peak picking
//!
//! Candidate peaks are strict local maxima (flat tops collapse to their
//! midpoint). A candidate survives if it clears an absolute height floor and
//! its topographic prominence reaches the threshold. Widths are measured at a
//! fraction of the prominence below the peak, interpolating linearly between
//! samples.

use serde::{Deserialize, Serialize};

/// Direction of a detected excursion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
}

/// A peak found in one processing window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Position in the window the peak was detected in
    pub index: usize,
    pub time: f64,
    /// Filtered value at the peak; negative for negative peaks
    pub height: f64,
    /// Width in seconds
    pub width: f64,
    pub prominence: f64,
    pub polarity: Polarity,
}

/// Prominence of a single peak and the bases that bound it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prominence {
    pub value: f64,
    pub left_base: usize,
    pub right_base: usize,
}

/// Indices of local maxima. A flat top reports its midpoint, rounded down.
pub fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }

    let i_max = x.len() - 1;
    let mut i = 1;
    while i < i_max {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < i_max && x[ahead] == x[i] {
                ahead += 1;
            }

            if x[ahead] < x[i] {
                let left_edge = i;
                let right_edge = ahead - 1;
                peaks.push((left_edge + right_edge) / 2);
                i = ahead;
            }
        }
        i += 1;
    }

    peaks
}

/// Walk outwards from the peak on both sides until higher ground or the
/// window edge; the prominence is the drop to the higher of the two minima.
pub fn prominence(x: &[f64], peak: usize) -> Prominence {
    let top = x[peak];

    let mut left_min = top;
    let mut left_base = peak;
    let mut i = peak;
    loop {
        if x[i] > top {
            break;
        }
        if x[i] < left_min {
            left_min = x[i];
            left_base = i;
        }
        if i == 0 {
            break;
        }
        i -= 1;
    }

    let mut right_min = top;
    let mut right_base = peak;
    let mut i = peak;
    while i < x.len() && x[i] <= top {
        if x[i] < right_min {
            right_min = x[i];
            right_base = i;
        }
        i += 1;
    }

    Prominence {
        value: top - left_min.max(right_min),
        left_base,
        right_base,
    }
}

/// Width in samples at `top - rel_height * prominence`, bounded by the bases
pub fn width_at(x: &[f64], peak: usize, prom: &Prominence, rel_height: f64) -> f64 {
    let height = x[peak] - prom.value * rel_height;

    let mut i = peak;
    while prom.left_base < i && height < x[i] {
        i -= 1;
    }
    let mut left_ip = i as f64;
    if x[i] < height {
        left_ip += (height - x[i]) / (x[i + 1] - x[i]);
    }

    let mut i = peak;
    while i < prom.right_base && height < x[i] {
        i += 1;
    }
    let mut right_ip = i as f64;
    if x[i] < height {
        right_ip -= (height - x[i]) / (x[i - 1] - x[i]);
    }

    right_ip - left_ip
}

/// Options for [`detect`]
#[derive(Debug, Clone, Copy)]
pub struct PeakCriteria {
    pub prominence: f64,
    pub height_floor: f64,
    pub rel_height: f64,
    /// Seconds per sample, used to convert widths
    pub sample_interval: f64,
}

/// Detect positive peaks on `signal` and negative peaks on its negation,
/// merged in time order.
pub fn detect(signal: &[f64], times: &[f64], criteria: &PeakCriteria) -> Vec<Peak> {
    let n = signal.len().min(times.len());
    let signal = &signal[..n];

    let mut peaks = detect_one_sided(signal, times, criteria, Polarity::Positive);

    let negated: Vec<f64> = signal.iter().map(|v| -v).collect();
    peaks.extend(detect_one_sided(&negated, times, criteria, Polarity::Negative));

    peaks.sort_by(|a, b| a.time.total_cmp(&b.time));
    peaks
}

fn detect_one_sided(
    x: &[f64],
    times: &[f64],
    criteria: &PeakCriteria,
    polarity: Polarity,
) -> Vec<Peak> {
    let sign = match polarity {
        Polarity::Positive => 1.0,
        Polarity::Negative => -1.0,
    };

    local_maxima(x)
        .into_iter()
        .filter(|&i| x[i] >= criteria.height_floor)
        .filter_map(|i| {
            let prom = prominence(x, i);
            if prom.value < criteria.prominence {
                return None;
            }
            let width = width_at(x, i, &prom, criteria.rel_height) * criteria.sample_interval;
            Some(Peak {
                index: i,
                time: times[i],
                height: sign * x[i],
                width,
                prominence: prom.value,
                polarity,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> PeakCriteria {
        PeakCriteria {
            prominence: 10.0,
            height_floor: 5.0,
            rel_height: 0.8,
            sample_interval: 0.1,
        }
    }

    fn times(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * 0.1).collect()
    }

    #[test]
    fn test_local_maxima_plateau_midpoint() {
        assert_eq!(local_maxima(&[0.0, 1.0, 0.0]), vec![1]);
        assert_eq!(local_maxima(&[0.0, 2.0, 2.0, 0.0]), vec![1]);
        assert_eq!(local_maxima(&[0.0, 2.0, 2.0, 2.0, 0.0]), vec![2]);
        // Rising into the edge is not a peak
        assert!(local_maxima(&[0.0, 1.0, 2.0]).is_empty());
        assert!(local_maxima(&[3.0, 1.0]).is_empty());
        // Plateau that never comes down
        assert!(local_maxima(&[0.0, 2.0, 2.0, 2.0]).is_empty());
    }

    #[test]
    fn test_prominence_stops_at_higher_ground() {
        let x = [0.0, 10.0, 4.0, 6.0, 2.0, 20.0, 0.0];
        let small = prominence(&x, 3);
        assert_eq!(small.value, 2.0);
        assert_eq!(small.left_base, 2);
        assert_eq!(small.right_base, 4);

        let big = prominence(&x, 5);
        assert_eq!(big.value, 20.0);
        assert_eq!(big.left_base, 0);
        assert_eq!(big.right_base, 6);
    }

    #[test]
    fn test_triangle_width() {
        let x = [0.0, 5.0, 10.0, 5.0, 0.0];
        let prom = prominence(&x, 2);
        assert_eq!(prom.value, 10.0);
        // 80% below the top is 2.0, crossed at 0.4 and 3.6
        assert!((width_at(&x, 2, &prom, 0.8) - 3.2).abs() < 1e-12);
    }

    #[test]
    fn test_isolated_positive_spike() {
        let mut x = vec![0.0; 21];
        x[7] = 50.0;
        let peaks = detect(&x, &times(21), &criteria());
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].index, 7);
        assert_eq!(peaks[0].polarity, Polarity::Positive);
        assert_eq!(peaks[0].height, 50.0);
        assert!((peaks[0].time - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_isolated_negative_spike() {
        let mut x = vec![0.0; 21];
        x[12] = -50.0;
        let peaks = detect(&x, &times(21), &criteria());
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].index, 12);
        assert_eq!(peaks[0].polarity, Polarity::Negative);
        assert_eq!(peaks[0].height, -50.0);
    }

    #[test]
    fn test_shallow_and_low_bumps_rejected() {
        // Twin peaks of equal height both keep their full prominence
        let x = [0.0, 30.0, 26.0, 30.0, 0.0];
        let peaks = detect(&x, &times(5), &criteria());
        assert_eq!(peaks.len(), 2);

        // Prominence 2 on the shoulder of a taller peak
        let shoulder = [0.0, 30.0, 32.0, 28.0, 30.0, 0.0];
        let idx: Vec<usize> = detect(&shoulder, &times(6), &criteria())
            .iter()
            .map(|p| p.index)
            .collect();
        assert_eq!(idx, vec![2]);

        // Tall enough drop but below the height floor
        let low = [-20.0, 4.0, -20.0];
        let positives = detect(&low, &times(3), &criteria())
            .into_iter()
            .filter(|p| p.polarity == Polarity::Positive)
            .count();
        assert_eq!(positives, 0);
    }

    #[test]
    fn test_merged_in_time_order() {
        let mut x = vec![0.0; 30];
        x[5] = 40.0;
        x[15] = -40.0;
        x[25] = 40.0;
        let polarities: Vec<Polarity> = detect(&x, &times(30), &criteria())
            .iter()
            .map(|p| p.polarity)
            .collect();
        assert_eq!(
            polarities,
            vec![Polarity::Positive, Polarity::Negative, Polarity::Positive]
        );
    }
}
