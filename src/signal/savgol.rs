//! Savitzky-Golay smoothing
//!
//! Fits a polynomial of degree `order` by least squares over a sliding window
//! of `window` samples and replaces each sample with the fitted value. The
//! fit is linear in the data, so the whole thing reduces to the projection
//! matrix `H = A (AᵀA)⁻¹ Aᵀ` of a centred Vandermonde matrix `A`:
//!
//! - interior samples use the centre row of `H` (the classic convolution
//!   coefficients)
//! - the first and last `window / 2` samples are evaluated on the polynomial
//!   fitted to the first and last `window` samples respectively

use crate::error::{StreamError, StreamResult};
use nalgebra::DMatrix;

/// Precomputed Savitzky-Golay projection for one (window, order) pair
#[derive(Debug, Clone)]
pub struct SavitzkyGolay {
    window: usize,
    order: usize,
    projection: DMatrix<f64>,
}

impl SavitzkyGolay {
    pub fn new(window: usize, order: usize) -> StreamResult<Self> {
        if window == 0 || window % 2 == 0 {
            return Err(StreamError::InvalidConfig(format!(
                "Savitzky-Golay window must be a positive odd number, got {}",
                window
            )));
        }
        if order >= window {
            return Err(StreamError::InvalidConfig(format!(
                "Savitzky-Golay order {} must be less than window {}",
                order, window
            )));
        }

        let half = (window / 2) as f64;
        let vandermonde =
            DMatrix::from_fn(window, order + 1, |r, c| (r as f64 - half).powi(c as i32));

        let normal = vandermonde.transpose() * &vandermonde;
        let inverse = normal.try_inverse().ok_or_else(|| {
            StreamError::InvalidConfig(format!(
                "Savitzky-Golay normal matrix is singular (window {}, order {})",
                window, order
            ))
        })?;

        let projection = &vandermonde * inverse * vandermonde.transpose();

        Ok(Self {
            window,
            order,
            projection,
        })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Convolution coefficients applied to interior samples
    pub fn coefficients(&self) -> Vec<f64> {
        let centre = self.window / 2;
        self.projection.row(centre).iter().copied().collect()
    }

    /// Smooth a signal. Inputs shorter than the window are returned unchanged.
    pub fn apply(&self, signal: &[f64]) -> Vec<f64> {
        let n = signal.len();
        let w = self.window;
        if n < w {
            return signal.to_vec();
        }

        let half = w / 2;
        let mut out = Vec::with_capacity(n);

        for i in 0..n {
            let (start, row) = if i < half {
                (0, i)
            } else if i + half >= n {
                (n - w, w - (n - i))
            } else {
                (i - half, half)
            };
            out.push(self.evaluate(row, &signal[start..start + w]));
        }

        out
    }

    fn evaluate(&self, row: usize, segment: &[f64]) -> f64 {
        segment
            .iter()
            .enumerate()
            .map(|(j, x)| self.projection[(row, j)] * x)
            .sum()
    }
}
