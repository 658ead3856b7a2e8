use rayon::prelude::*;

use crate::config::{RoundingMode, DEFAULT_PARALLEL_THRESHOLD};
use crate::utils::mean_abs;
use crate::SCALE_EPSILON;

/// One ternary matrix (values in {-1, 0, 1}) with its scale.
#[derive(Debug, Clone, PartialEq)]
pub struct TernaryBasis {
    /// Row-major ternary values.
    pub values: Vec<i8>,
    /// Non-negative scale; `0.0` marks an empty basis.
    pub scale: f32,
}

impl TernaryBasis {
    /// All-zero basis with zero scale.
    pub fn zeros(len: usize) -> Self {
        TernaryBasis {
            values: vec![0; len],
            scale: 0.0,
        }
    }

    /// True when the basis contributes nothing.
    pub fn is_zero(&self) -> bool {
        self.scale == 0.0 || self.values.iter().all(|&v| v == 0)
    }

    /// Add `scale * values` into `acc`.
    pub fn accumulate_into(&self, acc: &mut [f32]) {
        if self.scale == 0.0 {
            return;
        }
        for (a, &q) in acc.iter_mut().zip(self.values.iter()) {
            *a += f32::from(q) * self.scale;
        }
    }

    /// Subtract `scale * values` from `residual` in full precision.
    pub fn subtract_from(&self, residual: &mut [f32], parallel_threshold: usize) {
        if self.scale == 0.0 {
            return;
        }
        let scale = self.scale;
        if residual.len() > parallel_threshold {
            residual
                .par_iter_mut()
                .zip(self.values.par_iter())
                .for_each(|(r, &q)| *r -= f32::from(q) * scale);
        } else {
            for (r, &q) in residual.iter_mut().zip(self.values.iter()) {
                *r -= f32::from(q) * scale;
            }
        }
    }
}

/// AbsMean ternary quantizer.
///
/// ```text
/// scale = mean(|R|)
/// Q     = clamp(round(R / scale), -1, 1)
/// ```
///
/// A scale below [`SCALE_EPSILON`] yields `Q = 0, scale = 0`.
#[derive(Debug, Clone, Copy)]
pub struct TernaryQuantizer {
    rounding: RoundingMode,
    parallel_threshold: usize,
}

impl Default for TernaryQuantizer {
    fn default() -> Self {
        Self::new(RoundingMode::default(), DEFAULT_PARALLEL_THRESHOLD)
    }
}

impl TernaryQuantizer {
    pub fn new(rounding: RoundingMode, parallel_threshold: usize) -> Self {
        TernaryQuantizer {
            rounding,
            parallel_threshold,
        }
    }

    pub fn rounding(&self) -> RoundingMode {
        self.rounding
    }

    pub fn parallel_threshold(&self) -> usize {
        self.parallel_threshold
    }

    /// Quantize one matrix, given as a flat slice.
    pub fn quantize(&self, data: &[f32]) -> TernaryBasis {
        let scale = mean_abs(data, self.parallel_threshold) as f32;
        if !(scale >= SCALE_EPSILON) {
            return TernaryBasis::zeros(data.len());
        }

        let rounding = self.rounding;
        let quantize_one = |x: f32| rounding.round(x / scale).clamp(-1.0, 1.0) as i8;

        let values: Vec<i8> = if data.len() > self.parallel_threshold {
            data.par_iter().map(|&x| quantize_one(x)).collect()
        } else {
            data.iter().map(|&x| quantize_one(x)).collect()
        };

        TernaryBasis { values, scale }
    }
}

/// Standalone quantization with the default rounding rule.
pub fn quantize_ternary(data: &[f32]) -> TernaryBasis {
    TernaryQuantizer::default().quantize(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_logic() {
        let data = vec![0.0f32, 1.0, -1.0, 0.5, -0.5, 2.0];
        let basis = quantize_ternary(&data);

        // mean(|x|) = 5 / 6
        assert!((basis.scale - 5.0 / 6.0).abs() < 1e-6);
        assert_eq!(basis.values, vec![0, 1, -1, 1, -1, 1]);
    }

    #[test]
    fn test_values_are_ternary() {
        let data: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.7).sin() * 3.0).collect();
        let basis = quantize_ternary(&data);
        assert!(basis.values.iter().all(|&v| (-1..=1).contains(&v)));
        assert!(basis.scale > 0.0);
    }

    #[test]
    fn test_zero_matrix() {
        let basis = quantize_ternary(&[0.0; 16]);
        assert_eq!(basis.scale, 0.0);
        assert!(basis.values.iter().all(|&v| v == 0));
        assert!(basis.is_zero());
    }

    #[test]
    fn test_below_epsilon_is_zero() {
        let basis = quantize_ternary(&[1e-12, -1e-12, 1e-12, 0.0]);
        assert_eq!(basis.scale, 0.0);
        assert!(basis.values.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_rounding_rule_matters_at_half() {
        // scale = 1.0, so 0.5 / scale sits exactly on the tie
        let data = vec![0.5f32, 1.5, -0.5, -1.5];
        let even = TernaryQuantizer::new(RoundingMode::HalfToEven, usize::MAX).quantize(&data);
        let away =
            TernaryQuantizer::new(RoundingMode::HalfAwayFromZero, usize::MAX).quantize(&data);

        assert_eq!(even.values, vec![0, 1, 0, -1]);
        assert_eq!(away.values, vec![1, 1, -1, -1]);
    }

    #[test]
    fn test_parallel_path_matches_serial() {
        let data: Vec<f32> = (0..50_000).map(|i| ((i as f32) * 0.11).cos()).collect();
        let serial = TernaryQuantizer::new(RoundingMode::HalfToEven, usize::MAX).quantize(&data);
        let parallel = TernaryQuantizer::new(RoundingMode::HalfToEven, 0).quantize(&data);
        assert_eq!(serial, parallel);
    }

    #[test]
    fn test_subtract_and_accumulate() {
        let basis = TernaryBasis {
            values: vec![1, 0, -1, 1],
            scale: 0.5,
        };
        let mut residual = vec![1.0f32, 1.0, 1.0, 1.0];
        basis.subtract_from(&mut residual, usize::MAX);
        assert_eq!(residual, vec![0.5, 1.0, 1.5, 0.5]);

        let mut acc = vec![0.0f32; 4];
        basis.accumulate_into(&mut acc);
        assert_eq!(acc, vec![0.5, 0.0, -0.5, 0.5]);
    }
}
