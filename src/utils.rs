//! Reductions and error metrics over flat f32 buffers.
//!
//! Sums are accumulated in f64 per fixed-size chunk and the chunk partials
//! are added in chunk order, so the serial and rayon paths return identical
//! bits.

use rayon::prelude::*;

/// Chunk length shared by the serial and parallel reductions.
pub const CHUNK_SIZE: usize = 8192;

fn chunked_sum<F>(data: &[f32], parallel_threshold: usize, f: F) -> f64
where
    F: Fn(f32) -> f64 + Sync,
{
    let partial = |chunk: &[f32]| chunk.iter().map(|&x| f(x)).sum::<f64>();

    if data.len() > parallel_threshold {
        let partials: Vec<f64> = data.par_chunks(CHUNK_SIZE).map(partial).collect();
        partials.iter().sum()
    } else {
        data.chunks(CHUNK_SIZE).map(partial).sum()
    }
}

/// Sum of absolute values.
pub fn sum_abs(data: &[f32], parallel_threshold: usize) -> f64 {
    chunked_sum(data, parallel_threshold, |x| f64::from(x.abs()))
}

/// Sum of squares.
pub fn sum_sq(data: &[f32], parallel_threshold: usize) -> f64 {
    chunked_sum(data, parallel_threshold, |x| {
        let x = f64::from(x);
        x * x
    })
}

/// Mean absolute value, 0 for an empty slice.
pub fn mean_abs(data: &[f32], parallel_threshold: usize) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    sum_abs(data, parallel_threshold) / data.len() as f64
}

/// Root mean square, 0 for an empty slice.
pub fn rms(data: &[f32], parallel_threshold: usize) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    (sum_sq(data, parallel_threshold) / data.len() as f64).sqrt()
}

/// Sample standard deviation (`n - 1` denominator). 0 when fewer than two values.
pub fn std_dev(data: &[f32], parallel_threshold: usize) -> f64 {
    let n = data.len();
    if n < 2 {
        return 0.0;
    }
    let mean = chunked_sum(data, parallel_threshold, f64::from) / n as f64;
    let ss = chunked_sum(data, parallel_threshold, |x| {
        let d = f64::from(x) - mean;
        d * d
    });
    (ss / (n - 1) as f64).sqrt()
}

/// Index of the first NaN or infinite value.
pub fn find_non_finite(data: &[f32]) -> Option<usize> {
    data.iter().position(|x| !x.is_finite())
}

/// Reconstruction error between an original and an approximation.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct ErrorStats {
    /// Number of compared values.
    pub count: usize,
    /// Mean squared error.
    pub mse: f64,
    /// Mean absolute error.
    pub mae: f64,
    /// Largest absolute error.
    pub max: f64,
    /// `rmse / std(original)`.
    pub relative_rmse: f64,
}

impl ErrorStats {
    /// Compare two equally long buffers.
    pub fn between(original: &[f32], approx: &[f32]) -> Self {
        let count = original.len().min(approx.len());
        if count == 0 {
            return Self::default();
        }

        let mut mse_acc = 0.0f64;
        let mut mae_acc = 0.0f64;
        let mut max_err = 0.0f64;
        for (&o, &a) in original.iter().zip(approx.iter()) {
            let diff = (f64::from(o) - f64::from(a)).abs();
            mse_acc += diff * diff;
            mae_acc += diff;
            if diff > max_err {
                max_err = diff;
            }
        }

        let mse = mse_acc / count as f64;
        let std = std_dev(&original[..count], usize::MAX);
        Self {
            count,
            mse,
            mae: mae_acc / count as f64,
            max: max_err,
            relative_rmse: mse.sqrt() / (std + f64::from(crate::STD_EPSILON)),
        }
    }

    /// Fold another tensor's statistics into a running total.
    pub fn merge(&self, other: &Self) -> Self {
        let count = self.count + other.count;
        if count == 0 {
            return Self::default();
        }
        let w_self = self.count as f64 / count as f64;
        let w_other = other.count as f64 / count as f64;
        Self {
            count,
            mse: self.mse * w_self + other.mse * w_other,
            mae: self.mae * w_self + other.mae * w_other,
            max: self.max.max(other.max),
            relative_rmse: self.relative_rmse * w_self + other.relative_rmse * w_other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_reductions() {
        let data = vec![1.0f32, -2.0, 3.0, -4.0];
        assert_eq!(sum_abs(&data, usize::MAX), 10.0);
        assert_eq!(mean_abs(&data, usize::MAX), 2.5);
        assert!((rms(&data, usize::MAX) - 7.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_std_dev_is_sample_std() {
        let data = vec![2.0f32, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        // population std is 2.0; sample std is sqrt(32 / 7)
        assert!((std_dev(&data, usize::MAX) - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert_eq!(std_dev(&[3.0], usize::MAX), 0.0);
        assert_eq!(std_dev(&[], usize::MAX), 0.0);
    }

    #[test]
    fn test_parallel_matches_serial_bitwise() {
        let data: Vec<f32> = (0..100_000).map(|i| ((i as f32) * 0.013).sin()).collect();
        assert_eq!(
            sum_abs(&data, usize::MAX).to_bits(),
            sum_abs(&data, 0).to_bits()
        );
        assert_eq!(rms(&data, usize::MAX).to_bits(), rms(&data, 0).to_bits());
        assert_eq!(
            std_dev(&data, usize::MAX).to_bits(),
            std_dev(&data, 0).to_bits()
        );
    }

    #[test]
    fn test_find_non_finite() {
        assert_eq!(find_non_finite(&[0.0, 1.0]), None);
        assert_eq!(find_non_finite(&[0.0, f32::NAN, f32::INFINITY]), Some(1));
    }

    #[test]
    fn test_error_stats() {
        let original = vec![1.0f32, -1.0, 1.0, -1.0];
        let approx = vec![1.0f32, -1.0, 0.5, -1.0];
        let stats = ErrorStats::between(&original, &approx);
        assert_eq!(stats.count, 4);
        assert!((stats.mae - 0.125).abs() < 1e-12);
        assert!((stats.max - 0.5).abs() < 1e-12);
        assert!((stats.mse - 0.0625).abs() < 1e-12);

        let merged = stats.merge(&ErrorStats::default());
        assert_eq!(merged, stats);
    }
}
