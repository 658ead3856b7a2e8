//! Greedy residual decomposition of a weight matrix into ternary bases.
//!
//! ```text
//! residual = W
//! for i in 0..max_bases:
//!     if i > 0 and rms(residual) / (std(W) + eps) < threshold: stop
//!     (Q_i, s_i) = quantize(residual)
//!     residual  -= s_i * Q_i
//! pad with (0, 0.0) up to max_bases
//! ```

use crate::config::{ConvertConfig, RoundingMode, DEFAULT_PARALLEL_THRESHOLD};
use crate::error::{CodecError, Result};
use crate::quantize::{TernaryBasis, TernaryQuantizer};
use crate::utils::{rms, std_dev};
use crate::STD_EPSILON;

/// Dense row-major `rows x cols` matrix of f32 values.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl WeightMatrix {
    /// Wrap a buffer, checking its length against the dimensions.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        let expected = rows.checked_mul(cols).ok_or_else(|| {
            CodecError::InvalidConfig(format!("matrix size {rows}x{cols} overflows"))
        })?;
        if data.len() != expected {
            return Err(CodecError::ShapeMismatch {
                name: "weight matrix".to_string(),
                expected: vec![rows, cols],
                actual: vec![data.len()],
            });
        }
        Ok(WeightMatrix { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        WeightMatrix {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }
}

/// Exactly `max_bases` (basis, scale) pairs approximating one matrix.
///
/// Index 0 is extracted from the matrix itself, later slots from what the
/// earlier ones left behind. Slots after an early stop hold zero bases with
/// scale `0.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisSet {
    rows: usize,
    cols: usize,
    bases: Vec<TernaryBasis>,
    used: usize,
}

impl BasisSet {
    /// Build a set from already-computed bases, padding to `max_bases`.
    ///
    /// Every basis must hold `rows * cols` values in {-1, 0, 1} and a finite,
    /// non-negative scale.
    pub fn new(
        rows: usize,
        cols: usize,
        mut bases: Vec<TernaryBasis>,
        max_bases: usize,
    ) -> Result<Self> {
        if bases.len() > max_bases {
            return Err(CodecError::InvalidConfig(format!(
                "{} bases exceed the basis count {max_bases}",
                bases.len()
            )));
        }

        let len = rows * cols;
        for (i, basis) in bases.iter().enumerate() {
            if basis.values.len() != len {
                return Err(CodecError::ShapeMismatch {
                    name: format!("basis {i}"),
                    expected: vec![rows, cols],
                    actual: vec![basis.values.len()],
                });
            }
            if let Some(offset) = basis.values.iter().position(|v| !(-1..=1).contains(v)) {
                return Err(CodecError::InvalidCode {
                    layout: "ternary",
                    code: basis.values[offset] as u8,
                    offset,
                });
            }
            if !basis.scale.is_finite() || basis.scale < 0.0 {
                return Err(CodecError::InvalidConfig(format!(
                    "basis {i} has invalid scale {}",
                    basis.scale
                )));
            }
        }

        let used = bases.len();
        bases.resize_with(max_bases, || TernaryBasis::zeros(len));

        Ok(BasisSet {
            rows,
            cols,
            bases,
            used,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of slots, always the configured basis count.
    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    /// Bases extracted before the early stop (the rest are padding).
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bases that actually contribute to the reconstruction.
    pub fn active(&self) -> usize {
        self.bases.iter().filter(|b| !b.is_zero()).count()
    }

    pub fn bases(&self) -> &[TernaryBasis] {
        &self.bases
    }

    pub fn basis(&self, index: usize) -> &TernaryBasis {
        &self.bases[index]
    }

    /// Scale vector, one entry per slot.
    pub fn scales(&self) -> Vec<f32> {
        self.bases.iter().map(|b| b.scale).collect()
    }

    /// `sum_i scale_i * basis_i` using the first `terms` slots.
    pub fn reconstruct_prefix(&self, terms: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; self.rows * self.cols];
        for basis in self.bases.iter().take(terms) {
            basis.accumulate_into(&mut out);
        }
        out
    }

    /// `sum_i scale_i * basis_i` over all slots.
    pub fn reconstruct(&self) -> Vec<f32> {
        self.reconstruct_prefix(self.bases.len())
    }

    /// Same ternary content and scales, ignoring where the early stop happened.
    ///
    /// A loop that breaks early and one that runs on and emits zero bases
    /// describe the same matrix.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.rows == other.rows && self.cols == other.cols && self.bases == other.bases
    }
}

/// Greedy residual decomposer.
#[derive(Debug, Clone, Copy)]
pub struct Decomposer {
    max_bases: usize,
    threshold: f32,
    quantizer: TernaryQuantizer,
}

impl Decomposer {
    pub fn new(max_bases: usize, threshold: f32, quantizer: TernaryQuantizer) -> Self {
        Decomposer {
            max_bases,
            threshold,
            quantizer,
        }
    }

    /// Decomposer with the quantizer settings of a conversion config.
    pub fn from_config(config: &ConvertConfig) -> Self {
        Self::new(
            config.max_bases,
            config.threshold,
            TernaryQuantizer::new(config.rounding, config.parallel_threshold),
        )
    }

    pub fn max_bases(&self) -> usize {
        self.max_bases
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Decompose `w` into exactly `max_bases` slots.
    pub fn decompose(&self, w: &WeightMatrix) -> Result<BasisSet> {
        Ok(self.decompose_with_trace(w)?.0)
    }

    /// Decompose and also return the relative error measured before each
    /// extracted basis plus the final one.
    pub fn decompose_with_trace(&self, w: &WeightMatrix) -> Result<(BasisSet, Vec<f64>)> {
        let parallel_threshold = self.quantizer.parallel_threshold();
        let mut residual = w.as_slice().to_vec();
        let norm = std_dev(&residual, parallel_threshold) + f64::from(STD_EPSILON);

        let mut bases = Vec::with_capacity(self.max_bases);
        let mut trace = Vec::with_capacity(self.max_bases + 1);

        for i in 0..self.max_bases {
            let rel_error = rms(&residual, parallel_threshold) / norm;
            trace.push(rel_error);

            if i > 0 && rel_error < f64::from(self.threshold) {
                break;
            }

            let basis = self.quantizer.quantize(&residual);
            basis.subtract_from(&mut residual, parallel_threshold);
            bases.push(basis);
        }

        if bases.len() == self.max_bases {
            trace.push(rms(&residual, parallel_threshold) / norm);
        }

        let set = BasisSet::new(w.rows(), w.cols(), bases, self.max_bases)?;
        Ok((set, trace))
    }
}

impl Default for Decomposer {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_BASES,
            crate::config::DEFAULT_THRESHOLD,
            TernaryQuantizer::new(RoundingMode::default(), DEFAULT_PARALLEL_THRESHOLD),
        )
    }
}
