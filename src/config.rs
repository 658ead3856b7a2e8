//! Conversion settings.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};
use crate::pack::PackLayout;

/// Default number of basis slots per matrix.
pub const DEFAULT_MAX_BASES: usize = 3;
/// Largest basis count an engine is expected to handle.
pub const MAX_SUPPORTED_BASES: usize = 8;
/// Default relative-RMSE early-stop threshold.
pub const DEFAULT_THRESHOLD: f32 = 0.05;
/// Element count above which reductions and quantization run on rayon.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1 << 16;

/// Rounding rule applied to `residual / scale` before clamping to {-1, 0, 1}.
///
/// The rule is part of the packed format contract and is written to archive
/// metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Banker's rounding: 0.5 -> 0, 1.5 -> 2.
    #[default]
    HalfToEven,
    /// 0.5 -> 1, -0.5 -> -1.
    HalfAwayFromZero,
}

impl RoundingMode {
    /// Metadata tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HalfToEven => "half_to_even",
            Self::HalfAwayFromZero => "half_away_from_zero",
        }
    }

    /// Round one value.
    #[inline]
    pub fn round(self, x: f32) -> f32 {
        match self {
            Self::HalfToEven => x.round_ties_even(),
            Self::HalfAwayFromZero => x.round(),
        }
    }
}

impl fmt::Display for RoundingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoundingMode {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "half_to_even" | "half-to-even" | "even" => Ok(Self::HalfToEven),
            "half_away_from_zero" | "half-away-from-zero" | "away" => Ok(Self::HalfAwayFromZero),
            other => Err(CodecError::InvalidConfig(format!(
                "unknown rounding mode '{other}'"
            ))),
        }
    }
}

/// Norm used to derive a basis scale from the residual.
///
/// Only the mean absolute value is implemented; "l1" is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleNorm {
    /// `scale = mean(|R|)`.
    #[default]
    MeanAbs,
}

impl ScaleNorm {
    /// Metadata tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MeanAbs => "mean_abs",
        }
    }
}

impl fmt::Display for ScaleNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScaleNorm {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean_abs" | "mean-abs" => Ok(Self::MeanAbs),
            "l1" | "l1_norm" => Err(CodecError::InvalidConfig(
                "scale norm 'l1' is not implemented; use 'mean_abs'".to_string(),
            )),
            other => Err(CodecError::InvalidConfig(format!(
                "unknown scale norm '{other}'"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for ScaleNorm {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(d)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// Reduced precision for pass-through float tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDtype {
    /// IEEE half precision.
    F16,
    /// bfloat16.
    Bf16,
}

impl fmt::Display for StorageDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F16 => f.write_str("f16"),
            Self::Bf16 => f.write_str("bf16"),
        }
    }
}

impl FromStr for StorageDtype {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f16" | "fp16" | "half" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            other => Err(CodecError::InvalidConfig(format!(
                "unknown storage dtype '{other}'"
            ))),
        }
    }
}

/// Settings for one archive conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Fixed number of basis slots written per matrix.
    pub max_bases: usize,

    /// Stop adding bases once `rms(residual) / std(W)` falls below this.
    pub threshold: f32,

    /// Packed byte layout.
    pub layout: PackLayout,

    /// Rounding rule of the quantizer.
    pub rounding: RoundingMode,

    /// Scale norm of the quantizer.
    pub scale_norm: ScaleNorm,

    /// Narrow pass-through float tensors to this dtype. Scales are never narrowed.
    pub narrow: Option<StorageDtype>,

    /// A quantizable name must contain one of these.
    pub linear_markers: Vec<String>,

    /// A name containing any of these is never quantized.
    pub exclude_markers: Vec<String>,

    /// Worker count for the conversion pool. `None` uses the rayon default.
    pub threads: Option<usize>,

    /// Element count above which per-tensor math runs in parallel.
    pub parallel_threshold: usize,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            max_bases: DEFAULT_MAX_BASES,
            threshold: DEFAULT_THRESHOLD,
            layout: PackLayout::default(),
            rounding: RoundingMode::default(),
            scale_norm: ScaleNorm::default(),
            narrow: None,
            linear_markers: vec!["proj".to_string(), "linear".to_string()],
            exclude_markers: vec!["embed_tokens".to_string(), "lm_head".to_string()],
            threads: None,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

impl ConvertConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a JSON file. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or fails validation.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CodecError::archive(path, e))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the basis count.
    #[must_use]
    pub fn with_max_bases(mut self, max_bases: usize) -> Self {
        self.max_bases = max_bases;
        self
    }

    /// Set the early-stop threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the packed layout.
    #[must_use]
    pub fn with_layout(mut self, layout: PackLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the rounding rule.
    #[must_use]
    pub fn with_rounding(mut self, rounding: RoundingMode) -> Self {
        self.rounding = rounding;
        self
    }

    /// Narrow pass-through float tensors.
    #[must_use]
    pub fn with_narrow(mut self, narrow: Option<StorageDtype>) -> Self {
        self.narrow = narrow;
        self
    }

    /// Set the worker count.
    #[must_use]
    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.max_bases == 0 || self.max_bases > MAX_SUPPORTED_BASES {
            return Err(CodecError::InvalidConfig(format!(
                "max_bases must be in 1..={MAX_SUPPORTED_BASES}, got {}",
                self.max_bases
            )));
        }

        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(CodecError::InvalidConfig(format!(
                "threshold must be finite and >= 0, got {}",
                self.threshold
            )));
        }

        if self.threads == Some(0) {
            return Err(CodecError::InvalidConfig(
                "threads must be > 0".to_string(),
            ));
        }

        if self.linear_markers.is_empty() {
            return Err(CodecError::InvalidConfig(
                "linear_markers must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
