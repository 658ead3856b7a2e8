//! Error types for ternpak.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors raised by the codec and the archive rewriter.
///
/// Every variant is fatal for a conversion: a packed archive is loaded as a
/// unit, so nothing is skipped or partially written.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The input dimension of a quantizable tensor cannot be split into groups of 4.
    #[error("tensor '{name}' has shape {shape:?}: input dimension must be divisible by 4")]
    IndivisibleWidth {
        /// Offending tensor.
        name: String,
        /// Its full shape.
        shape: Vec<usize>,
    },

    /// Buffer length or dimensions do not agree.
    #[error("shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor or buffer the check ran on.
        name: String,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A packed byte does not decode to a ternary value.
    #[error("invalid {layout} code {code:#04x} at byte offset {offset}")]
    InvalidCode {
        /// Layout tag being decoded.
        layout: &'static str,
        /// The raw byte or 2-bit code.
        code: u8,
        /// Offset of the byte inside the packed buffer.
        offset: usize,
    },

    /// Dtype the operation cannot handle.
    #[error("tensor '{name}' has unsupported dtype {dtype}")]
    UnsupportedDtype {
        /// Offending tensor.
        name: String,
        /// Dtype as reported by safetensors.
        dtype: String,
    },

    /// NaN or infinity in a tensor that must be quantized.
    #[error("tensor '{name}' contains a non-finite value at index {index}")]
    NonFinite {
        /// Offending tensor.
        name: String,
        /// First non-finite element.
        index: usize,
    },

    /// A derived output name is already taken by an input tensor.
    #[error("output name '{output}' derived from '{source_name}' already exists in the input archive")]
    NameCollision {
        /// Tensor being renamed.
        source_name: String,
        /// Name that clashes.
        output: String,
    },

    /// Two shards of one model define the same tensor.
    #[error("tensor '{name}' in {path} is already defined by an earlier shard")]
    DuplicateTensor {
        /// Tensor name.
        name: String,
        /// Shard holding the second definition.
        path: PathBuf,
    },

    /// Required archive metadata key is absent.
    #[error("archive metadata is missing required key '{0}'")]
    MissingMetadata(String),

    /// Required key missing from a model config sidecar.
    #[error("model config is missing required key '{0}'")]
    MissingConfigKey(String),

    /// Tensor expected in an archive was not found.
    #[error("tensor '{0}' not found in archive")]
    MissingTensor(String),

    /// I/O failure bound to a path.
    #[error("archive I/O failed for {path}: {source}")]
    Archive {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// safetensors (de)serialization error.
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error without path context.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl CodecError {
    /// Wrap an I/O error with the path it happened on.
    pub fn archive(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Archive {
            path: path.into(),
            source,
        }
    }
}
