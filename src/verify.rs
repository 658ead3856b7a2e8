//! Reconstruction check of a converted archive against its source.

use std::collections::BTreeMap;
use std::path::Path;

use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::archive::TensorArchive;
use crate::convert::{meta, packed_name, scales_name, PACKED_SUFFIX, WEIGHT_SUFFIX};
use crate::decompose::BasisSet;
use crate::error::{CodecError, Result};
use crate::pack::{unpack, PackLayout, GROUP_WIDTH};
use crate::utils::ErrorStats;
use crate::{FORMAT_NAME, FORMAT_VERSION};

/// Packing parameters read back from archive metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFormat {
    pub layout: PackLayout,
    pub max_bases: usize,
    pub rounding: Option<String>,
}

fn required<'a>(metadata: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| CodecError::MissingMetadata(key.to_string()))
}

impl ArchiveFormat {
    /// Read the format keys; the layout is never guessed.
    pub fn from_metadata(metadata: &BTreeMap<String, String>) -> Result<Self> {
        let format = required(metadata, meta::FORMAT)?;
        if format != FORMAT_NAME {
            return Err(CodecError::InvalidConfig(format!(
                "archive format is '{format}', expected '{FORMAT_NAME}'"
            )));
        }

        let version = required(metadata, meta::FORMAT_VERSION)?;
        if version != FORMAT_VERSION {
            return Err(CodecError::InvalidConfig(format!(
                "unsupported format version '{version}'"
            )));
        }

        let tag = required(metadata, meta::LAYOUT)?;
        let layout = PackLayout::from_tag(tag)
            .ok_or_else(|| CodecError::InvalidConfig(format!("unknown layout tag '{tag}'")))?;

        let max_bases = required(metadata, meta::MAX_BASES)?
            .parse()
            .map_err(|e| CodecError::InvalidConfig(format!("bad max_bases: {e}")))?;

        Ok(ArchiveFormat {
            layout,
            max_bases,
            rounding: metadata.get(meta::ROUNDING).cloned(),
        })
    }
}

/// Original weight names of every packed tensor in `archive`.
pub fn packed_weights(archive: &TensorArchive) -> Vec<String> {
    archive
        .tensors
        .keys()
        .filter_map(|k| k.strip_suffix(PACKED_SUFFIX))
        .map(|stem| format!("{stem}{WEIGHT_SUFFIX}"))
        .collect()
}

/// Unpack the basis set stored for weight `name`.
pub fn unpack_weight(
    archive: &TensorArchive,
    format: &ArchiveFormat,
    name: &str,
) -> Result<BasisSet> {
    let missing = || CodecError::MissingTensor(name.to_string());
    let packed_key = packed_name(name).ok_or_else(missing)?;
    let scales_key = scales_name(name).ok_or_else(missing)?;

    let packed = archive.require(&packed_key)?;
    let scales = archive.require(&scales_key)?.to_f32_vec(&scales_key)?;
    if scales.len() != format.max_bases {
        return Err(CodecError::ShapeMismatch {
            name: scales_key,
            expected: vec![format.max_bases],
            actual: vec![scales.len()],
        });
    }

    let rows = packed.shape.first().copied().unwrap_or(0);
    let cols = packed.shape.get(1).copied().unwrap_or(0) * GROUP_WIDTH;
    let expected = format.layout.packed_shape(rows, cols, format.max_bases);
    if packed.shape != expected {
        return Err(CodecError::ShapeMismatch {
            name: packed_key,
            expected,
            actual: packed.shape.clone(),
        });
    }

    unpack(format.layout, &packed.data, rows, cols, &scales)
}

/// Error of one reconstructed weight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorCheck {
    pub name: String,
    pub shape: Vec<usize>,
    pub active_bases: usize,
    pub stats: ErrorStats,
}

/// Result of comparing a converted archive with its source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub layout: String,
    pub tensors: Vec<TensorCheck>,
    pub total: ErrorStats,
    pub pass_through: usize,
}

impl VerifyReport {
    /// Largest per-tensor relative RMSE.
    pub fn worst_relative_rmse(&self) -> f64 {
        self.tensors
            .iter()
            .map(|t| t.stats.relative_rmse)
            .fold(0.0, f64::max)
    }
}

/// Compare every tensor of `source` with its counterpart in `converted`.
pub fn verify(source: &TensorArchive, converted: &TensorArchive) -> Result<VerifyReport> {
    let format = ArchiveFormat::from_metadata(&converted.metadata)?;

    let mut quantized = Vec::new();
    let mut pass_through = 0;
    for (name, entry) in &source.tensors {
        let is_packed = packed_name(name)
            .map(|p| converted.tensors.contains_key(&p))
            .unwrap_or(false);
        if is_packed {
            quantized.push((name.as_str(), entry));
            continue;
        }

        let out = converted.require(name)?;
        if out.shape != entry.shape {
            return Err(CodecError::ShapeMismatch {
                name: name.clone(),
                expected: entry.shape.clone(),
                actual: out.shape.clone(),
            });
        }
        pass_through += 1;
    }

    let tensors = quantized
        .par_iter()
        .map(|(name, entry)| -> Result<TensorCheck> {
            let set = unpack_weight(converted, &format, name)?;
            let expected_shape = vec![set.rows(), set.cols()];
            if entry.shape != expected_shape {
                return Err(CodecError::ShapeMismatch {
                    name: name.to_string(),
                    expected: entry.shape.clone(),
                    actual: expected_shape,
                });
            }
            let original = entry.to_f32_vec(name)?;
            Ok(TensorCheck {
                name: name.to_string(),
                shape: expected_shape,
                active_bases: set.active(),
                stats: ErrorStats::between(&original, &set.reconstruct()),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let total = tensors
        .iter()
        .fold(ErrorStats::default(), |acc, t| acc.merge(&t.stats));

    info!(
        quantized = tensors.len(),
        pass_through,
        mse = total.mse,
        relative_rmse = total.relative_rmse,
        "verified archive"
    );

    Ok(VerifyReport {
        layout: format.layout.tag().to_string(),
        tensors,
        total,
        pass_through,
    })
}

/// Load both archives and run [`verify`].
pub fn verify_files(source: &Path, converted: &Path) -> Result<VerifyReport> {
    let source = TensorArchive::open(source)?;
    let converted = TensorArchive::load(converted)?;
    verify(&source, &converted)
}
