//! Named tensor archives stored as safetensors files.
//!
//! Reading maps the file with memmap2 and copies every tensor out before the
//! mapping is dropped, so a loaded [`TensorArchive`] owns its bytes. Writing
//! serializes the whole archive first and then moves a temp file over the
//! target path; a failed save leaves no file behind.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::StorageDtype;
use crate::error::{CodecError, Result};

/// File extension of archive shards.
pub const SAFETENSORS_EXT: &str = "safetensors";

/// Header key holding the string metadata.
const HEADER_METADATA_KEY: &str = "__metadata__";

/// The JSON header is space-padded to this many bytes.
const HEADER_ALIGNMENT: usize = 8;

/// One tensor: dtype, shape and little-endian payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorEntry {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

/// True for the float dtypes the codec can read.
pub fn is_float_dtype(dtype: Dtype) -> bool {
    matches!(dtype, Dtype::F32 | Dtype::F16 | Dtype::BF16 | Dtype::F64)
}

impl TensorEntry {
    /// F32 tensor from values.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        TensorEntry {
            dtype: Dtype::F32,
            shape,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// U8 tensor from raw bytes.
    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> Self {
        TensorEntry {
            dtype: Dtype::U8,
            shape,
            data,
        }
    }

    /// Encode f32 values as one of the float dtypes.
    pub fn encode_f32(name: &str, dtype: Dtype, shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = match dtype {
            Dtype::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Dtype::F64 => values
                .iter()
                .flat_map(|&v| f64::from(v).to_le_bytes())
                .collect(),
            Dtype::F16 => values
                .iter()
                .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                .collect(),
            Dtype::BF16 => values
                .iter()
                .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
                .collect(),
            other => return Err(unsupported(name, other)),
        };
        Ok(TensorEntry { dtype, shape, data })
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decode a float tensor into f32 values.
    pub fn to_f32_vec(&self, name: &str) -> Result<Vec<f32>> {
        let values = match self.dtype {
            Dtype::F32 => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Dtype::BF16 => self
                .data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Dtype::F64 => self
                .data
                .chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    f64::from_le_bytes(b) as f32
                })
                .collect::<Vec<f32>>(),
            other => return Err(unsupported(name, other)),
        };
        Ok(values)
    }

    /// Copy at reduced precision, or `None` when the tensor is not a float
    /// tensor wider than `target`.
    pub fn narrowed(&self, name: &str, target: StorageDtype) -> Result<Option<Self>> {
        if !matches!(self.dtype, Dtype::F32 | Dtype::F64) {
            return Ok(None);
        }
        let values = self.to_f32_vec(name)?;
        let dtype = match target {
            StorageDtype::F16 => Dtype::F16,
            StorageDtype::Bf16 => Dtype::BF16,
        };
        Self::encode_f32(name, dtype, self.shape.clone(), &values).map(Some)
    }
}

fn unsupported(name: &str, dtype: Dtype) -> CodecError {
    CodecError::UnsupportedDtype {
        name: name.to_string(),
        dtype: format!("{dtype:?}"),
    }
}

/// Tensors by name plus string metadata.
///
/// Both maps are ordered; [`TensorArchive::to_bytes`] output depends only on
/// their contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorArchive {
    pub tensors: BTreeMap<String, TensorEntry>,
    pub metadata: BTreeMap<String, String>,
}

impl TensorArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TensorEntry> {
        self.tensors.get(name)
    }

    /// Look up a tensor that has to be present.
    pub fn require(&self, name: &str) -> Result<&TensorEntry> {
        self.tensors
            .get(name)
            .ok_or_else(|| CodecError::MissingTensor(name.to_string()))
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: TensorEntry) -> Option<TensorEntry> {
        self.tensors.insert(name.into(), entry)
    }

    /// Parse a serialized safetensors buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header
            .metadata()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        let st = SafeTensors::deserialize(bytes)?;
        let tensors = st
            .tensors()
            .into_iter()
            .map(|(name, view)| {
                let entry = TensorEntry {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                    data: view.data().to_vec(),
                };
                (name, entry)
            })
            .collect();

        Ok(TensorArchive { tensors, metadata })
    }

    /// Serialize to a safetensors buffer.
    ///
    /// The header is written with sorted keys and tensors are laid out by
    /// descending element size, then name, so equal archives give equal bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut order: Vec<(&String, &TensorEntry)> = self.tensors.iter().collect();
        order.sort_by(|(a_name, a), (b_name, b)| {
            b.dtype
                .size()
                .cmp(&a.dtype.size())
                .then_with(|| a_name.cmp(b_name))
        });

        let mut header = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header.insert(HEADER_METADATA_KEY.to_string(), serde_json::to_value(&self.metadata)?);
        }
        let mut offset = 0usize;
        for (name, t) in &order {
            // Rejects payloads whose length does not match dtype and shape.
            TensorView::new(t.dtype, t.shape.clone(), &t.data)?;
            let end = offset + t.data.len();
            header.insert(
                (*name).clone(),
                serde_json::json!({
                    "dtype": t.dtype,
                    "shape": t.shape,
                    "data_offsets": [offset, end],
                }),
            );
            offset = end;
        }

        let mut header = serde_json::to_vec(&header)?;
        let padded = header.len().next_multiple_of(HEADER_ALIGNMENT);
        header.resize(padded, b' ');

        let mut bytes = Vec::with_capacity(8 + header.len() + offset);
        bytes.extend_from_slice(&(header.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&header);
        for (_, t) in &order {
            bytes.extend_from_slice(&t.data);
        }
        Ok(bytes)
    }

    /// Load one `.safetensors` file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| CodecError::archive(path, e))?;
        // SAFETY: the mapping is read-only and dropped before this function returns.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| CodecError::archive(path, e))?;
        let archive = Self::from_bytes(&mmap)?;
        debug!(path = %path.display(), tensors = archive.len(), "loaded archive");
        Ok(archive)
    }

    /// Load every shard of a directory, in file-name order.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let shards = find_shards(dir)?;
        let mut merged = TensorArchive::new();
        for shard in &shards {
            let part = Self::load(shard)?;
            for (name, entry) in part.tensors {
                if merged.tensors.contains_key(&name) {
                    return Err(CodecError::DuplicateTensor {
                        name,
                        path: shard.clone(),
                    });
                }
                merged.tensors.insert(name, entry);
            }
            for (key, value) in part.metadata {
                merged.metadata.entry(key).or_insert(value);
            }
        }
        Ok(merged)
    }

    /// Load a file or a shard directory.
    pub fn open(path: &Path) -> Result<Self> {
        if path.is_dir() {
            Self::load_dir(path)
        } else {
            Self::load(path)
        }
    }

    /// Write atomically to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        write_atomic(path, &bytes)?;
        debug!(path = %path.display(), bytes = bytes.len(), "saved archive");
        Ok(())
    }
}

/// Bytes written to a temp file next to their target, not yet renamed into
/// place. Dropping it removes the temp file.
#[derive(Debug)]
pub struct StagedFile {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    /// Write and sync `bytes` to a temp file in the directory of `path`.
    pub fn new(path: &Path, bytes: &[u8]) -> Result<Self> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CodecError::archive(dir, e))?;
        tmp.write_all(bytes)
            .map_err(|e| CodecError::archive(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| CodecError::archive(tmp.path(), e))?;
        Ok(StagedFile {
            tmp,
            target: path.to_path_buf(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the temp file over the target.
    pub fn commit(self) -> Result<PathBuf> {
        let StagedFile { tmp, target } = self;
        tmp.persist(&target)
            .map_err(|e| CodecError::archive(&target, e.error))?;
        Ok(target)
    }
}

/// Write `bytes` to a temp file next to `path`, then rename it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    StagedFile::new(path, bytes)?.commit().map(drop)
}

/// Sorted `.safetensors` files directly inside `dir`.
pub fn find_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| CodecError::archive(dir, e))? {
        let path = entry.map_err(|e| CodecError::archive(dir, e))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == SAFETENSORS_EXT) {
            shards.push(path);
        }
    }
    if shards.is_empty() {
        return Err(CodecError::archive(
            dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "no .safetensors files"),
        ));
    }
    shards.sort();
    Ok(shards)
}
