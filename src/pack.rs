//! Byte layouts for a packed basis set.
//!
//! Both layouts walk the input dimension in groups of four columns, so the
//! input dimension must be divisible by 4.
//!
//! **Interleaved8** (`ternary8_interleaved_v1`): one byte per value, the
//! signed value reinterpreted as unsigned (`-1 -> 255`, `0 -> 0`, `1 -> 1`).
//! Logical shape `[Out, In/4, K, 4]`; for each row and column group the K
//! bases' four values sit next to each other, basis index varying slower
//! than the in-group offset.
//!
//! **Dense2** (`ternary2_v1`, canonical): each value becomes a 2-bit code
//! `(v + 3) % 3` (`-1 -> 2`, `0 -> 0`, `1 -> 1`) and the four values of one
//! group of one basis share a byte, first column in the low bits:
//! `c0 | c1 << 2 | c2 << 4 | c3 << 6`. Logical shape `[Out, In/4, K]`.
//!
//! Scales are never part of the byte buffer.

use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::decompose::BasisSet;
use crate::error::{CodecError, Result};
use crate::quantize::TernaryBasis;

/// Columns covered by one group.
pub const GROUP_WIDTH: usize = 4;

/// Byte used by `Interleaved8` for a `-1` value.
pub const NEG_ONE_BYTE: u8 = (-1i8) as u8;

/// 2-bit code for `-1` in `Dense2`; code `0b11` is never produced.
pub const NEG_ONE_CODE: u8 = 0b10;

/// Mask of one 2-bit code.
pub const CODE_MASK: u8 = 0b11;

/// Packed byte layout of a basis set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackLayout {
    /// Byte per value, basis-interleaved: `[Out, In/4, K, 4]`.
    #[serde(alias = "ternary8_interleaved_v1")]
    Interleaved8,
    /// Four 2-bit codes per byte: `[Out, In/4, K]`.
    #[default]
    #[serde(alias = "ternary2_v1")]
    Dense2,
}

impl PackLayout {
    /// Versioned tag written to archive metadata.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Interleaved8 => "ternary8_interleaved_v1",
            Self::Dense2 => "ternary2_v1",
        }
    }

    /// Parse a metadata tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ternary8_interleaved_v1" => Some(Self::Interleaved8),
            "ternary2_v1" => Some(Self::Dense2),
            _ => None,
        }
    }

    /// Logical shape of the packed buffer.
    pub fn packed_shape(self, rows: usize, cols: usize, bases: usize) -> Vec<usize> {
        match self {
            Self::Interleaved8 => vec![rows, cols / GROUP_WIDTH, bases, GROUP_WIDTH],
            Self::Dense2 => vec![rows, cols / GROUP_WIDTH, bases],
        }
    }

    /// Bytes per `(row, group, basis)` cell.
    const fn cell_bytes(self) -> usize {
        match self {
            Self::Interleaved8 => GROUP_WIDTH,
            Self::Dense2 => 1,
        }
    }

    /// Total buffer size in bytes.
    pub fn packed_len(self, rows: usize, cols: usize, bases: usize) -> usize {
        rows * (cols / GROUP_WIDTH) * bases * self.cell_bytes()
    }
}

impl fmt::Display for PackLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for PackLayout {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(layout) = Self::from_tag(s) {
            return Ok(layout);
        }
        match s.to_ascii_lowercase().as_str() {
            "a" | "interleaved8" | "interleaved" | "byte" => Ok(Self::Interleaved8),
            "b" | "dense2" | "dense" | "2bit" => Ok(Self::Dense2),
            other => Err(CodecError::InvalidConfig(format!(
                "unknown pack layout '{other}'"
            ))),
        }
    }
}

/// `Interleaved8` byte for one ternary value.
#[inline]
pub fn encode_byte(v: i8) -> u8 {
    v as u8
}

/// Inverse of [`encode_byte`]; anything but 0, 1, 255 is rejected.
#[inline]
pub fn decode_byte(b: u8, offset: usize) -> Result<i8> {
    match b {
        0 => Ok(0),
        1 => Ok(1),
        NEG_ONE_BYTE => Ok(-1),
        code => Err(CodecError::InvalidCode {
            layout: PackLayout::Interleaved8.tag(),
            code,
            offset,
        }),
    }
}

/// `Dense2` code for one ternary value: `(v + 3) % 3`.
#[inline]
pub fn encode_code(v: i8) -> u8 {
    ((i16::from(v) + 3) % 3) as u8
}

/// Inverse of [`encode_code`]; `0b11` has no value.
#[inline]
pub fn decode_code(code: u8) -> Option<i8> {
    match code {
        0 => Some(0),
        1 => Some(1),
        NEG_ONE_CODE => Some(-1),
        _ => None,
    }
}

/// Pack four values into one `Dense2` byte, first value in the low bits.
#[inline]
pub fn pack_group(values: [i8; GROUP_WIDTH]) -> u8 {
    values
        .iter()
        .enumerate()
        .fold(0u8, |byte, (j, &v)| byte | (encode_code(v) << (2 * j)))
}

/// Unpack one `Dense2` byte into four values.
#[inline]
pub fn unpack_group(byte: u8, offset: usize) -> Result<[i8; GROUP_WIDTH]> {
    let mut out = [0i8; GROUP_WIDTH];
    for (j, slot) in out.iter_mut().enumerate() {
        let code = (byte >> (2 * j)) & CODE_MASK;
        *slot = decode_code(code).ok_or(CodecError::InvalidCode {
            layout: PackLayout::Dense2.tag(),
            code,
            offset,
        })?;
    }
    Ok(out)
}

/// Fail unless the last dimension of `shape` is a multiple of [`GROUP_WIDTH`].
pub fn check_width(name: &str, shape: &[usize]) -> Result<()> {
    match shape.last() {
        Some(&cols) if cols % GROUP_WIDTH == 0 => Ok(()),
        _ => Err(CodecError::IndivisibleWidth {
            name: name.to_string(),
            shape: shape.to_vec(),
        }),
    }
}

/// A basis set in packed form plus its scale vector.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedBases {
    pub layout: PackLayout,
    /// Logical shape of `data`.
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
    /// One scale per basis slot.
    pub scales: Vec<f32>,
}

impl PackedBases {
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn cols(&self) -> usize {
        self.shape[1] * GROUP_WIDTH
    }

    pub fn num_bases(&self) -> usize {
        self.scales.len()
    }

    /// Decode back into a basis set.
    pub fn unpack(&self) -> Result<BasisSet> {
        unpack(self.layout, &self.data, self.rows(), self.cols(), &self.scales)
    }
}

/// Pack a basis set.
pub fn pack(set: &BasisSet, layout: PackLayout) -> Result<PackedBases> {
    let (rows, cols, k) = (set.rows(), set.cols(), set.len());
    check_width("basis set", &[rows, cols])?;

    let groups = cols / GROUP_WIDTH;
    let row_bytes = groups * k * layout.cell_bytes();
    let mut data = vec![0u8; rows * row_bytes];
    let bases = set.bases();

    if row_bytes > 0 {
        data.par_chunks_mut(row_bytes)
            .enumerate()
            .for_each(|(r, row_out)| match layout {
                PackLayout::Interleaved8 => pack_row_interleaved8(bases, r, cols, row_out),
                PackLayout::Dense2 => pack_row_dense2(bases, r, cols, row_out),
            });
    }

    Ok(PackedBases {
        layout,
        shape: layout.packed_shape(rows, cols, k),
        data,
        scales: set.scales(),
    })
}

fn pack_row_interleaved8(bases: &[TernaryBasis], r: usize, cols: usize, out: &mut [u8]) {
    let k = bases.len();
    let row = r * cols;
    for g in 0..cols / GROUP_WIDTH {
        for (b, basis) in bases.iter().enumerate() {
            let src = &basis.values[row + g * GROUP_WIDTH..row + (g + 1) * GROUP_WIDTH];
            let dst = &mut out[(g * k + b) * GROUP_WIDTH..(g * k + b + 1) * GROUP_WIDTH];
            for (d, &v) in dst.iter_mut().zip(src) {
                *d = encode_byte(v);
            }
        }
    }
}

fn pack_row_dense2(bases: &[TernaryBasis], r: usize, cols: usize, out: &mut [u8]) {
    let k = bases.len();
    let row = r * cols;
    for g in 0..cols / GROUP_WIDTH {
        for (b, basis) in bases.iter().enumerate() {
            let start = row + g * GROUP_WIDTH;
            let mut group = [0i8; GROUP_WIDTH];
            group.copy_from_slice(&basis.values[start..start + GROUP_WIDTH]);
            out[g * k + b] = pack_group(group);
        }
    }
}

/// Decode a packed buffer into a basis set of `scales.len()` slots.
pub fn unpack(
    layout: PackLayout,
    data: &[u8],
    rows: usize,
    cols: usize,
    scales: &[f32],
) -> Result<BasisSet> {
    check_width("packed buffer", &[rows, cols])?;
    let k = scales.len();
    let expected = layout.packed_len(rows, cols, k);
    if data.len() != expected {
        return Err(CodecError::ShapeMismatch {
            name: format!("{} buffer", layout.tag()),
            expected: layout.packed_shape(rows, cols, k),
            actual: vec![data.len()],
        });
    }

    let groups = cols / GROUP_WIDTH;
    let mut values: Vec<Vec<i8>> = vec![vec![0i8; rows * cols]; k];

    for r in 0..rows {
        for g in 0..groups {
            let dst = r * cols + g * GROUP_WIDTH;
            for (b, basis_values) in values.iter_mut().enumerate() {
                let cell = (r * groups + g) * k + b;
                let group = match layout {
                    PackLayout::Interleaved8 => {
                        let offset = cell * GROUP_WIDTH;
                        let mut group = [0i8; GROUP_WIDTH];
                        for (j, slot) in group.iter_mut().enumerate() {
                            *slot = decode_byte(data[offset + j], offset + j)?;
                        }
                        group
                    }
                    PackLayout::Dense2 => unpack_group(data[cell], cell)?,
                };
                basis_values[dst..dst + GROUP_WIDTH].copy_from_slice(&group);
            }
        }
    }

    let bases = values
        .into_iter()
        .zip(scales)
        .map(|(values, &scale)| TernaryBasis { values, scale })
        .collect();
    BasisSet::new(rows, cols, bases, k)
}
