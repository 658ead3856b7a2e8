//! ternpak: adaptive multi-basis ternary weight codec.
//!
//! A dense weight matrix `W` is approximated by a short sum of scaled ternary
//! matrices, `W ~ s0*Q0 + s1*Q1 + ...`, each `Q` holding only -1, 0 and 1.
//! The bases are extracted greedily from the residual and packed into a byte
//! layout an inference engine reads directly.
//!
//! ```text
//! archive -> classify -> decompose -> pack -> archive
//!                          |
//!                       quantize (per basis)
//! ```

pub mod archive;
pub mod config;
pub mod convert;
pub mod decompose;
pub mod error;
pub mod pack;
pub mod quantize;
pub mod sidecar;
pub mod utils;
pub mod verify;

/// Value of the `format` metadata key.
pub const FORMAT_NAME: &str = "ternpak";
/// Current packed archive format version.
pub const FORMAT_VERSION: &str = "1";
/// A mean-absolute scale below this is treated as zero.
pub const SCALE_EPSILON: f32 = 1e-9;
/// Added to the standard deviation of `W` when normalizing the residual error.
pub const STD_EPSILON: f32 = 1e-9;

pub use archive::{TensorArchive, TensorEntry};
pub use config::{ConvertConfig, RoundingMode, ScaleNorm, StorageDtype};
pub use convert::{convert_archive, convert_file, ConversionReport, TensorRole};
pub use decompose::{BasisSet, Decomposer, WeightMatrix};
pub use error::{CodecError, Result};
pub use pack::{pack, unpack, PackLayout, PackedBases};
pub use quantize::{quantize_ternary, TernaryBasis, TernaryQuantizer};
pub use sidecar::{EngineConfig, ModelConfig};
pub use verify::{verify, verify_files, ArchiveFormat, VerifyReport};

#[cfg(test)]
mod tests {
    use super::*;

    fn known_matrix() -> WeightMatrix {
        let data = (0..64)
            .map(|i| {
                let (r, c) = ((i / 8) as f32, (i % 8) as f32);
                (r * 0.3 - c * 0.7).sin() + 0.1 * c
            })
            .collect();
        WeightMatrix::new(8, 8, data).expect("8x8 matrix")
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            let diff = (x - y).abs();
            assert!(
                diff <= tol,
                "value mismatch at {}: {} vs {} (tol {})",
                i,
                x,
                y,
                tol
            );
        }
    }

    #[test]
    fn zero_threshold_fills_every_slot_interleaved8() {
        let w = known_matrix();
        let set = Decomposer::new(3, 0.0, TernaryQuantizer::default())
            .decompose(&w)
            .expect("decomposition should succeed");
        assert_eq!(set.used(), 3);
        assert_eq!(set.active(), 3);

        let packed = pack(&set, PackLayout::Interleaved8).expect("pack should succeed");
        assert_eq!(packed.shape, vec![8, 2, 3, 4]);

        // [0, 0, 0, :] is basis 0 on row 0, columns 0..4
        let scale0 = set.scales()[0];
        for j in 0..4 {
            let expected = RoundingMode::HalfToEven
                .round(w.get(0, j) / scale0)
                .clamp(-1.0, 1.0) as i8;
            let got = pack::decode_byte(packed.data[j], j).expect("valid byte");
            assert_eq!(got, expected, "column {j}");
        }
    }

    #[test]
    fn high_threshold_keeps_one_basis() {
        let w = known_matrix();
        let set = Decomposer::new(3, 0.99, TernaryQuantizer::default())
            .decompose(&w)
            .expect("decomposition should succeed");
        assert_eq!(set.active(), 1);
        let scales = set.scales();
        assert!(scales[0] > 0.0);
        assert_eq!(scales[1], 0.0);
        assert_eq!(scales[2], 0.0);
    }

    #[test]
    fn zero_matrix_yields_zero_slots() {
        let w = WeightMatrix::zeros(4, 4);
        let set = Decomposer::default()
            .decompose(&w)
            .expect("decomposition should succeed");
        assert!(set.bases().iter().all(|b| b.scale == 0.0));
        assert!(set.bases().iter().all(|b| b.values.iter().all(|&v| v == 0)));
    }

    #[test]
    fn dense2_group_byte() {
        let bases = vec![TernaryBasis {
            values: vec![1, 0, -1, 1],
            scale: 1.0,
        }];
        let set = BasisSet::new(1, 4, bases, 1).expect("valid basis set");
        let packed = pack(&set, PackLayout::Dense2).expect("pack should succeed");
        assert_eq!(packed.data, vec![1 | (0 << 2) | (2 << 4) | (1 << 6)]);
    }

    #[test]
    fn unpacked_reconstruction_is_bit_exact() {
        let w = known_matrix();
        let set = Decomposer::new(3, 0.0, TernaryQuantizer::default())
            .decompose(&w)
            .expect("decomposition should succeed");
        let direct = set.reconstruct();

        for layout in [PackLayout::Interleaved8, PackLayout::Dense2] {
            let restored = pack(&set, layout)
                .and_then(|p| p.unpack())
                .expect("round trip should succeed");
            assert_close(&restored.reconstruct(), &direct, 0.0);
        }
    }
}
