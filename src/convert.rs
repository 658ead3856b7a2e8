//! Archive rewriter: decompose and pack every linear weight of a model.
//!
//! Conversion runs in two phases. Planning classifies every tensor and checks
//! every quantizable one (width, values, derived names) before any basis is
//! extracted. Execution then decomposes the planned tensors on a rayon pool;
//! each worker returns complete named entries and the output archive is
//! assembled from them in one ordered pass.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::{is_float_dtype, StagedFile, TensorArchive, TensorEntry};
use crate::config::ConvertConfig;
use crate::decompose::{Decomposer, WeightMatrix};
use crate::error::{CodecError, Result};
use crate::pack::{check_width, pack, PackLayout};
use crate::sidecar::{find_model_config, EngineConfig, ModelConfig, CONFIG_FILE};
use crate::utils::find_non_finite;
use crate::{FORMAT_NAME, FORMAT_VERSION};

/// Suffix of a quantizable tensor name.
pub const WEIGHT_SUFFIX: &str = ".weight";
/// Suffix replacing [`WEIGHT_SUFFIX`] on the packed buffer.
pub const PACKED_SUFFIX: &str = ".weight_packed";
/// Suffix replacing [`WEIGHT_SUFFIX`] on the scale vector.
pub const SCALES_SUFFIX: &str = ".scales";

/// Metadata keys written to every converted archive.
pub mod meta {
    pub const FORMAT: &str = "format";
    pub const FORMAT_VERSION: &str = "format_version";
    pub const LAYOUT: &str = "layout";
    pub const MAX_BASES: &str = "max_bases";
    pub const THRESHOLD: &str = "threshold";
    pub const ROUNDING: &str = "rounding";
    pub const SCALE_NORM: &str = "scale_norm";
}

/// How the rewriter treats one tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    /// Decomposed and packed.
    Quantize,
    /// Copied, possibly narrowed.
    PassThrough,
}

/// Classify a tensor by name, rank and dtype.
pub fn classify(name: &str, entry: &TensorEntry, config: &ConvertConfig) -> TensorRole {
    let is_linear = name.ends_with(WEIGHT_SUFFIX)
        && config.linear_markers.iter().any(|m| name.contains(m.as_str()))
        && !config.exclude_markers.iter().any(|m| name.contains(m.as_str()));

    if is_linear && entry.shape.len() == 2 && is_float_dtype(entry.dtype) {
        TensorRole::Quantize
    } else {
        TensorRole::PassThrough
    }
}

fn stem(name: &str) -> Option<&str> {
    name.strip_suffix(WEIGHT_SUFFIX)
}

/// `X.weight` -> `X.weight_packed`.
pub fn packed_name(name: &str) -> Option<String> {
    stem(name).map(|s| format!("{s}{PACKED_SUFFIX}"))
}

/// `X.weight` -> `X.scales`.
pub fn scales_name(name: &str) -> Option<String> {
    stem(name).map(|s| format!("{s}{SCALES_SUFFIX}"))
}

/// Codec metadata for a conversion.
pub fn format_metadata(config: &ConvertConfig) -> BTreeMap<String, String> {
    [
        (meta::FORMAT, FORMAT_NAME.to_string()),
        (meta::FORMAT_VERSION, FORMAT_VERSION.to_string()),
        (meta::LAYOUT, config.layout.tag().to_string()),
        (meta::MAX_BASES, config.max_bases.to_string()),
        (meta::THRESHOLD, config.threshold.to_string()),
        (meta::ROUNDING, config.rounding.as_str().to_string()),
        (meta::SCALE_NORM, config.scale_norm.as_str().to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Outcome for one quantized tensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorReport {
    pub name: String,
    pub shape: Vec<usize>,
    /// Bases extracted before the early stop.
    pub bases_used: usize,
    /// `rms(residual) / std(W)` after the last extracted basis.
    pub rel_error: f64,
}

/// Summary of a conversion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionReport {
    pub layout: String,
    pub quantized: Vec<TensorReport>,
    pub passed_through: usize,
    pub narrowed: usize,
    pub elapsed_ms: u64,
    pub engine_config: Option<PathBuf>,
}

impl ConversionReport {
    /// Mean relative error over quantized tensors.
    pub fn mean_rel_error(&self) -> f64 {
        if self.quantized.is_empty() {
            return 0.0;
        }
        self.quantized.iter().map(|t| t.rel_error).sum::<f64>() / self.quantized.len() as f64
    }
}

/// A weight accepted for quantization, already decoded.
#[derive(Debug)]
struct Planned<'a> {
    name: &'a str,
    matrix: WeightMatrix,
}

/// Result of the planning phase.
#[derive(Debug, Default)]
struct Plan<'a> {
    quantize: Vec<Planned<'a>>,
    pass_through: Vec<(&'a str, &'a TensorEntry)>,
}

fn plan<'a>(input: &'a TensorArchive, config: &ConvertConfig) -> Result<Plan<'a>> {
    let mut plan = Plan::default();

    for (name, entry) in &input.tensors {
        match classify(name, entry, config) {
            TensorRole::PassThrough => plan.pass_through.push((name.as_str(), entry)),
            TensorRole::Quantize => {
                check_width(name, &entry.shape)?;

                let values = entry.to_f32_vec(name)?;
                if let Some(index) = find_non_finite(&values) {
                    return Err(CodecError::NonFinite {
                        name: name.clone(),
                        index,
                    });
                }

                for output in [packed_name(name), scales_name(name)].into_iter().flatten() {
                    if input.tensors.contains_key(&output) {
                        return Err(CodecError::NameCollision {
                            source_name: name.clone(),
                            output,
                        });
                    }
                }

                plan.quantize.push(Planned {
                    name: name.as_str(),
                    matrix: WeightMatrix::new(entry.shape[0], entry.shape[1], values)?,
                });
            }
        }
    }

    Ok(plan)
}

struct Converted {
    entries: [(String, TensorEntry); 2],
    report: TensorReport,
}

fn convert_tensor(
    planned: Planned<'_>,
    decomposer: &Decomposer,
    layout: PackLayout,
) -> Result<Converted> {
    let Planned { name, matrix } = planned;
    let (rows, cols) = (matrix.rows(), matrix.cols());
    let (set, trace) = decomposer.decompose_with_trace(&matrix)?;
    let packed = pack(&set, layout)?;

    let rel_error = trace.last().copied().unwrap_or_default();
    debug!(
        tensor = name,
        rows,
        cols,
        bases_used = set.used(),
        rel_error,
        "packed tensor"
    );

    let prefix = stem(name).unwrap_or(name);
    Ok(Converted {
        entries: [
            (
                format!("{prefix}{PACKED_SUFFIX}"),
                TensorEntry::from_u8(packed.shape, packed.data),
            ),
            (
                format!("{prefix}{SCALES_SUFFIX}"),
                TensorEntry::from_f32(vec![packed.scales.len()], &packed.scales),
            ),
        ],
        report: TensorReport {
            name: name.to_string(),
            shape: vec![rows, cols],
            bases_used: set.used(),
            rel_error,
        },
    })
}

fn build_pool(threads: Option<usize>) -> Result<rayon::ThreadPool> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    Ok(builder.build()?)
}

/// Convert an in-memory archive.
pub fn convert_archive(
    input: &TensorArchive,
    config: &ConvertConfig,
) -> Result<(TensorArchive, ConversionReport)> {
    config.validate()?;
    let start = Instant::now();

    let Plan {
        quantize,
        pass_through,
    } = plan(input, config)?;
    info!(
        quantize = quantize.len(),
        pass_through = pass_through.len(),
        layout = config.layout.tag(),
        max_bases = config.max_bases,
        "planned conversion"
    );

    let decomposer = Decomposer::from_config(config);
    let layout = config.layout;
    let pool = build_pool(config.threads)?;
    let converted: Vec<Converted> = pool.install(|| {
        quantize
            .into_par_iter()
            .map(|planned| convert_tensor(planned, &decomposer, layout))
            .collect::<Result<Vec<_>>>()
    })?;

    let mut output = TensorArchive::new();
    let mut report = ConversionReport {
        layout: layout.tag().to_string(),
        ..ConversionReport::default()
    };

    for (name, entry) in &pass_through {
        let narrowed = match config.narrow {
            Some(target) => entry.narrowed(name, target)?,
            None => None,
        };
        if narrowed.is_some() {
            report.narrowed += 1;
        }
        output.insert(*name, narrowed.unwrap_or_else(|| (*entry).clone()));
        report.passed_through += 1;
    }

    for item in converted {
        for (name, entry) in item.entries {
            if output.tensors.contains_key(&name) {
                return Err(CodecError::NameCollision {
                    source_name: item.report.name,
                    output: name,
                });
            }
            output.insert(name, entry);
        }
        report.quantized.push(item.report);
    }

    output.metadata = input.metadata.clone();
    output.metadata.extend(format_metadata(config));

    report.elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        quantized = report.quantized.len(),
        passed_through = report.passed_through,
        narrowed = report.narrowed,
        mean_rel_error = report.mean_rel_error(),
        elapsed_ms = report.elapsed_ms,
        "converted archive"
    );
    Ok((output, report))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Convert a model file or shard directory into one packed archive.
///
/// The source `config.json` is `model_config` if given, otherwise looked up
/// next to `input`. When one is found an engine config is written next to
/// `output`.
pub fn convert_file(
    input: &Path,
    output: &Path,
    config: &ConvertConfig,
    model_config: Option<&Path>,
) -> Result<ConversionReport> {
    config.validate()?;

    let config_path = model_config
        .map(Path::to_path_buf)
        .or_else(|| find_model_config(input));
    let model = match &config_path {
        Some(path) => Some(ModelConfig::from_json_file(path)?),
        None => None,
    };

    info!(input = %input.display(), "loading archive");
    let source = TensorArchive::open(input)?;
    let (converted, mut report) = convert_archive(&source, config)?;
    drop(source);

    // Stage both files before either is renamed into place.
    let engine = match (model, config_path) {
        (Some(model), Some(source_config)) => {
            let dir = match output.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let target = dir.join(CONFIG_FILE);
            if same_file(&target, &source_config) {
                warn!(path = %target.display(), "not overwriting source model config");
                None
            } else {
                let json = EngineConfig::new(&model, config).to_json()?;
                Some(StagedFile::new(&target, json.as_bytes())?)
            }
        }
        _ => None,
    };
    let archive = StagedFile::new(output, &converted.to_bytes()?)?;

    archive.commit()?;
    info!(output = %output.display(), tensors = converted.len(), "wrote archive");

    if let Some(staged) = engine {
        let target = staged.commit()?;
        info!(path = %target.display(), "wrote engine config");
        report.engine_config = Some(target);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackedBases;
    use safetensors::Dtype;

    fn weight(rows: usize, cols: usize, seed: f32) -> TensorEntry {
        let values: Vec<f32> = (0..rows * cols)
            .map(|i| ((i as f32) * 0.37 + seed).sin())
            .collect();
        TensorEntry::from_f32(vec![rows, cols], &values)
    }

    fn model() -> TensorArchive {
        let mut archive = TensorArchive::new();
        archive.insert("model.embed_tokens.weight", weight(16, 8, 0.1));
        archive.insert("model.layers.0.self_attn.q_proj.weight", weight(8, 8, 0.2));
        archive.insert("model.layers.0.mlp.up_proj.weight", weight(12, 8, 0.3));
        archive.insert("model.layers.0.input_layernorm.weight", weight(1, 8, 0.4));
        archive.insert("model.norm.weight", TensorEntry::from_f32(vec![8], &[1.0; 8]));
        archive.insert("lm_head.weight", weight(16, 8, 0.5));
        archive
            .metadata
            .insert("source".to_string(), "unit-test".to_string());
        archive
    }

    #[test]
    fn test_classification() {
        let config = ConvertConfig::default();
        let w = weight(8, 8, 0.0);
        let role = |name: &str| classify(name, &w, &config);

        assert_eq!(role("model.layers.0.self_attn.q_proj.weight"), TensorRole::Quantize);
        assert_eq!(role("model.layers.3.linear.weight"), TensorRole::Quantize);
        assert_eq!(role("model.embed_tokens.weight"), TensorRole::PassThrough);
        assert_eq!(role("lm_head.weight"), TensorRole::PassThrough);
        assert_eq!(role("model.embed_tokens.proj.weight"), TensorRole::PassThrough);
        assert_eq!(role("model.layers.0.self_attn.q_proj.bias"), TensorRole::PassThrough);
        assert_eq!(role("model.layers.0.post_attention_layernorm.weight"), TensorRole::PassThrough);

        let vector = TensorEntry::from_f32(vec![8], &[0.0; 8]);
        assert_eq!(classify("a.q_proj.weight", &vector, &config), TensorRole::PassThrough);
        let bytes = TensorEntry::from_u8(vec![2, 4], vec![0; 8]);
        assert_eq!(classify("a.q_proj.weight", &bytes, &config), TensorRole::PassThrough);
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(
            packed_name("model.layers.0.mlp.up_proj.weight").as_deref(),
            Some("model.layers.0.mlp.up_proj.weight_packed")
        );
        assert_eq!(
            scales_name("model.layers.0.mlp.up_proj.weight").as_deref(),
            Some("model.layers.0.mlp.up_proj.scales")
        );
        // only the suffix is stripped
        assert_eq!(
            scales_name("weight.proj.weight").as_deref(),
            Some("weight.proj.scales")
        );
        assert_eq!(packed_name("x.bias"), None);
    }

    #[test]
    fn test_convert_archive() {
        let input = model();
        let config = ConvertConfig::default().with_threads(Some(2));
        let (output, report) = convert_archive(&input, &config).unwrap();

        assert_eq!(report.quantized.len(), 2);
        assert_eq!(report.passed_through, 4);
        assert_eq!(report.narrowed, 0);

        let packed = output
            .require("model.layers.0.mlp.up_proj.weight_packed")
            .unwrap();
        assert_eq!(packed.dtype, Dtype::U8);
        assert_eq!(packed.shape, vec![12, 2, 3]);
        let scales = output.require("model.layers.0.mlp.up_proj.scales").unwrap();
        assert_eq!(scales.dtype, Dtype::F32);
        assert_eq!(scales.shape, vec![3]);
        assert!(output.get("model.layers.0.mlp.up_proj.weight").is_none());

        for name in [
            "model.embed_tokens.weight",
            "lm_head.weight",
            "model.norm.weight",
            "model.layers.0.input_layernorm.weight",
        ] {
            assert_eq!(output.get(name), input.get(name), "{name}");
        }

        assert_eq!(output.metadata["source"], "unit-test");
        assert_eq!(output.metadata[meta::FORMAT], FORMAT_NAME);
        assert_eq!(output.metadata[meta::LAYOUT], "ternary2_v1");
        assert_eq!(output.metadata[meta::MAX_BASES], "3");
        assert_eq!(output.metadata[meta::ROUNDING], "half_to_even");
    }

    #[test]
    fn test_packed_output_matches_direct_decomposition() {
        let input = model();
        let config = ConvertConfig::default()
            .with_threshold(0.0)
            .with_layout(PackLayout::Interleaved8);
        let (output, _) = convert_archive(&input, &config).unwrap();

        let name = "model.layers.0.self_attn.q_proj.weight";
        let source = input.get(name).unwrap();
        let matrix = WeightMatrix::new(8, 8, source.to_f32_vec(name).unwrap()).unwrap();
        let expected = Decomposer::from_config(&config).decompose(&matrix).unwrap();

        let packed = output
            .require("model.layers.0.self_attn.q_proj.weight_packed")
            .unwrap();
        let scales = output
            .require("model.layers.0.self_attn.q_proj.scales")
            .unwrap()
            .to_f32_vec("scales")
            .unwrap();
        let restored = PackedBases {
            layout: PackLayout::Interleaved8,
            shape: packed.shape.clone(),
            data: packed.data.clone(),
            scales,
        }
        .unpack()
        .unwrap();
        assert!(restored.equivalent(&expected));
    }

    #[test]
    fn test_indivisible_width_fails_whole_conversion() {
        let mut input = model();
        input.insert("model.layers.1.mlp.down_proj.weight", weight(4, 5, 0.0));
        let err = convert_archive(&input, &ConvertConfig::default()).unwrap_err();
        match err {
            CodecError::IndivisibleWidth { name, shape } => {
                assert_eq!(name, "model.layers.1.mlp.down_proj.weight");
                assert_eq!(shape, vec![4, 5]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_finite_is_rejected() {
        let mut input = TensorArchive::new();
        let mut values = vec![0.5f32; 16];
        values[3] = f32::NAN;
        input.insert("a.o_proj.weight", TensorEntry::from_f32(vec![4, 4], &values));
        let err = convert_archive(&input, &ConvertConfig::default()).unwrap_err();
        assert!(matches!(err, CodecError::NonFinite { index: 3, .. }));
    }

    #[test]
    fn test_plan_carries_decoded_matrices() {
        let mut input = model();
        let name = "model.layers.0.mlp.up_proj.weight";
        let narrowed = input
            .get(name)
            .unwrap()
            .narrowed(name, crate::config::StorageDtype::F16)
            .unwrap()
            .unwrap();
        let expected = narrowed.to_f32_vec(name).unwrap();
        input.insert(name, narrowed);

        let plan = plan(&input, &ConvertConfig::default()).unwrap();
        let names: Vec<&str> = plan.quantize.iter().map(|p| p.name).collect();
        assert_eq!(names, vec![name, "model.layers.0.self_attn.q_proj.weight"]);
        assert_eq!(plan.pass_through.len(), 4);

        let up = &plan.quantize[0].matrix;
        assert_eq!((up.rows(), up.cols()), (12, 8));
        assert_eq!(up.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_name_collision() {
        let mut input = TensorArchive::new();
        input.insert("a.o_proj.weight", weight(4, 4, 0.0));
        input.insert("a.o_proj.scales", TensorEntry::from_f32(vec![3], &[0.0; 3]));
        let err = convert_archive(&input, &ConvertConfig::default()).unwrap_err();
        assert!(matches!(err, CodecError::NameCollision { .. }));
    }

    #[test]
    fn test_narrowing_skips_scales() {
        let input = model();
        let config = ConvertConfig::default()
            .with_narrow(Some(crate::config::StorageDtype::F16));
        let (output, report) = convert_archive(&input, &config).unwrap();

        assert_eq!(report.narrowed, 4);
        assert_eq!(output.get("lm_head.weight").unwrap().dtype, Dtype::F16);
        assert_eq!(
            output.get("model.layers.0.self_attn.q_proj.scales").unwrap().dtype,
            Dtype::F32
        );
    }

    #[test]
    fn test_thread_count_does_not_change_output() {
        let input = model();
        let one = convert_archive(&input, &ConvertConfig::default().with_threads(Some(1)))
            .unwrap()
            .0;
        let four = convert_archive(&input, &ConvertConfig::default().with_threads(Some(4)))
            .unwrap()
            .0;
        assert_eq!(one.to_bytes().unwrap(), four.to_bytes().unwrap());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = convert_archive(&model(), &ConvertConfig::default().with_max_bases(0)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidConfig(_)));
    }
}
