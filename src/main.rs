use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use ternpak::convert::packed_name;
use ternpak::utils::ErrorStats;
use ternpak::verify::{packed_weights, unpack_weight};
use ternpak::{
    convert_file, verify_files, ArchiveFormat, ConvertConfig, Decomposer, PackLayout,
    RoundingMode, StorageDtype, TensorArchive, TernaryQuantizer, WeightMatrix,
};

/// ternpak CLI: pack model weights into multi-basis ternary form.
#[derive(Parser, Debug)]
#[command(author, version, about = "Adaptive multi-basis ternary weight packer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert a safetensors model (file or shard directory) into a packed archive.
    Convert {
        /// Input .safetensors file or directory of shards
        #[arg(short, long)]
        input: PathBuf,
        /// Output .safetensors file
        #[arg(short, long)]
        output: PathBuf,
        /// JSON settings file; flags below override its values
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Basis slots per matrix
        #[arg(long)]
        max_bases: Option<usize>,
        /// Relative RMSE early-stop threshold
        #[arg(long)]
        threshold: Option<f32>,
        /// Packed layout (ternary2_v1 | ternary8_interleaved_v1)
        #[arg(long)]
        layout: Option<PackLayout>,
        /// Rounding rule (half_to_even | half_away_from_zero)
        #[arg(long)]
        rounding: Option<RoundingMode>,
        /// Narrow pass-through float tensors (f16 | bf16)
        #[arg(long)]
        narrow: Option<StorageDtype>,
        /// Worker threads
        #[arg(long)]
        threads: Option<usize>,
        /// Source config.json (default: looked up next to the input)
        #[arg(long)]
        model_config: Option<PathBuf>,
        /// Write the conversion report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print archive metadata and tensors.
    Inspect {
        /// Archive file or shard directory
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Reconstruct packed tensors and compare them with the source model.
    Verify {
        /// Source .safetensors file or directory
        #[arg(long)]
        source: PathBuf,
        /// Converted archive
        #[arg(long)]
        converted: PathBuf,
        /// Write the verification report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Decompose a seeded random matrix and print error per basis count.
    Bench {
        /// Matrix size (dim x dim), must be divisible by 4
        #[arg(long, default_value_t = 256)]
        dim: usize,
        /// Largest basis count to evaluate
        #[arg(long, default_value_t = 4)]
        max_bases: usize,
        /// RNG seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            input,
            output,
            settings,
            max_bases,
            threshold,
            layout,
            rounding,
            narrow,
            threads,
            model_config,
            report,
        } => {
            let mut config = match &settings {
                Some(path) => ConvertConfig::from_json_file(path)
                    .with_context(|| format!("Failed to load settings: {}", path.display()))?,
                None => ConvertConfig::default(),
            };
            if let Some(v) = max_bases {
                config.max_bases = v;
            }
            if let Some(v) = threshold {
                config.threshold = v;
            }
            if let Some(v) = layout {
                config.layout = v;
            }
            if let Some(v) = rounding {
                config.rounding = v;
            }
            if narrow.is_some() {
                config.narrow = narrow;
            }
            if threads.is_some() {
                config.threads = threads;
            }
            convert_cmd(&input, &output, &config, model_config.as_deref(), report.as_deref())?
        }
        Commands::Inspect { input } => inspect_cmd(&input)?,
        Commands::Verify {
            source,
            converted,
            report,
        } => verify_cmd(&source, &converted, report.as_deref())?,
        Commands::Bench {
            dim,
            max_bases,
            seed,
        } => bench_cmd(dim, max_bases, seed)?,
    }

    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
    fs::write(path, json).with_context(|| format!("Failed to write report: {}", path.display()))
}

fn convert_cmd(
    input: &Path,
    output: &Path,
    config: &ConvertConfig,
    model_config: Option<&Path>,
    report_path: Option<&Path>,
) -> Result<()> {
    let report = convert_file(input, output, config, model_config).with_context(|| {
        format!(
            "Failed to convert {} into {}",
            input.display(),
            output.display()
        )
    })?;

    let input_bytes = fs::metadata(input)
        .ok()
        .filter(|m| m.is_file())
        .map_or(0, |m| m.len());
    let output_bytes = fs::metadata(output).map(|m| m.len()).unwrap_or(0);

    println!("Converted {} -> {}", input.display(), output.display());
    println!("  Layout:        {}", report.layout);
    println!("  Quantized:     {}", report.quantized.len());
    println!("  Pass-through:  {} ({} narrowed)", report.passed_through, report.narrowed);
    println!("  Mean rel err:  {:.6}", report.mean_rel_error());
    println!("  Elapsed:       {} ms", report.elapsed_ms);
    if input_bytes > 0 && output_bytes > 0 {
        let ratio = input_bytes as f64 / output_bytes as f64;
        println!("  Size:          {} -> {} bytes ({:.2}x)", input_bytes, output_bytes, ratio);
    }
    if let Some(path) = &report.engine_config {
        println!("  Engine config: {}", path.display());
    }

    if let Some(path) = report_path {
        write_json(path, &report)?;
    }
    Ok(())
}

fn inspect_cmd(input: &Path) -> Result<()> {
    let archive = TensorArchive::open(input)
        .with_context(|| format!("Failed to read archive: {}", input.display()))?;

    println!("Archive: {}", input.display());
    println!("  Tensors: {}", archive.len());
    if !archive.metadata.is_empty() {
        println!("  Metadata:");
        for (key, value) in &archive.metadata {
            println!("    {key} = {value}");
        }
    }

    for (name, entry) in &archive.tensors {
        println!("    - {}: {:?} {:?}", name, entry.dtype, entry.shape);
    }

    let packed = packed_weights(&archive);
    if packed.is_empty() {
        return Ok(());
    }
    let format = ArchiveFormat::from_metadata(&archive.metadata)
        .context("Archive holds packed tensors but no usable format metadata")?;

    println!("Packed weights ({}):", format.layout);
    println!("  {:<48} {:>12} {:>8}  scales", "weight", "shape", "active");
    for name in &packed {
        let set = unpack_weight(&archive, &format, name)
            .with_context(|| format!("Failed to unpack {}", packed_name(name).unwrap_or_default()))?;
        println!(
            "  {:<48} {:>12} {:>8}  {:?}",
            name,
            format!("{}x{}", set.rows(), set.cols()),
            set.active(),
            set.scales()
        );
    }

    Ok(())
}

fn verify_cmd(source: &Path, converted: &Path, report_path: Option<&Path>) -> Result<()> {
    let report = verify_files(source, converted).with_context(|| {
        format!(
            "Failed to verify {} against {}",
            converted.display(),
            source.display()
        )
    })?;

    println!("Verified {} ({})", converted.display(), report.layout);
    println!(
        "  {:<48} {:>12} {:>12} {:>12} {:>10}",
        "tensor", "MSE", "MAE", "MAX", "rel RMSE"
    );
    for t in &report.tensors {
        println!(
            "  {:<48} {:>12.6} {:>12.6} {:>12.6} {:>10.4}",
            t.name, t.stats.mse, t.stats.mae, t.stats.max, t.stats.relative_rmse
        );
    }
    println!(
        "  {:<48} {:>12.6} {:>12.6} {:>12.6} {:>10.4}",
        "total", report.total.mse, report.total.mae, report.total.max, report.total.relative_rmse
    );
    println!("  Pass-through tensors present: {}", report.pass_through);

    if let Some(path) = report_path {
        write_json(path, &report)?;
    }
    Ok(())
}

fn bench_cmd(dim: usize, max_bases: usize, seed: u64) -> Result<()> {
    let config = ConvertConfig::default()
        .with_max_bases(max_bases)
        .with_threshold(0.0);
    config.validate().context("Invalid bench parameters")?;
    if dim == 0 || dim % 4 != 0 {
        anyhow::bail!("--dim must be a positive multiple of 4, got {dim}");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..dim * dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let w = WeightMatrix::new(dim, dim, data)?;

    let decomposer = Decomposer::new(
        max_bases,
        0.0,
        TernaryQuantizer::new(config.rounding, config.parallel_threshold),
    );
    let set = decomposer.decompose(&w)?;

    let fp16_bytes = dim * dim * 2;
    println!("Ternary decomposition of a {dim}x{dim} random matrix (seed {seed}):");
    println!(
        "  {:<6} {:>12} {:>12} {:>12} {:>12} {:>8}",
        "bases", "RMSE", "rel RMSE", "MAX", "bytes", "vs FP16"
    );
    for k in 1..=max_bases {
        let stats = ErrorStats::between(w.as_slice(), &set.reconstruct_prefix(k));
        let bytes = PackLayout::Dense2.packed_len(dim, dim, k) + k * 4;
        println!(
            "  {:<6} {:>12.6} {:>12.6} {:>12.6} {:>12} {:>7.2}x",
            k,
            stats.mse.sqrt(),
            stats.relative_rmse,
            stats.max,
            bytes,
            fp16_bytes as f64 / bytes as f64
        );
    }

    Ok(())
}
