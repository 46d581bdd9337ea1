//! T2I-Adapter CLI: extract conditioning features from an image.
//!
//! Downloads the published SD 1.4 adapter checkpoint from HuggingFace on
//! first run (~300 MB), unless `--weights` points at a local file.
//!
//! # Output
//!
//! Writes the feature pyramid to a safetensors file (`feature.0` …
//! `feature.3`) and prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/feats.safetensors","adapter":"depth","features":[[1,320,64,64],...]}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use t2i_adapter_rs::{
    condition::load_condition_image,
    config::{AdapterConfig, AdapterType},
    model::adapter::Adapter,
};

#[derive(Parser, Debug)]
#[command(
    name = "t2i-adapter",
    about = "T2I-Adapter conditioning feature extraction",
    long_about = "Run a T2I-Adapter on a conditioning image (sketch, segmentation, keypose \
                  or depth map) and save the multi-scale feature pyramid.\n\
                  Downloads the adapter checkpoint from HuggingFace on first run.\n\
                  A JSON summary line is printed to stdout."
)]
struct Args {
    /// Adapter type: sketch, seg, keypose or depth.
    #[arg(long = "type", short = 't')]
    adapter_type: AdapterType,

    /// Conditioning image. Resized to multiples of 64.
    #[arg(long, short = 'i')]
    image: PathBuf,

    /// Output safetensors file for the feature pyramid.
    #[arg(long, short = 'o')]
    output: PathBuf,

    /// Local checkpoint (.pth or .safetensors) instead of the HuggingFace download.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Adapter config JSON for custom checkpoints. Defaults to the
    /// published config of --type.
    #[arg(long, requires = "weights")]
    config: Option<PathBuf>,

    /// Multiply every feature by this conditioning scale before saving.
    #[arg(long, default_value_t = 1.0)]
    scale: f64,

    /// Run on CPU even if a GPU is available.
    #[arg(long)]
    cpu: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if !(0.0..=10.0).contains(&args.scale) {
        anyhow::bail!("scale must be between 0 and 10, got {}", args.scale);
    }

    // Ensure output directory exists
    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let device = if args.cpu {
        candle_core::Device::Cpu
    } else {
        candle_core::Device::cuda_if_available(0)?
    };
    let dtype = candle_core::DType::F32;
    tracing::info!("Using device: {:?}", device);

    let adapter = match &args.weights {
        Some(path) => {
            let config = match &args.config {
                Some(config_path) => AdapterConfig::from_json_file(config_path)?,
                None => args.adapter_type.config(),
            };
            Adapter::from_file(path, &config, &device, dtype)
        }
        None => Adapter::from_pretrained(args.adapter_type, &device, dtype),
    }
    .map_err(|e| anyhow::anyhow!("failed to load adapter: {e}"))?;

    let image = load_condition_image(&args.image, args.adapter_type, &device)
        .map_err(|e| anyhow::anyhow!("failed to load image: {e}"))?;
    tracing::info!("Conditioning image: {:?}", image.dims());

    let features = adapter
        .extract_features(&image)
        .map_err(|e| anyhow::anyhow!("feature extraction failed: {e}"))?;

    let mut tensors = HashMap::new();
    let mut shapes = Vec::with_capacity(features.len());
    for (level, feature) in features.into_iter().enumerate() {
        let feature = (feature * args.scale)?;
        shapes.push(feature.dims().to_vec());
        tensors.insert(format!("feature.{level}"), feature);
    }
    candle_core::safetensors::save(&tensors, &args.output)
        .map_err(|e| anyhow::anyhow!("failed to write features: {e}"))?;

    // Print machine-readable summary to stdout for the caller
    let summary = serde_json::json!({
        "path": args.output,
        "adapter": args.adapter_type.as_str(),
        "features": shapes,
    });
    println!("{summary}");

    Ok(())
}
