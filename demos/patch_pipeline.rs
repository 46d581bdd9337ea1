//! Patch a Stable Diffusion U-Net for adapter conditioning and run one
//! denoising step with and without the adapter.
//!
//! Usage: cargo run --example patch_pipeline -- <unet-dir> <image> [adapter-type]
//!
//! `<unet-dir>` is a diffusers `unet/` directory (config.json + weights).

use candle_core::{DType, Device, Tensor};
use t2i_adapter_rs::{
    condition::load_condition_image,
    config::AdapterType,
    model::adapter::{Adapter, AdapterFeatures},
    pipeline::{StableDiffusionPipeline, UNetSource, patch_pipe},
};

fn main() -> t2i_adapter_rs::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (Some(unet_dir), Some(image_path)) = (args.next(), args.next()) else {
        eprintln!("usage: patch_pipeline <unet-dir> <image> [sketch|seg|keypose|depth]");
        std::process::exit(2);
    };
    let adapter_type: AdapterType = args.next().as_deref().unwrap_or("depth").parse()?;

    let device = Device::Cpu;
    let dtype = DType::F32;

    println!("Loading U-Net from {unet_dir}...");
    let source = UNetSource::from_dir(&unet_dir)?;
    let cross_attention_dim = source.config.cross_attention_dim;
    let mut pipe = StableDiffusionPipeline::load(source, &device, dtype)?;
    patch_pipe(&mut pipe)?;

    println!("Loading {adapter_type} adapter...");
    let adapter = Adapter::from_pretrained(adapter_type, &device, dtype)?;
    let image = load_condition_image(&image_path, adapter_type, &device)?;
    let features = AdapterFeatures::new(adapter.extract_features(&image)?);

    let (_, _, h, w) = image.dims4()?;
    let latents = Tensor::randn(0f32, 1., (1, 4, h / 8, w / 8), &device)?;
    // Stand-in for CLIP text embeddings.
    let text = Tensor::zeros((1, 77, cross_attention_dim), dtype, &device)?;

    let plain = pipe.predict_noise(&latents, 999.0, &text, None)?;
    let conditioned = pipe.predict_noise(&latents, 999.0, &text, Some(&features))?;
    let delta: f32 = (conditioned - plain)?.abs()?.mean_all()?.to_scalar()?;
    println!("mean |Δ noise| from adapter conditioning: {delta:.5}");
    Ok(())
}
