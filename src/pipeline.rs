//! Generation pipeline and U-Net patching.
//!
//! The pipeline owns the denoising U-Net of a Stable Diffusion checkpoint.
//! Text encoding, scheduling and VAE decoding are left to the caller; this
//! module only manages the U-Net component and its swap to the
//! adapter-aware variant:
//!
//! 1. [`StableDiffusionPipeline::load`] builds the plain U-Net from a
//!    [`UNetSource`] (config + weight files).
//! 2. [`patch_pipe`] rebuilds the U-Net as an [`AdapterUNet`] from the same
//!    source, on the same device and dtype, and replaces it in place.
//! 3. [`StableDiffusionPipeline::predict_noise`] runs one denoising step,
//!    optionally conditioned on [`AdapterFeatures`].

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig,
};
use serde::Deserialize;

use crate::model::adapter::AdapterFeatures;
use crate::model::unet::AdapterUNet;
use crate::{Error, Result};

/// Weight file names looked up by [`UNetSource::from_dir`], in order.
const UNET_WEIGHT_FILES: [&str; 2] = [
    "diffusion_pytorch_model.safetensors",
    "diffusion_pytorch_model.bin",
];

/// Everything needed to (re)build a U-Net: architecture and weights.
#[derive(Debug, Clone)]
pub struct UNetSource {
    pub config: UNet2DConditionModelConfig,
    pub weights: Vec<PathBuf>,
    pub in_channels: usize,
    pub out_channels: usize,
    pub use_flash_attn: bool,
}

impl UNetSource {
    /// SD 1.x layout with the given weight files.
    pub fn sd1x(weights: Vec<PathBuf>) -> Self {
        Self {
            config: UNet2DConditionModelConfig {
                cross_attention_dim: 768,
                ..Default::default()
            },
            weights,
            in_channels: 4,
            out_channels: 4,
            use_flash_attn: false,
        }
    }

    /// Read a diffusers `unet/` directory: `config.json` plus
    /// `diffusion_pytorch_model.{safetensors,bin}`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let weights = UNET_WEIGHT_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
            .ok_or_else(|| {
                Error::WeightLoad(format!("no U-Net weights found in {}", dir.display()))
            })?;

        let config_path = dir.join("config.json");
        let config = if config_path.exists() {
            let json = std::fs::read_to_string(&config_path)?;
            serde_json::from_str::<DiffusersUNetConfig>(&json)?
        } else {
            tracing::warn!(dir = %dir.display(), "no U-Net config.json, assuming SD 1.x");
            DiffusersUNetConfig::default()
        };

        Ok(Self {
            in_channels: config.in_channels,
            out_channels: config.out_channels,
            config: config.into_candle()?,
            weights: vec![weights],
            use_flash_attn: false,
        })
    }

    fn build_plain(&self, device: &Device, dtype: DType) -> Result<UNet2DConditionModel> {
        let vb = crate::weights::var_builder(&self.weights, dtype, device)?;
        Ok(UNet2DConditionModel::new(
            vb,
            self.in_channels,
            self.out_channels,
            self.use_flash_attn,
            self.config.clone(),
        )?)
    }

    fn build_adapter(&self, device: &Device, dtype: DType) -> Result<AdapterUNet> {
        let vb = crate::weights::var_builder(&self.weights, dtype, device)?;
        AdapterUNet::new(
            vb,
            self.in_channels,
            self.out_channels,
            self.use_flash_attn,
            self.config.clone(),
        )
    }
}

/// `unet/config.json` as written by diffusers. Only the fields that shape
/// the candle U-Net are read.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DiffusersUNetConfig {
    in_channels: usize,
    out_channels: usize,
    block_out_channels: Vec<usize>,
    down_block_types: Vec<String>,
    layers_per_block: usize,
    cross_attention_dim: usize,
    attention_head_dim: HeadDim,
    transformer_layers_per_block: usize,
    use_linear_projection: bool,
    norm_num_groups: usize,
    norm_eps: f64,
    downsample_padding: usize,
    flip_sin_to_cos: bool,
    freq_shift: f64,
    center_input_sample: bool,
    mid_block_scale_factor: f64,
}

/// `attention_head_dim` is a scalar in SD 1.x configs and per-block in SD 2.x.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum HeadDim {
    Shared(usize),
    PerBlock(Vec<usize>),
}

impl Default for DiffusersUNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            block_out_channels: vec![320, 640, 1280, 1280],
            down_block_types: Vec::new(),
            layers_per_block: 2,
            cross_attention_dim: 768,
            attention_head_dim: HeadDim::Shared(8),
            transformer_layers_per_block: 1,
            use_linear_projection: false,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            downsample_padding: 1,
            flip_sin_to_cos: true,
            freq_shift: 0.0,
            center_input_sample: false,
            mid_block_scale_factor: 1.0,
        }
    }
}

impl DiffusersUNetConfig {
    fn into_candle(self) -> Result<UNet2DConditionModelConfig> {
        let n_blocks = self.block_out_channels.len();
        if n_blocks == 0 {
            return Err(Error::Config("block_out_channels must not be empty".into()));
        }
        if let HeadDim::PerBlock(dims) = &self.attention_head_dim
            && dims.len() != n_blocks
        {
            return Err(Error::Config(format!(
                "attention_head_dim has {} entries for {n_blocks} blocks",
                dims.len()
            )));
        }
        if !self.down_block_types.is_empty() && self.down_block_types.len() != n_blocks {
            return Err(Error::Config(format!(
                "down_block_types has {} entries for {n_blocks} blocks",
                self.down_block_types.len()
            )));
        }

        let blocks = self
            .block_out_channels
            .iter()
            .enumerate()
            .map(|(i, &out_channels)| {
                let cross_attn = match self.down_block_types.get(i) {
                    Some(kind) => kind.starts_with("CrossAttn"),
                    None => i < n_blocks - 1,
                };
                let attention_head_dim = match &self.attention_head_dim {
                    HeadDim::Shared(d) => *d,
                    HeadDim::PerBlock(dims) => dims[i],
                };
                BlockConfig {
                    out_channels,
                    use_cross_attn: cross_attn.then_some(self.transformer_layers_per_block),
                    attention_head_dim,
                }
            })
            .collect();

        Ok(UNet2DConditionModelConfig {
            center_input_sample: self.center_input_sample,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            blocks,
            layers_per_block: self.layers_per_block,
            downsample_padding: self.downsample_padding,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_num_groups: self.norm_num_groups,
            norm_eps: self.norm_eps,
            cross_attention_dim: self.cross_attention_dim,
            sliced_attention_size: None,
            use_linear_projection: self.use_linear_projection,
        })
    }
}

/// The pipeline's denoiser: the stock U-Net or its adapter-aware variant.
#[derive(Debug)]
pub enum UNetComponent {
    Plain(UNet2DConditionModel),
    Adapter(AdapterUNet),
}

/// A Stable Diffusion pipeline reduced to its patchable U-Net component.
#[derive(Debug)]
pub struct StableDiffusionPipeline {
    unet: UNetComponent,
    source: UNetSource,
    device: Device,
    dtype: DType,
}

impl StableDiffusionPipeline {
    /// Build the plain U-Net from `source` on `device`.
    pub fn load(source: UNetSource, device: &Device, dtype: DType) -> Result<Self> {
        tracing::info!(
            weights = ?source.weights,
            blocks = source.config.blocks.len(),
            ?dtype,
            "loading U-Net"
        );
        let unet = source.build_plain(device, dtype)?;
        Ok(Self {
            unet: UNetComponent::Plain(unet),
            source,
            device: device.clone(),
            dtype,
        })
    }

    pub fn unet(&self) -> &UNetComponent {
        &self.unet
    }

    pub fn source(&self) -> &UNetSource {
        &self.source
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_patched(&self) -> bool {
        matches!(self.unet, UNetComponent::Adapter(_))
    }

    /// One U-Net evaluation.
    ///
    /// `adapter` features require a patched pipeline; see [`patch_pipe`].
    pub fn predict_noise(
        &self,
        latents: &Tensor,
        timestep: f64,
        text_embeddings: &Tensor,
        adapter: Option<&AdapterFeatures>,
    ) -> Result<Tensor> {
        match (&self.unet, adapter) {
            (UNetComponent::Plain(unet), None) => {
                Ok(unet.forward(latents, timestep, text_embeddings)?)
            }
            (UNetComponent::Plain(_), Some(_)) => Err(Error::Config(
                "adapter features need an adapter-aware U-Net, call patch_pipe first".into(),
            )),
            (UNetComponent::Adapter(unet), adapter) => {
                unet.forward(latents, timestep, text_embeddings, adapter)
            }
        }
    }
}

/// Replace the pipeline's U-Net with the adapter-aware variant.
///
/// The new U-Net is built from the pipeline's own config and weights on the
/// pipeline's device and dtype. Patching twice is a no-op.
pub fn patch_pipe(pipe: &mut StableDiffusionPipeline) -> Result<()> {
    if pipe.is_patched() {
        tracing::debug!("pipeline U-Net already adapter-aware");
        return Ok(());
    }
    let unet = pipe.source.build_adapter(&pipe.device, pipe.dtype)?;
    pipe.unet = UNetComponent::Adapter(unet);
    tracing::info!(device = ?pipe.device, dtype = ?pipe.dtype, "patched pipeline U-Net for adapter conditioning");
    Ok(())
}
