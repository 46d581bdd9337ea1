//! T2I-Adapter: conditioning image → multi-scale feature pyramid.
//!
//! ## Architecture (SD 1.4 checkpoints)
//!
//! ```text
//! [B, 3, 512, 512] ─→ PixelUnshuffle(8)                 [B, 192, 64, 64]
//!   ─→ conv_in(3x3)                                     [B, 320, 64, 64]
//!   ─→ 2× ResnetBlock(320)                      ──→ f0  [B, 320, 64, 64]
//!   ─→ ResnetBlock(320→640, down) + ResnetBlock ──→ f1  [B, 640, 32, 32]
//!   ─→ ResnetBlock(640→1280, down) + ResnetBlock ─→ f2  [B, 1280, 16, 16]
//!   ─→ ResnetBlock(1280, down) + ResnetBlock    ──→ f3  [B, 1280, 8, 8]
//! ```
//!
//! Each feature matches the resolution and width of the corresponding
//! Stable Diffusion U-Net down block, so it can be added straight into the
//! denoiser (see [`crate::model::unet`]).

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use super::pixel::pixel_unshuffle;
use super::resnet::{ResnetBlock, ResnetBlockConfig};
use crate::config::{AdapterConfig, AdapterType};
use crate::{Error, Result};

/// Conditioning adapter producing one feature map per U-Net level.
#[derive(Debug, Clone)]
pub struct Adapter {
    conv_in: Conv2d,
    /// Flat block list; block `j` of level `i` sits at `i * num_res_blocks + j`.
    body: Vec<ResnetBlock>,
    config: AdapterConfig,
}

impl Adapter {
    /// Build the adapter, pulling weights from `vb`.
    ///
    /// Weight names follow the reference checkpoints: `conv_in.*` and
    /// `body.{idx}.{in_conv,block1,block2,skep,down_opt.op}.*`.
    pub fn load(vb: VarBuilder, config: &AdapterConfig) -> Result<Self> {
        config.validate()?;
        let cfg3x3 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = candle_nn::conv2d(config.cin, config.channels[0], 3, cfg3x3, vb.pp("conv_in"))?;

        let vb_body = vb.pp("body");
        let mut body = Vec::with_capacity(config.num_levels() * config.num_res_blocks);
        for (i, &out_channels) in config.channels.iter().enumerate() {
            for j in 0..config.num_res_blocks {
                let entry = i != 0 && j == 0;
                let in_channels = if entry {
                    config.channels[i - 1]
                } else {
                    out_channels
                };
                let block_cfg = ResnetBlockConfig {
                    in_channels,
                    out_channels,
                    down: entry,
                    ksize: config.ksize,
                    skip: config.skip,
                    use_conv: config.use_conv,
                };
                let idx = i * config.num_res_blocks + j;
                body.push(ResnetBlock::load(vb_body.pp(idx.to_string()), block_cfg)?);
            }
        }

        Ok(Self {
            conv_in,
            body,
            config: config.clone(),
        })
    }

    /// Download (or reuse the cached) published checkpoint for `adapter_type`.
    pub fn from_pretrained(adapter_type: AdapterType, device: &Device, dtype: DType) -> Result<Self> {
        let path = crate::weights::fetch_pretrained(adapter_type)?;
        Self::from_file(&path, &adapter_type.config(), device, dtype)
    }

    /// Load from a local `.pth`/`.pt`/`.bin` or `.safetensors` checkpoint.
    pub fn from_file(
        path: &std::path::Path,
        config: &AdapterConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        tracing::info!(path = %path.display(), "loading adapter weights");
        let vb = crate::weights::var_builder(&[path.to_path_buf()], dtype, device)?;
        Self::load(vb, config).map_err(|e| match e {
            Error::Candle(e) => Error::WeightLoad(format!("{}: {e}", path.display())),
            other => other,
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Run the pyramid on a `[B, C, H, W]` conditioning image.
    ///
    /// `C * downscale_factor²` must equal `cin`, and `H`, `W` must be
    /// divisible by `downscale_factor`. Returns one `[B, channels[i], h_i, w_i]`
    /// map per level, each taken after that level's last block.
    pub fn extract_features(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let (_b, c, _h, _w) = x.dims4()?;
        let factor = self.config.downscale_factor;
        let unshuffled = c * factor * factor;
        if unshuffled != self.config.cin {
            return Err(Error::Shape(format!(
                "adapter expects cin = {} channels after {factor}x unshuffle, \
                 got {c} image channel(s) giving {unshuffled}",
                self.config.cin
            )));
        }

        let x = pixel_unshuffle(x, factor)?;
        let mut x = self.conv_in.forward(&x)?;

        let mut features = Vec::with_capacity(self.config.num_levels());
        for (level, blocks) in self.body.chunks(self.config.num_res_blocks).enumerate() {
            for block in blocks {
                x = block.forward(&x)?;
            }
            tracing::debug!(level, shape = ?x.dims(), "adapter feature");
            features.push(x.clone());
        }
        Ok(features)
    }

    /// Multi-view forward: a stack of `N` views per sample plus one
    /// perspective image per sample.
    ///
    /// - `cube`: `[B, N, C, H, W]`; views are folded into the batch, run
    ///   through the pyramid and unfolded to `[B, N, c_i, h_i, w_i]`.
    /// - `pers`: `[B, C, H', W']`, processed independently.
    pub fn forward(&self, cube: &Tensor, pers: &Tensor) -> Result<(Vec<Tensor>, Vec<Tensor>)> {
        let (b, n, c, h, w) = cube.dims5()?;
        let folded = cube.reshape((b * n, c, h, w))?;
        let cube_features = self
            .extract_features(&folded)?
            .into_iter()
            .map(|feature| {
                let (_bn, fc, fh, fw) = feature.dims4()?;
                Ok(feature.reshape((b, n, fc, fh, fw))?)
            })
            .collect::<Result<Vec<_>>>()?;

        let pers_features = self.extract_features(pers)?;
        Ok((cube_features, pers_features))
    }
}

/// Adapter output ready to be injected into a U-Net.
#[derive(Debug, Clone)]
pub struct AdapterFeatures {
    /// One map per level, shallow to deep.
    pub features: Vec<Tensor>,
    /// Conditioning strength applied at injection time.
    pub scale: f64,
}

impl AdapterFeatures {
    pub fn new(features: Vec<Tensor>) -> Self {
        Self {
            features,
            scale: 1.0,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn num_levels(&self) -> usize {
        self.features.len()
    }

    /// Feature of `level` with the conditioning scale applied.
    pub fn scaled(&self, level: usize) -> Result<Option<Tensor>> {
        match self.features.get(level) {
            None => Ok(None),
            Some(f) if self.scale == 1.0 => Ok(Some(f.clone())),
            Some(f) => Ok(Some((f * self.scale)?)),
        }
    }
}
