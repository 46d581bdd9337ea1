//! Adapter-aware Stable Diffusion U-Net.
//!
//! [`AdapterUNet`] is built from the same config and checkpoint as candle's
//! `UNet2DConditionModel` and reads the same weight names; the adapter adds
//! no U-Net weights of its own, so unused checkpoint entries are simply never
//! requested. The mid and up paths reuse candle's public blocks. The down
//! path is rebuilt here so features can enter it:
//!
//! ```text
//! down block i:  resnet(+attn) × layers_per_block
//!                  last layer: h = h + feature_i      ──→ skip, next input
//!                downsampler (all but the last block)  ──→ skip
//! ```
//!
//! A feature therefore reaches the skip connection, the downsampler, every
//! deeper down block and the mid block.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use candle_transformers::models::stable_diffusion::attention::{
    SpatialTransformer, SpatialTransformerConfig,
};
use candle_transformers::models::stable_diffusion::embeddings::{TimestepEmbedding, Timesteps};
use candle_transformers::models::stable_diffusion::resnet::{ResnetBlock2D, ResnetBlock2DConfig};
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModelConfig;
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    CrossAttnUpBlock2D, CrossAttnUpBlock2DConfig, UNetMidBlock2DCrossAttn,
    UNetMidBlock2DCrossAttnConfig, UpBlock2D, UpBlock2DConfig,
};

use super::adapter::AdapterFeatures;
use crate::{Error, Result};

/// Spatial size after a down block's 3x3 stride-2 downsampler.
///
/// `padding == 0` pads one row/column at the end only.
fn downsampled(size: usize, padding: usize) -> usize {
    let padded = if padding == 0 {
        size + 1
    } else {
        size + 2 * padding
    };
    padded.saturating_sub(3) / 2 + 1
}

/// Shape each adapter level must have for latents of `[batch, _, height, width]`.
pub fn feature_shapes(
    config: &UNet2DConditionModelConfig,
    batch: usize,
    height: usize,
    width: usize,
) -> Vec<(usize, usize, usize, usize)> {
    let (mut h, mut w) = (height, width);
    config
        .blocks
        .iter()
        .enumerate()
        .map(|(i, block)| {
            if i > 0 {
                h = downsampled(h, config.downsample_padding);
                w = downsampled(w, config.downsample_padding);
            }
            (batch, block.out_channels, h, w)
        })
        .collect()
}

#[derive(Debug)]
struct Downsampler {
    conv: Conv2d,
    padding: usize,
}

impl Downsampler {
    fn load(vb: VarBuilder, channels: usize, padding: usize) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: 2,
            padding,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(channels, channels, 3, cfg, vb.pp("conv"))?;
        Ok(Self { conv, padding })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        if self.padding == 0 {
            let xs = xs
                .pad_with_zeros(D::Minus1, 0, 1)?
                .pad_with_zeros(D::Minus2, 0, 1)?;
            Ok(self.conv.forward(&xs)?)
        } else {
            Ok(self.conv.forward(xs)?)
        }
    }
}

/// One down block; `attentions` is empty for blocks without cross-attention.
#[derive(Debug)]
struct DownBlock {
    resnets: Vec<ResnetBlock2D>,
    attentions: Vec<SpatialTransformer>,
    downsampler: Option<Downsampler>,
}

impl DownBlock {
    /// Returns the block output and its skip activations.
    fn forward(
        &self,
        xs: &Tensor,
        temb: &Tensor,
        encoder_hidden_states: &Tensor,
        feature: Option<&Tensor>,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut xs = xs.clone();
        let mut states = Vec::with_capacity(self.resnets.len() + 1);
        let last = self.resnets.len() - 1;
        for (k, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, Some(temb))?;
            if let Some(attn) = self.attentions.get(k) {
                xs = attn.forward(&xs, Some(encoder_hidden_states))?;
            }
            if k == last
                && let Some(feature) = feature
            {
                xs = (xs + feature)?;
            }
            states.push(xs.clone());
        }
        if let Some(downsampler) = &self.downsampler {
            xs = downsampler.forward(&xs)?;
            states.push(xs.clone());
        }
        Ok((xs, states))
    }
}

#[derive(Debug)]
enum UpBlock {
    Basic(UpBlock2D),
    CrossAttn(CrossAttnUpBlock2D),
}

/// U-Net variant that accepts adapter features.
#[derive(Debug)]
pub struct AdapterUNet {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    up_blocks: Vec<UpBlock>,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
    config: UNet2DConditionModelConfig,
}

impl AdapterUNet {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        use_flash_attn: bool,
        config: UNet2DConditionModelConfig,
    ) -> Result<Self> {
        let (Some(first), Some(last)) = (config.blocks.first(), config.blocks.last()) else {
            return Err(Error::Config("U-Net needs at least one down block".into()));
        };
        if config.layers_per_block == 0 {
            return Err(Error::Config(
                "U-Net down blocks need at least one layer".into(),
            ));
        }
        let n_blocks = config.blocks.len();
        let b_channels = first.out_channels;
        let bl_channels = last.out_channels;
        let time_embed_dim = b_channels * 4;
        let cfg3x3 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_in = candle_nn::conv2d(in_channels, b_channels, 3, cfg3x3, vb.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vb.pp("time_embedding"), b_channels, time_embed_dim)?;

        // attention slicing: Some(0) means half the head count
        let sliced = |attention_head_dim: usize| match config.sliced_attention_size {
            Some(0) => Some(attention_head_dim / 2),
            other => other,
        };

        let vb_down = vb.pp("down_blocks");
        let mut down_blocks = Vec::with_capacity(n_blocks);
        for (i, block) in config.blocks.iter().enumerate() {
            let vb_block = vb_down.pp(i.to_string());
            let block_in = if i > 0 {
                config.blocks[i - 1].out_channels
            } else {
                b_channels
            };
            let resnet_cfg = ResnetBlock2DConfig {
                out_channels: Some(block.out_channels),
                eps: config.norm_eps,
                temb_channels: Some(time_embed_dim),
                ..Default::default()
            };
            let vb_resnets = vb_block.pp("resnets");
            let resnets = (0..config.layers_per_block)
                .map(|k| {
                    let in_c = if k == 0 { block_in } else { block.out_channels };
                    ResnetBlock2D::new(vb_resnets.pp(k.to_string()), in_c, resnet_cfg)
                })
                .collect::<candle_core::Result<Vec<_>>>()?;

            let attentions = match block.use_cross_attn {
                Some(depth) => {
                    let n_heads = block.attention_head_dim;
                    let attn_cfg = SpatialTransformerConfig {
                        depth,
                        context_dim: Some(config.cross_attention_dim),
                        num_groups: config.norm_num_groups,
                        sliced_attention_size: sliced(block.attention_head_dim),
                        use_linear_projection: config.use_linear_projection,
                    };
                    let vb_attn = vb_block.pp("attentions");
                    (0..config.layers_per_block)
                        .map(|k| {
                            SpatialTransformer::new(
                                vb_attn.pp(k.to_string()),
                                block.out_channels,
                                n_heads,
                                block.out_channels / n_heads,
                                use_flash_attn,
                                attn_cfg,
                            )
                        })
                        .collect::<candle_core::Result<Vec<_>>>()?
                }
                None => Vec::new(),
            };

            let downsampler = if i < n_blocks - 1 {
                Some(Downsampler::load(
                    vb_block.pp("downsamplers").pp("0"),
                    block.out_channels,
                    config.downsample_padding,
                )?)
            } else {
                None
            };
            down_blocks.push(DownBlock {
                resnets,
                attentions,
                downsampler,
            });
        }

        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: config.mid_block_scale_factor,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: last.attention_head_dim,
            resnet_groups: Some(config.norm_num_groups),
            use_linear_projection: config.use_linear_projection,
            transformer_layers_per_block: last.use_cross_attn.unwrap_or(1),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vb.pp("mid_block"),
            bl_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;

        let vb_up = vb.pp("up_blocks");
        let mut up_blocks = Vec::with_capacity(n_blocks);
        for i in 0..n_blocks {
            let block = config.blocks[n_blocks - 1 - i];
            let prev_out_channels = if i > 0 {
                config.blocks[n_blocks - i].out_channels
            } else {
                bl_channels
            };
            let skip_channels = if i == n_blocks - 1 {
                config.blocks[0].out_channels
            } else {
                config.blocks[n_blocks - i - 2].out_channels
            };
            let ub_cfg = UpBlock2DConfig {
                num_layers: config.layers_per_block + 1,
                resnet_eps: config.norm_eps,
                resnet_groups: config.norm_num_groups,
                add_upsample: i < n_blocks - 1,
                ..Default::default()
            };
            let up = match block.use_cross_attn {
                Some(transformer_layers_per_block) => {
                    let xa_cfg = CrossAttnUpBlock2DConfig {
                        upblock: ub_cfg,
                        attn_num_head_channels: block.attention_head_dim,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size: sliced(block.attention_head_dim),
                        use_linear_projection: config.use_linear_projection,
                        transformer_layers_per_block,
                    };
                    UpBlock::CrossAttn(CrossAttnUpBlock2D::new(
                        vb_up.pp(i.to_string()),
                        skip_channels,
                        prev_out_channels,
                        block.out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        xa_cfg,
                    )?)
                }
                None => UpBlock::Basic(UpBlock2D::new(
                    vb_up.pp(i.to_string()),
                    skip_channels,
                    prev_out_channels,
                    block.out_channels,
                    Some(time_embed_dim),
                    ub_cfg,
                )?),
            };
            up_blocks.push(up);
        }

        let conv_norm_out = candle_nn::group_norm(
            config.norm_num_groups,
            b_channels,
            config.norm_eps,
            vb.pp("conv_norm_out"),
        )?;
        let conv_out = candle_nn::conv2d(b_channels, out_channels, 3, cfg3x3, vb.pp("conv_out"))?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            config,
        })
    }

    pub fn config(&self) -> &UNet2DConditionModelConfig {
        &self.config
    }

    /// Predict noise. Without `adapter` this matches the plain U-Net.
    pub fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        adapter: Option<&AdapterFeatures>,
    ) -> Result<Tensor> {
        let (bsize, _c, height, width) = latents.dims4()?;
        let n_blocks = self.config.blocks.len();
        let up_factor = 1usize << (n_blocks - 1);
        let forward_upsample_size = height % up_factor != 0 || width % up_factor != 0;

        let features = match adapter {
            Some(features) => self.prepare_features(latents, features)?,
            None => Vec::new(),
        };

        let xs = if self.config.center_input_sample {
            ((latents * 2.0)? - 1.0)?
        } else {
            latents.clone()
        };
        let emb = (Tensor::ones(bsize, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let xs = self.conv_in.forward(&xs)?;
        let (xs, mut skips) = self.down(&xs, &emb, encoder_hidden_states, &features)?;

        let mut xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        let n_resnets = self.config.layers_per_block + 1;
        let mut upsample_size = None;
        for (i, up_block) in self.up_blocks.iter().enumerate() {
            let res_xs = skips.split_off(skips.len().saturating_sub(n_resnets));
            if i < n_blocks - 1
                && forward_upsample_size
                && let Some(last) = skips.last()
            {
                let (_, _, h, w) = last.dims4()?;
                upsample_size = Some((h, w));
            }
            xs = match up_block {
                UpBlock::Basic(b) => b.forward(&xs, &res_xs, Some(&emb), upsample_size)?,
                UpBlock::CrossAttn(b) => b.forward(
                    &xs,
                    &res_xs,
                    Some(&emb),
                    upsample_size,
                    Some(encoder_hidden_states),
                )?,
            };
        }

        let xs = self.conv_norm_out.forward(&xs)?;
        let xs = candle_nn::ops::silu(&xs)?;
        Ok(self.conv_out.forward(&xs)?)
    }

    /// Down path from the `conv_in` output. `features` is empty or holds one
    /// map per down block. Returns the mid-block input and every skip
    /// activation, `conv_in` first.
    fn down(
        &self,
        xs: &Tensor,
        emb: &Tensor,
        encoder_hidden_states: &Tensor,
        features: &[Tensor],
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut skips = vec![xs.clone()];
        let mut xs = xs.clone();
        for (i, block) in self.down_blocks.iter().enumerate() {
            let (out, states) = block.forward(&xs, emb, encoder_hidden_states, features.get(i))?;
            skips.extend(states);
            xs = out;
        }
        Ok((xs, skips))
    }

    /// Scale the adapter features and check them against the down path for
    /// `latents`. Levels of batch one are broadcast over the latent batch.
    fn prepare_features(&self, latents: &Tensor, features: &AdapterFeatures) -> Result<Vec<Tensor>> {
        let (b, _c, h, w) = latents.dims4()?;
        let shapes = feature_shapes(&self.config, b, h, w);
        if features.num_levels() != shapes.len() {
            return Err(Error::Shape(format!(
                "adapter produced {} feature levels, U-Net has {} down blocks",
                features.num_levels(),
                shapes.len()
            )));
        }
        shapes
            .into_iter()
            .enumerate()
            .map(|(level, shape)| {
                let feature = features.scaled(level)?.ok_or_else(|| {
                    Error::Shape(format!("adapter level {level} is missing"))
                })?;
                fit_feature(&feature, shape, level, latents.dtype(), latents.device())
            })
            .collect()
    }
}

/// Check `feature` against its down block and broadcast a batch of one over
/// the latent batch (e.g. conditional + unconditional halves).
fn fit_feature(
    feature: &Tensor,
    (b, c, h, w): (usize, usize, usize, usize),
    level: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let (fb, fc, fh, fw) = feature.dims4()?;
    if (fc, fh, fw) != (c, h, w) {
        return Err(Error::Shape(format!(
            "adapter level {level} is [{fb}, {fc}, {fh}, {fw}], U-Net expects [{b}, {c}, {h}, {w}]"
        )));
    }
    let feature = feature.to_device(device)?.to_dtype(dtype)?;
    match fb {
        _ if fb == b => Ok(feature),
        1 => Ok(feature.broadcast_as((b, c, h, w))?.contiguous()?),
        _ => Err(Error::Shape(format!(
            "adapter level {level} has batch {fb}, latents have batch {b}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use candle_transformers::models::stable_diffusion::unet_2d::{
        BlockConfig, UNet2DConditionModel,
    };

    fn tiny_config() -> UNet2DConditionModelConfig {
        UNet2DConditionModelConfig {
            blocks: vec![
                BlockConfig {
                    out_channels: 32,
                    use_cross_attn: Some(1),
                    attention_head_dim: 8,
                },
                BlockConfig {
                    out_channels: 64,
                    use_cross_attn: None,
                    attention_head_dim: 8,
                },
            ],
            layers_per_block: 1,
            cross_attention_dim: 16,
            ..Default::default()
        }
    }

    fn random_unet(config: UNet2DConditionModelConfig) -> (VarMap, AdapterUNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let unet = AdapterUNet::new(vb, 4, 4, false, config).unwrap();
        (varmap, unet)
    }

    fn ones_pyramid(device: &Device) -> AdapterFeatures {
        AdapterFeatures::new(vec![
            Tensor::ones((1, 32, 8, 8), DType::F32, device).unwrap(),
            Tensor::ones((1, 64, 4, 4), DType::F32, device).unwrap(),
        ])
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn sd_feature_shapes() {
        let config = UNet2DConditionModelConfig::default();
        let shapes = feature_shapes(&config, 2, 64, 64);
        assert_eq!(
            shapes,
            vec![
                (2, 320, 64, 64),
                (2, 640, 32, 32),
                (2, 1280, 16, 16),
                (2, 1280, 8, 8)
            ]
        );
    }

    #[test]
    fn odd_latents_follow_downsample_padding() {
        let mut config = tiny_config();
        assert_eq!(feature_shapes(&config, 1, 9, 7), vec![(1, 32, 9, 7), (1, 64, 5, 4)]);
        config.downsample_padding = 0;
        assert_eq!(feature_shapes(&config, 1, 9, 7), vec![(1, 32, 9, 7), (1, 64, 4, 3)]);
    }

    #[test]
    fn unpadded_downsampler_runs_on_odd_latents() {
        let mut config = tiny_config();
        config.downsample_padding = 0;
        let (_varmap, unet) = random_unet(config);
        let device = Device::Cpu;
        let latents = Tensor::randn(0f32, 1., (1, 4, 9, 7), &device).unwrap();
        let text = Tensor::randn(0f32, 1., (1, 3, 16), &device).unwrap();
        let features = AdapterFeatures::new(vec![
            Tensor::ones((1, 32, 9, 7), DType::F32, &device).unwrap(),
            Tensor::ones((1, 64, 4, 3), DType::F32, &device).unwrap(),
        ]);
        let out = unet.forward(&latents, 10.0, &text, Some(&features)).unwrap();
        assert_eq!(out.dims(), &[1, 4, 9, 7]);
    }

    #[test]
    fn matches_plain_unet_without_features() {
        let device = Device::Cpu;
        let (varmap, unet) = random_unet(tiny_config());
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let plain = UNet2DConditionModel::new(vb, 4, 4, false, tiny_config()).unwrap();

        let latents = Tensor::randn(0f32, 1., (2, 4, 8, 8), &device).unwrap();
        let text = Tensor::randn(0f32, 1., (2, 3, 16), &device).unwrap();
        let expected = plain.forward(&latents, 250.0, &text).unwrap();
        let actual = unet.forward(&latents, 250.0, &text, None).unwrap();
        assert!(max_abs_diff(&expected, &actual) < 1e-5);
    }

    #[test]
    fn features_change_prediction() {
        let device = Device::Cpu;
        let (_varmap, unet) = random_unet(tiny_config());
        let latents = Tensor::randn(0f32, 1., (1, 4, 8, 8), &device).unwrap();
        let text = Tensor::randn(0f32, 1., (1, 3, 16), &device).unwrap();

        let plain = unet.forward(&latents, 10.0, &text, None).unwrap();
        let conditioned = unet
            .forward(&latents, 10.0, &text, Some(&ones_pyramid(&device)))
            .unwrap();
        assert_eq!(conditioned.dims(), &[1, 4, 8, 8]);
        assert!(max_abs_diff(&plain, &conditioned) > 1e-4);

        let zeros = AdapterFeatures::new(vec![
            Tensor::zeros((1, 32, 8, 8), DType::F32, &device).unwrap(),
            Tensor::zeros((1, 64, 4, 4), DType::F32, &device).unwrap(),
        ]);
        let unchanged = unet.forward(&latents, 10.0, &text, Some(&zeros)).unwrap();
        assert!(max_abs_diff(&plain, &unchanged) < 1e-6);
    }

    #[test]
    fn shallow_feature_reaches_deeper_levels() {
        let device = Device::Cpu;
        let (_varmap, unet) = random_unet(tiny_config());
        let latents = Tensor::randn(0f32, 1., (1, 4, 8, 8), &device).unwrap();
        let text = Tensor::randn(0f32, 1., (1, 3, 16), &device).unwrap();
        let emb = Tensor::ones(1, DType::F32, &device).unwrap();
        let emb = unet.time_embedding.forward(&unet.time_proj.forward(&emb).unwrap()).unwrap();
        let xs = unet.conv_in.forward(&latents).unwrap();

        let features = unet
            .prepare_features(
                &latents,
                &AdapterFeatures::new(vec![
                    Tensor::ones((1, 32, 8, 8), DType::F32, &device).unwrap(),
                    Tensor::zeros((1, 64, 4, 4), DType::F32, &device).unwrap(),
                ]),
            )
            .unwrap();
        let (plain_out, plain_skips) = unet.down(&xs, &emb, &text, &[]).unwrap();
        let (out, skips) = unet.down(&xs, &emb, &text, &features).unwrap();

        // slots: conv_in, level 0 resnet, level 0 downsampler, level 1 resnet
        assert_eq!(skips.len(), 4);
        assert!(max_abs_diff(&plain_skips[0], &skips[0]) < 1e-6);
        let added = (&skips[1] - &plain_skips[1]).unwrap();
        let added: f32 = added.mean_all().unwrap().to_scalar().unwrap();
        assert!((added - 1.0).abs() < 1e-5);
        assert!(max_abs_diff(&plain_skips[2], &skips[2]) > 1e-4);
        assert!(max_abs_diff(&plain_skips[3], &skips[3]) > 1e-4);
        assert!(max_abs_diff(&plain_out, &out) > 1e-4);
    }

    #[test]
    fn batch_one_features_broadcast() {
        let device = Device::Cpu;
        let (_varmap, unet) = random_unet(tiny_config());
        let latents = Tensor::zeros((2, 4, 8, 8), DType::F32, &device).unwrap();
        let prepared = unet
            .prepare_features(&latents, &ones_pyramid(&device).with_scale(2.0))
            .unwrap();
        assert_eq!(prepared[0].dims(), &[2, 32, 8, 8]);
        assert_eq!(prepared[1].dims(), &[2, 64, 4, 4]);
        let sum: f32 = prepared[1].sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 2.0 * 2.0 * 64.0 * 16.0);
    }

    #[test]
    fn rejects_mismatched_features() {
        let device = Device::Cpu;
        let unet =
            AdapterUNet::new(VarBuilder::zeros(DType::F32, &device), 4, 4, false, tiny_config())
                .unwrap();
        let latents = Tensor::zeros((1, 4, 8, 8), DType::F32, &device).unwrap();
        let text = Tensor::zeros((1, 3, 16), DType::F32, &device).unwrap();

        let too_few = AdapterFeatures::new(vec![
            Tensor::ones((1, 32, 8, 8), DType::F32, &device).unwrap(),
        ]);
        assert!(matches!(
            unet.forward(&latents, 1.0, &text, Some(&too_few)),
            Err(Error::Shape(_))
        ));

        let wrong_width = AdapterFeatures::new(vec![
            Tensor::ones((1, 32, 8, 8), DType::F32, &device).unwrap(),
            Tensor::ones((1, 32, 4, 4), DType::F32, &device).unwrap(),
        ]);
        assert!(matches!(
            unet.forward(&latents, 1.0, &text, Some(&wrong_width)),
            Err(Error::Shape(_))
        ));

        let wrong_batch = AdapterFeatures::new(vec![
            Tensor::ones((3, 32, 8, 8), DType::F32, &device).unwrap(),
            Tensor::ones((3, 64, 4, 4), DType::F32, &device).unwrap(),
        ]);
        let latents = Tensor::zeros((2, 4, 8, 8), DType::F32, &device).unwrap();
        assert!(matches!(
            unet.forward(&latents, 1.0, &text, Some(&wrong_batch)),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn rejects_empty_config() {
        let mut config = tiny_config();
        config.blocks.clear();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            AdapterUNet::new(vb, 4, 4, false, config),
            Err(Error::Config(_))
        ));
    }
}
