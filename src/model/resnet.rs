//! Adapter residual block and its downsampler.
//!
//! ```text
//! x ─→ [Downsample] ─→ [in_conv] ─┬→ block1(3x3) → ReLU → block2(k) ─→ + ─→
//!                                  └──────────── [skep(k)] ───────────┘
//! ```
//!
//! `in_conv` is present unless the block is a skip block (`sk`) whose input
//! and output channels already match; `skep` is present exactly when
//! `in_conv` is not.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::{Error, Result};

/// Halve spatial resolution with a strided 3x3 conv or a 2x2 average pool.
#[derive(Debug, Clone)]
pub struct Downsample {
    channels: usize,
    op: Option<Conv2d>,
}

impl Downsample {
    pub fn load(vb: VarBuilder, channels: usize, use_conv: bool) -> Result<Self> {
        let op = if use_conv {
            let cfg = Conv2dConfig {
                padding: 1,
                stride: 2,
                ..Default::default()
            };
            Some(candle_nn::conv2d(channels, channels, 3, cfg, vb.pp("op"))?)
        } else {
            None
        };
        Ok(Self { channels, op })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let c = x.dim(1)?;
        if c != self.channels {
            return Err(Error::Shape(format!(
                "downsample expects {} channels, got {c}",
                self.channels
            )));
        }
        match &self.op {
            Some(conv) => Ok(conv.forward(x)?),
            None => Ok(x.avg_pool2d(2)?),
        }
    }
}

/// Shape parameters of a [`ResnetBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResnetBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub down: bool,
    pub ksize: usize,
    pub skip: bool,
    pub use_conv: bool,
}

/// Residual block: optional downsample and input projection, then
/// `block2(relu(block1(x))) + residual`.
#[derive(Debug, Clone)]
pub struct ResnetBlock {
    down_opt: Option<Downsample>,
    in_conv: Option<Conv2d>,
    block1: Conv2d,
    block2: Conv2d,
    skep: Option<Conv2d>,
}

impl ResnetBlock {
    pub fn load(vb: VarBuilder, cfg: ResnetBlockConfig) -> Result<Self> {
        if cfg.ksize % 2 == 0 {
            return Err(Error::Config(format!(
                "resnet block ksize must be odd, got {}",
                cfg.ksize
            )));
        }
        let (in_c, out_c) = (cfg.in_channels, cfg.out_channels);
        let cfg_k = Conv2dConfig {
            padding: cfg.ksize / 2,
            ..Default::default()
        };
        let cfg3x3 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let in_conv = if in_c != out_c || !cfg.skip {
            Some(candle_nn::conv2d(in_c, out_c, cfg.ksize, cfg_k, vb.pp("in_conv"))?)
        } else {
            None
        };
        let block1 = candle_nn::conv2d(out_c, out_c, 3, cfg3x3, vb.pp("block1"))?;
        let block2 = candle_nn::conv2d(out_c, out_c, cfg.ksize, cfg_k, vb.pp("block2"))?;
        let skep = if in_conv.is_none() {
            Some(candle_nn::conv2d(in_c, out_c, cfg.ksize, cfg_k, vb.pp("skep"))?)
        } else {
            None
        };
        let down_opt = if cfg.down {
            Some(Downsample::load(vb.pp("down_opt"), in_c, cfg.use_conv)?)
        } else {
            None
        };

        Ok(Self {
            down_opt,
            in_conv,
            block1,
            block2,
            skep,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = match &self.down_opt {
            Some(down) => down.forward(x)?,
            None => x.clone(),
        };
        let x = match &self.in_conv {
            Some(conv) => conv.forward(&x)?,
            None => x,
        };

        let h = self.block1.forward(&x)?;
        let h = h.relu()?;
        let h = self.block2.forward(&h)?;

        let residual = match &self.skep {
            Some(conv) => conv.forward(&x)?,
            None => x,
        };
        Ok((h + residual)?)
    }

    pub fn has_in_conv(&self) -> bool {
        self.in_conv.is_some()
    }

    pub fn has_skep(&self) -> bool {
        self.skep.is_some()
    }
}
