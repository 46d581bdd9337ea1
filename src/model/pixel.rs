//! Pixel (un)shuffle: trade spatial resolution for channel depth.
//!
//! Channel ordering follows PyTorch: for factor `r`, input pixel
//! `(h * r + i, w * r + j)` of channel `c` lands in output channel
//! `c * r² + i * r + j` at `(h, w)`.

use candle_core::Tensor;

use crate::{Error, Result};

/// Pixel unshuffle: `[B, C, H, W]` → `[B, C*r², H/r, W/r]`.
pub fn pixel_unshuffle(x: &Tensor, r: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    if r == 0 || h % r != 0 || w % r != 0 {
        return Err(Error::Shape(format!(
            "pixel_unshuffle({r}) needs spatial dims divisible by {r}, got {h}x{w}"
        )));
    }
    let (oh, ow) = (h / r, w / r);
    // [B, C, H/r, r, W/r, r] → [B, C, r, r, H/r, W/r]
    let x = x.reshape((b, c, oh, r, ow, r))?;
    let x = x.permute([0, 1, 3, 5, 2, 4])?;
    Ok(x.reshape((b, c * r * r, oh, ow))?)
}

/// Pixel shuffle: `[B, C*r², H, W]` → `[B, C, H*r, W*r]`.
pub fn pixel_shuffle(x: &Tensor, r: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    if r == 0 || c % (r * r) != 0 {
        return Err(Error::Shape(format!(
            "pixel_shuffle({r}) needs channels divisible by {}, got {c}",
            r * r
        )));
    }
    let oc = c / (r * r);
    let x = x.reshape((b, oc, r, r, h, w))?;
    let x = x.permute([0, 1, 4, 2, 5, 3])?;
    Ok(x.reshape((b, oc, h * r, w * r))?)
}
