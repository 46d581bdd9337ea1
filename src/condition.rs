//! Conditioning image preprocessing.
//!
//! Adapters see the conditioning image as a `[1, C, H, W]` f32 tensor in
//! `[0, 1]`: one luminance channel for sketches, RGB for everything else.
//! `H` and `W` are rounded to multiples of 64 so the pyramid lines up with an
//! SD latent grid (8× VAE downscale, then three U-Net halvings).

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use image::imageops::FilterType;

use crate::Result;
use crate::config::AdapterType;

/// Spatial granularity of conditioning images.
pub const SIZE_MULTIPLE: usize = 64;

/// Round `size` to the nearest multiple of [`SIZE_MULTIPLE`], at least one.
pub fn snap_size(size: usize) -> usize {
    let snapped = (size + SIZE_MULTIPLE / 2) / SIZE_MULTIPLE * SIZE_MULTIPLE;
    snapped.max(SIZE_MULTIPLE)
}

/// Decode `path` and convert it for `adapter_type`.
pub fn load_condition_image(
    path: impl AsRef<Path>,
    adapter_type: AdapterType,
    device: &Device,
) -> Result<Tensor> {
    let path = path.as_ref();
    let img = image::open(path)?;
    tracing::debug!(
        path = %path.display(),
        width = img.width(),
        height = img.height(),
        "loaded conditioning image"
    );
    image_to_tensor(&img, adapter_type, device)
}

/// Resize and convert an in-memory image; see [`load_condition_image`].
pub fn image_to_tensor(
    img: &DynamicImage,
    adapter_type: AdapterType,
    device: &Device,
) -> Result<Tensor> {
    let width = snap_size(img.width() as usize);
    let height = snap_size(img.height() as usize);
    let img = if (width, height) == (img.width() as usize, img.height() as usize) {
        img.clone()
    } else {
        img.resize_exact(width as u32, height as u32, FilterType::Triangle)
    };

    let (channels, data) = match adapter_type {
        AdapterType::Sketch => (1, img.to_luma8().into_raw()),
        _ => (3, img.to_rgb8().into_raw()),
    };

    // [H, W, C] u8 → [1, C, H, W] f32 in [0, 1]
    let tensor = Tensor::from_vec(data, (height, width, channels), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    let tensor = (tensor / 255.0)?;
    Ok(tensor.unsqueeze(0)?)
}
