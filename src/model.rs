//! Model components.
//!
//! ## Components
//!
//! - [`adapter`]: the T2I-Adapter feature pyramid
//! - [`resnet`]: adapter residual block and downsampler
//! - [`pixel`]: pixel (un)shuffle
//! - [`unet`]: Stable Diffusion U-Net that accepts adapter features

pub mod adapter;
pub mod pixel;
pub mod resnet;
pub mod unet;
