//! T2I-Adapter structural conditioning in pure Rust.
//!
//! A candle-based implementation of the T2I-Adapter side-network for
//! Stable Diffusion 1.x. Loads the published PyTorch checkpoints directly,
//! no conversion step needed.
//!
//! ## Architecture
//!
//! ```text
//! sketch / seg / keypose / depth image
//!            ↓
//!   PixelUnshuffle(8) + conv_in
//!            ↓
//!   4 levels × ResnetBlock ──→ feature pyramid (320, 640, 1280, 1280 ch)
//!                                     ↓
//!   latents ──→ adapter-aware U-Net (features added inside the down path)
//! ```
//!
//! ## Modules
//!
//! - [`config`]: adapter topology and the pretrained adapter types
//! - [`model`]: adapter, residual blocks, pixel unshuffle, adapter-aware U-Net
//! - [`pipeline`]: U-Net component management and pipeline patching
//! - [`condition`]: conditioning image preprocessing
//! - [`weights`]: checkpoint download and loading

pub mod condition;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod weights;

mod error;

pub use error::{Error, Result};
