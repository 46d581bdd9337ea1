//! Adapter configuration and the pretrained adapter variants.
//!
//! Defaults match the constructor of the reference T2I-Adapter; the
//! pretrained SD 1.4 checkpoints all override them the same way (see
//! [`AdapterType::config`]).

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Hugging Face repo holding the SD 1.4 adapter checkpoints.
pub const PRETRAINED_REPO: &str = "TencentARC/T2I-Adapter";

/// Topology of an [`Adapter`](crate::model::adapter::Adapter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Output channels per pyramid level, shallow to deep.
    #[serde(default = "default_channels")]
    pub channels: Vec<usize>,

    /// Residual blocks per level.
    #[serde(default = "default_num_res_blocks")]
    pub num_res_blocks: usize,

    /// Channels entering `conv_in`, i.e. image channels × `downscale_factor²`.
    #[serde(default = "default_cin")]
    pub cin: usize,

    /// Kernel size of `in_conv`, `block2` and `skep`.
    #[serde(default = "default_ksize")]
    pub ksize: usize,

    /// Reuse the block input as the residual when channels already match.
    #[serde(default)]
    pub skip: bool,

    /// Downsample with a strided conv instead of average pooling.
    #[serde(default = "default_use_conv")]
    pub use_conv: bool,

    /// Pixel-unshuffle factor applied to the conditioning image.
    #[serde(default = "default_downscale_factor")]
    pub downscale_factor: usize,
}

fn default_channels() -> Vec<usize> {
    vec![320, 640, 1280, 1280]
}

fn default_num_res_blocks() -> usize {
    3
}

fn default_cin() -> usize {
    64
}

fn default_ksize() -> usize {
    3
}

fn default_use_conv() -> bool {
    true
}

fn default_downscale_factor() -> usize {
    8
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            num_res_blocks: default_num_res_blocks(),
            cin: default_cin(),
            ksize: default_ksize(),
            skip: false,
            use_conv: default_use_conv(),
            downscale_factor: default_downscale_factor(),
        }
    }
}

impl AdapterConfig {
    /// Read a config from a JSON file. Missing fields take the defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of pyramid levels (one feature map per level).
    pub fn num_levels(&self) -> usize {
        self.channels.len()
    }

    /// Channels of the conditioning image before unshuffling.
    pub fn image_channels(&self) -> usize {
        self.cin / (self.downscale_factor * self.downscale_factor)
    }

    /// Check that the config describes a buildable adapter.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Error::Config("channels must not be empty".into()));
        }
        if self.channels.contains(&0) {
            return Err(Error::Config(format!(
                "channels must be positive, got {:?}",
                self.channels
            )));
        }
        if self.num_res_blocks == 0 {
            return Err(Error::Config("num_res_blocks must be at least 1".into()));
        }
        if self.ksize % 2 == 0 {
            return Err(Error::Config(format!(
                "ksize must be odd, got {}",
                self.ksize
            )));
        }
        if self.downscale_factor == 0 {
            return Err(Error::Config("downscale_factor must be at least 1".into()));
        }
        let area = self.downscale_factor * self.downscale_factor;
        if self.cin == 0 || self.cin % area != 0 {
            return Err(Error::Config(format!(
                "cin ({}) must be a positive multiple of downscale_factor² ({area})",
                self.cin
            )));
        }
        Ok(())
    }
}

/// The structural inputs with published SD 1.4 adapter checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    Sketch,
    Seg,
    Keypose,
    Depth,
}

impl AdapterType {
    pub const ALL: [AdapterType; 4] = [
        AdapterType::Sketch,
        AdapterType::Seg,
        AdapterType::Keypose,
        AdapterType::Depth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterType::Sketch => "sketch",
            AdapterType::Seg => "seg",
            AdapterType::Keypose => "keypose",
            AdapterType::Depth => "depth",
        }
    }

    /// Config of the published checkpoint.
    ///
    /// Sketch adapters take a single-channel edge map (`cin = 64`); every
    /// other type takes an RGB image (`cin = 192`).
    pub fn config(&self) -> AdapterConfig {
        let cin = match self {
            AdapterType::Sketch => 64,
            _ => 64 * 3,
        };
        AdapterConfig {
            channels: vec![320, 640, 1280, 1280],
            num_res_blocks: 2,
            cin,
            ksize: 1,
            skip: true,
            use_conv: false,
            downscale_factor: 8,
        }
    }

    /// Checkpoint path inside [`PRETRAINED_REPO`].
    pub fn weights_file(&self) -> String {
        format!("models/t2iadapter_{}_sd14v1.pth", self.as_str())
    }
}

impl std::fmt::Display for AdapterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sketch" => Ok(AdapterType::Sketch),
            "seg" => Ok(AdapterType::Seg),
            "keypose" => Ok(AdapterType::Keypose),
            "depth" => Ok(AdapterType::Depth),
            other => Err(Error::Config(format!(
                "unknown adapter type '{other}' (expected sketch, seg, keypose or depth)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = AdapterConfig::default();
        assert_eq!(cfg.channels, vec![320, 640, 1280, 1280]);
        assert_eq!(cfg.num_res_blocks, 3);
        assert_eq!(cfg.cin, 64);
        assert_eq!(cfg.ksize, 3);
        assert!(!cfg.skip);
        assert!(cfg.use_conv);
        assert_eq!(cfg.image_channels(), 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_pretrained_configs() {
        let sketch = AdapterType::Sketch.config();
        assert_eq!(sketch.cin, 64);
        assert_eq!(sketch.image_channels(), 1);
        for ty in [AdapterType::Seg, AdapterType::Keypose, AdapterType::Depth] {
            let cfg = ty.config();
            assert_eq!(cfg.cin, 192);
            assert_eq!(cfg.image_channels(), 3);
            assert_eq!(cfg.num_res_blocks, 2);
            assert_eq!(cfg.ksize, 1);
            assert!(cfg.skip);
            assert!(!cfg.use_conv);
        }
    }

    #[test]
    fn test_weights_file() {
        assert_eq!(
            AdapterType::Sketch.weights_file(),
            "models/t2iadapter_sketch_sd14v1.pth"
        );
        assert_eq!(
            AdapterType::Keypose.weights_file(),
            "models/t2iadapter_keypose_sd14v1.pth"
        );
    }

    #[test]
    fn test_adapter_type_parse() {
        for ty in AdapterType::ALL {
            assert_eq!(ty.as_str().parse::<AdapterType>().unwrap(), ty);
        }
        assert_eq!("Depth".parse::<AdapterType>().unwrap(), AdapterType::Depth);
        assert!("canny".parse::<AdapterType>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let even_kernel = AdapterConfig {
            ksize: 2,
            ..Default::default()
        };
        assert!(even_kernel.validate().is_err());

        let no_levels = AdapterConfig {
            channels: vec![],
            ..Default::default()
        };
        assert!(no_levels.validate().is_err());

        let no_blocks = AdapterConfig {
            num_res_blocks: 0,
            ..Default::default()
        };
        assert!(no_blocks.validate().is_err());

        let ragged_cin = AdapterConfig {
            cin: 100,
            ..Default::default()
        };
        assert!(ragged_cin.validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.json");
        std::fs::write(&path, r#"{"cin": 192, "ksize": 1, "skip": true}"#).unwrap();
        let cfg = AdapterConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.cin, 192);
        assert_eq!(cfg.ksize, 1);
        assert!(cfg.skip);
        assert_eq!(cfg.num_res_blocks, 3);
        assert_eq!(cfg.channels, vec![320, 640, 1280, 1280]);
    }
}
