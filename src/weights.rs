//! Checkpoint retrieval and loading.
//!
//! Adapter checkpoints are published as PyTorch pickles in
//! [`PRETRAINED_REPO`]; U-Net weights are usually diffusers safetensors.
//! Both go through [`var_builder`], which picks the reader from the file
//! extension.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::Api;

use crate::config::{AdapterType, PRETRAINED_REPO};
use crate::{Error, Result};

/// On-disk checkpoint formats we can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    Safetensors,
    Pickle,
}

impl WeightFormat {
    /// Detect the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "safetensors" => Some(WeightFormat::Safetensors),
            "pth" | "pt" | "bin" | "ckpt" => Some(WeightFormat::Pickle),
            _ => None,
        }
    }
}

/// Build a [`VarBuilder`] over one or more checkpoint files.
///
/// Several files are only supported for safetensors (sharded checkpoints);
/// pickle checkpoints must be a single file.
pub fn var_builder(paths: &[PathBuf], dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let first = paths
        .first()
        .ok_or_else(|| Error::WeightLoad("no weight files given".into()))?;
    for path in paths {
        if !path.exists() {
            return Err(Error::WeightLoad(format!("{} does not exist", path.display())));
        }
    }

    let format = WeightFormat::from_path(first).ok_or_else(|| {
        Error::WeightLoad(format!(
            "unsupported checkpoint extension: {}",
            first.display()
        ))
    })?;
    if paths.iter().any(|p| WeightFormat::from_path(p) != Some(format)) {
        return Err(Error::WeightLoad(
            "all checkpoint files must share one format".into(),
        ));
    }

    match format {
        WeightFormat::Safetensors => {
            // SAFETY: the files are memory-mapped read-only and not modified
            // while the VarBuilder is alive.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device) }
                .map_err(|e| Error::WeightLoad(format!("{}: {e}", first.display())))?;
            Ok(vb)
        }
        WeightFormat::Pickle => {
            if paths.len() > 1 {
                return Err(Error::WeightLoad(
                    "sharded pickle checkpoints are not supported".into(),
                ));
            }
            VarBuilder::from_pth(first, dtype, device)
                .map_err(|e| Error::WeightLoad(format!("{}: {e}", first.display())))
        }
    }
}

/// Download the published checkpoint for `adapter_type` into the local
/// Hugging Face cache and return its path. Cached files are reused.
pub fn fetch_pretrained(adapter_type: AdapterType) -> Result<PathBuf> {
    let file = adapter_type.weights_file();
    tracing::info!(repo = PRETRAINED_REPO, %file, "fetching adapter checkpoint");
    let api = Api::new()?;
    let repo = api.model(PRETRAINED_REPO.to_string());
    Ok(repo.get(&file)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use candle_core::Tensor;

    #[test]
    fn format_detection() {
        assert_eq!(
            WeightFormat::from_path(Path::new("a/t2iadapter_depth_sd14v1.pth")),
            Some(WeightFormat::Pickle)
        );
        assert_eq!(
            WeightFormat::from_path(Path::new("unet/diffusion_pytorch_model.SAFETENSORS")),
            Some(WeightFormat::Safetensors)
        );
        assert_eq!(
            WeightFormat::from_path(Path::new("diffusion_pytorch_model.bin")),
            Some(WeightFormat::Pickle)
        );
        assert_eq!(WeightFormat::from_path(Path::new("weights.onnx")), None);
        assert_eq!(WeightFormat::from_path(Path::new("weights")), None);
    }

    #[test]
    fn rejects_missing_and_unknown_files() {
        let device = Device::Cpu;
        assert!(matches!(
            var_builder(&[], DType::F32, &device),
            Err(Error::WeightLoad(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.safetensors");
        assert!(matches!(
            var_builder(&[missing], DType::F32, &device),
            Err(Error::WeightLoad(_))
        ));

        let onnx = dir.path().join("model.onnx");
        std::fs::write(&onnx, b"not a checkpoint").unwrap();
        assert!(matches!(
            var_builder(&[onnx], DType::F32, &device),
            Err(Error::WeightLoad(_))
        ));
    }

    #[test]
    fn loads_safetensors() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conv.safetensors");
        let weight = Tensor::ones((2, 3, 1, 1), DType::F32, &device).unwrap();
        let tensors = HashMap::from([("conv_in.weight".to_string(), weight)]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let vb = var_builder(&[path], DType::F32, &device).unwrap();
        assert!(vb.contains_tensor("conv_in.weight"));
        let w = vb.get((2, 3, 1, 1), "conv_in.weight").unwrap();
        let sum: f32 = w.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 6.0);
    }
}
