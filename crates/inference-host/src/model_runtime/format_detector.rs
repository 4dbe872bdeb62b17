//! Backend detection from on-disk layout.
//!
//! Looks at file extensions and a few well-known file names. Detection has
//! no fallback: an unrecognised layout yields `None`.
use super::request::BackendKind;
use super::runtime_trait::ArtifactFormat;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Tag file inside a hub-native model directory.
pub const HUB_MANIFEST_TAG: &str = "latest";

pub struct FormatDetector;

impl FormatDetector {
    pub fn detect_backend(path: &Path) -> Option<BackendKind> {
        let kind = if path.is_file() {
            Self::detect_file(path)
        } else if path.is_dir() {
            Self::detect_dir(path)
        } else {
            None
        };
        match kind {
            Some(k) => info!("Detected backend {} for: {}", k, path.display()),
            None => debug!("No backend signature found at: {}", path.display()),
        }
        kind
    }

    fn detect_file(path: &Path) -> Option<BackendKind> {
        match ArtifactFormat::from_path(path) {
            ArtifactFormat::GGUF => Some(BackendKind::LlamaCpp),
            ArtifactFormat::TensorRTEngine => Some(BackendKind::TensorRtLlm),
            ArtifactFormat::Safetensors => Some(BackendKind::Transformers),
            ArtifactFormat::PyTorchBin | ArtifactFormat::Unknown => {
                if Self::is_hub_manifest(path) {
                    Some(BackendKind::HubNative)
                } else {
                    None
                }
            }
        }
    }

    fn detect_dir(dir: &Path) -> Option<BackendKind> {
        if Self::find_with_extension(dir, ArtifactFormat::GGUF).is_some() {
            return Some(BackendKind::LlamaCpp);
        }
        if Self::find_with_extension(dir, ArtifactFormat::TensorRTEngine).is_some() {
            return Some(BackendKind::TensorRtLlm);
        }
        if dir.join("config.json").is_file() && Self::has_transformers_weights(dir) {
            return Some(BackendKind::Transformers);
        }
        if Self::is_hub_manifest(&dir.join(HUB_MANIFEST_TAG)) {
            return Some(BackendKind::HubNative);
        }
        None
    }

    pub(crate) fn has_transformers_weights(dir: &Path) -> bool {
        if Self::find_with_extension(dir, ArtifactFormat::Safetensors).is_some() {
            return true;
        }
        Self::sorted_entries(dir).iter().any(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("pytorch_model") && n.ends_with(".bin"))
                .unwrap_or(false)
        })
    }

    fn is_hub_manifest(path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .map(|v| v.get("layers").map(|l| l.is_array()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// First file in `dir` (by name) with one of `format`'s extensions.
    pub fn find_with_extension(dir: &Path, format: ArtifactFormat) -> Option<PathBuf> {
        Self::sorted_entries(dir)
            .into_iter()
            .find(|p| p.is_file() && ArtifactFormat::from_path(p) == format)
    }

    pub fn files_with_extension(dir: &Path, format: ArtifactFormat) -> Vec<PathBuf> {
        Self::sorted_entries(dir)
            .into_iter()
            .filter(|p| p.is_file() && ArtifactFormat::from_path(p) == format)
            .collect()
    }

    fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        paths
    }
}
