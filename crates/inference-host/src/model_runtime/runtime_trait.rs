use super::config_value::ConfigSnapshot;
use super::platform::ResolvedDevice;
use super::prompt_cache::PromptCache;
use super::request::{BackendKind, LoadRequest};
use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk format of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactFormat {
    GGUF,
    Safetensors,
    PyTorchBin,
    TensorRTEngine,
    Unknown,
}

impl ArtifactFormat {
    pub fn extensions(&self) -> &[&str] {
        match self {
            ArtifactFormat::GGUF => &["gguf"],
            ArtifactFormat::Safetensors => &["safetensors"],
            ArtifactFormat::PyTorchBin => &["bin"],
            ArtifactFormat::TensorRTEngine => &["engine", "plan"],
            ArtifactFormat::Unknown => &[],
        }
    }

    pub fn from_path(path: &Path) -> ArtifactFormat {
        let Some(ext) = path.extension().and_then(|e| e.to_str()).map(str::to_lowercase) else {
            return ArtifactFormat::Unknown;
        };
        [
            ArtifactFormat::GGUF,
            ArtifactFormat::Safetensors,
            ArtifactFormat::PyTorchBin,
            ArtifactFormat::TensorRTEngine,
        ]
        .into_iter()
        .find(|f| f.extensions().contains(&ext.as_str()))
        .unwrap_or(ArtifactFormat::Unknown)
    }
}

/// Read-only description of an artifact, obtained without a full load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub backend: Option<BackendKind>,
    pub model_path: PathBuf,
    pub format: Option<ArtifactFormat>,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub content: String,
    pub finish_reason: Option<String>,
}

/// A runnable model held by the manager.
///
/// Handles use interior mutability so teardown works through a shared
/// reference; the manager owns the only strong `Arc`.
#[async_trait]
pub trait ModelHandle: Send + Sync + fmt::Debug {
    fn backend(&self) -> BackendKind;

    fn base_url(&self) -> String;

    async fn is_ready(&self) -> bool;

    async fn generate(&self, request: InferenceRequest) -> HostResult<InferenceResponse>;

    /// Release runtime resources. Must be idempotent.
    fn shutdown(&self) -> HostResult<()>;

    /// Attach a bounded prompt cache. Runtimes without one report `ModelLoad`.
    fn attach_prompt_cache(&self, _cache: PromptCache) -> HostResult<()> {
        Err(HostError::ModelLoad(format!("{} runtime has no prompt cache", self.backend())))
    }

    fn prompt_cache(&self) -> Option<PromptCache> {
        None
    }
}

/// What a successful loader call hands back to the manager.
#[derive(Debug)]
pub struct LoadOutcome {
    pub model: Arc<dyn ModelHandle>,
    /// Same handle as `model` for runtimes with a built-in tokenizer.
    pub tokenizer: Arc<dyn ModelHandle>,
    pub config: ConfigSnapshot,
}

impl LoadOutcome {
    pub fn unified(handle: Arc<dyn ModelHandle>, config: ConfigSnapshot) -> Self {
        Self {
            model: handle.clone(),
            tokenizer: handle,
            config,
        }
    }
}

/// Process launch description produced by parameter assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub config: ConfigSnapshot,
}

/// Result of a backend-specific cleanup hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The loader released the handle itself.
    Handled,
    /// No specific hook; the manager performs a generic release.
    NotHandled,
}

/// One loader per backend kind. Loaders are stateless across calls.
#[async_trait]
pub trait BackendLoader: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Locate (or fetch) the artifact for `request`.
    async fn resolve_artifact(&self, request: &LoadRequest) -> HostResult<PathBuf>;

    /// Local-only lookup, never touches the network.
    fn resolve_local_artifact(&self, request: &LoadRequest) -> Option<PathBuf>;

    /// Assemble runtime parameters for `artifact` on `device`.
    fn build_parameters(
        &self,
        request: &LoadRequest,
        artifact: &Path,
        device: ResolvedDevice,
    ) -> HostResult<LaunchPlan>;

    async fn load(&self, request: &LoadRequest, device: ResolvedDevice) -> HostResult<LoadOutcome>;

    /// Lightweight probe. Returns `None` when the artifact is missing.
    async fn get_metadata(&self, request: &LoadRequest) -> Option<ModelMetadata>;

    fn get_config(&self, plan: &LaunchPlan) -> ConfigSnapshot {
        plan.config.clone()
    }

    /// Backend-specific teardown, callable without the original request.
    fn cleanup(&self, _handle: &dyn ModelHandle) -> CleanupOutcome {
        CleanupOutcome::NotHandled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ArtifactFormat::from_path(Path::new("m.Q4_K_M.gguf")), ArtifactFormat::GGUF);
        assert_eq!(ArtifactFormat::from_path(Path::new("model.safetensors")), ArtifactFormat::Safetensors);
        assert_eq!(ArtifactFormat::from_path(Path::new("rank0.engine")), ArtifactFormat::TensorRTEngine);
        assert_eq!(ArtifactFormat::from_path(Path::new("README")), ArtifactFormat::Unknown);
    }

    #[test]
    fn test_metadata_omits_absent_enrichment() {
        let meta = ModelMetadata {
            backend: Some(BackendKind::LlamaCpp),
            model_path: PathBuf::from("m.gguf"),
            format: Some(ArtifactFormat::GGUF),
            file_size: 10,
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("vocab_size").is_none());
        assert_eq!(json["file_size"], 10);
    }
}
