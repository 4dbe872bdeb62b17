//! TensorRT-LLM loader for prebuilt engines. NVIDIA GPUs only.

use super::config_value::ConfigSnapshot;
use super::format_detector::FormatDetector;
use super::locator::ModelLocator;
use super::platform::ResolvedDevice;
use super::request::{BackendKind, LoadRequest};
use super::runtime_trait::{ArtifactFormat, BackendLoader, LaunchPlan, LoadOutcome, ModelHandle, ModelMetadata};
use super::server_process::{RuntimeEndpoint, ServerProcess};
use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
struct EngineConfig {
    #[serde(default)]
    pretrained_config: PretrainedConfig,
}

#[derive(Debug, Default, Deserialize)]
struct PretrainedConfig {
    architecture: Option<String>,
    vocab_size: Option<u64>,
    max_position_embeddings: Option<u64>,
    hidden_size: Option<u64>,
    dtype: Option<String>,
}

pub struct TensorRtLoader {
    locator: ModelLocator,
    binary: Option<PathBuf>,
    endpoint: RuntimeEndpoint,
    download_workers: usize,
}

impl TensorRtLoader {
    pub fn new(locator: ModelLocator, binary: Option<PathBuf>, endpoint: RuntimeEndpoint, download_workers: usize) -> Self {
        Self {
            locator,
            binary,
            endpoint,
            download_workers,
        }
    }

    /// `engine_dir` option wins over the model path.
    fn engine_dir(&self, request: &LoadRequest) -> PathBuf {
        request
            .options
            .engine_dir
            .clone()
            .unwrap_or_else(|| self.locator.model_path(request))
    }
}

#[async_trait]
impl BackendLoader for TensorRtLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::TensorRtLlm
    }

    fn resolve_local_artifact(&self, request: &LoadRequest) -> Option<PathBuf> {
        let path = self.engine_dir(request);
        let dir = if path.is_file() { path.parent()?.to_path_buf() } else { path };
        FormatDetector::find_with_extension(&dir, ArtifactFormat::TensorRTEngine).map(|_| dir)
    }

    async fn resolve_artifact(&self, request: &LoadRequest) -> HostResult<PathBuf> {
        if let Some(dir) = self.resolve_local_artifact(request) {
            info!("Using local TensorRT engines: {}", dir.display());
            return Ok(dir);
        }
        if request.options.engine_dir.is_none() && request.is_hub_repo_id() {
            let listing = self.locator.list_repository(request).await?;
            let files: Vec<_> = listing
                .iter()
                .filter(|f| f.is_file() && (f.has_extension("engine") || f.path.ends_with(".json")))
                .cloned()
                .collect();
            if !files.iter().any(|f| f.has_extension("engine")) {
                return Err(HostError::ModelDownload(format!(
                    "No .engine files found in repository {}",
                    request.model_name
                )));
            }
            return self.locator.fetch_files(request, &files, self.download_workers).await;
        }
        Err(HostError::ModelLoad(format!(
            "Model path does not exist: {}",
            self.engine_dir(request).display()
        )))
    }

    fn build_parameters(&self, request: &LoadRequest, artifact: &Path, device: ResolvedDevice) -> HostResult<LaunchPlan> {
        if device != ResolvedDevice::Cuda {
            return Err(HostError::PlatformIncompatible(format!(
                "TensorRT-LLM requires a CUDA device, resolved {}",
                device
            )));
        }
        let binary = self
            .binary
            .clone()
            .ok_or_else(|| HostError::ModelLoad("trtllm-serve binary not found. Set TRTLLM_BIN".to_string()))?;
        let opts = &request.options;
        let max_seq_len = opts.max_input_len.saturating_add(opts.max_output_len);

        let args: Vec<String> = vec![
            "serve".into(),
            artifact.display().to_string(),
            "--host".into(),
            self.endpoint.host.clone(),
            "--port".into(),
            self.endpoint.port.to_string(),
            "--max_batch_size".into(),
            opts.max_batch_size.to_string(),
            "--max_seq_len".into(),
            max_seq_len.to_string(),
        ];

        info!(
            "TensorRT-LLM parameters: batch {}, input {}, output {}",
            opts.max_batch_size, opts.max_input_len, opts.max_output_len
        );

        let mut config = ConfigSnapshot::new();
        config.insert("engine_dir".into(), artifact.to_path_buf().into());
        config.insert("device".into(), device.as_str().into());
        config.insert("max_batch_size".into(), opts.max_batch_size.into());
        config.insert("max_input_len".into(), opts.max_input_len.into());
        config.insert("max_output_len".into(), opts.max_output_len.into());

        Ok(LaunchPlan { binary, args, config })
    }

    async fn load(&self, request: &LoadRequest, device: ResolvedDevice) -> HostResult<LoadOutcome> {
        let artifact = self.resolve_artifact(request).await?;
        let plan = self.build_parameters(request, &artifact, device)?;
        let server = ServerProcess::spawn(BackendKind::TensorRtLlm, &plan, &self.endpoint).await?;
        let handle: Arc<dyn ModelHandle> = server;
        Ok(LoadOutcome::unified(handle, self.get_config(&plan)))
    }

    async fn get_metadata(&self, request: &LoadRequest) -> Option<ModelMetadata> {
        let dir = self.resolve_local_artifact(request)?;
        let engines = FormatDetector::files_with_extension(&dir, ArtifactFormat::TensorRTEngine);
        let file_size = engines
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        let mut meta = ModelMetadata {
            backend: Some(BackendKind::TensorRtLlm),
            model_path: dir.clone(),
            format: Some(ArtifactFormat::TensorRTEngine),
            file_size,
            ..Default::default()
        };

        let parsed = std::fs::read(dir.join("config.json"))
            .ok()
            .and_then(|bytes| serde_json::from_slice::<EngineConfig>(&bytes).map_err(|e| debug!("{}", e)).ok());
        if let Some(EngineConfig { pretrained_config: cfg }) = parsed {
            meta.vocab_size = cfg.vocab_size;
            meta.context_length = cfg.max_position_embeddings;
            meta.embedding_length = cfg.hidden_size;
            meta.description = cfg.architecture.as_ref().map(|arch| {
                format!("{} ({} engine(s), {})", arch, engines.len(), cfg.dtype.as_deref().unwrap_or("unknown dtype"))
            });
            meta.architecture = cfg.architecture;
        }
        Some(meta)
    }
}
