//! llama.cpp loader: single-file GGUF artifacts served by `llama-server`.

use super::config_value::ConfigSnapshot;
use super::format_detector::FormatDetector;
use super::gguf_header;
use super::locator::ModelLocator;
use super::platform::ResolvedDevice;
use super::prompt_cache::PromptCache;
use super::request::{BackendKind, LoadRequest};
use super::runtime_trait::{
    ArtifactFormat, BackendLoader, CleanupOutcome, LaunchPlan, LoadOutcome, ModelHandle, ModelMetadata,
};
use super::server_process::{RuntimeEndpoint, ServerProcess};
use crate::config::{default_batch_threads, default_threads};
use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Offload layer count for `device`.
///
/// Unified-memory accelerators default to 1 layer; discrete accelerators
/// and CPU default to 0 so offload is an explicit opt-in.
pub fn offload_layers(device: ResolvedDevice, explicit: Option<u32>) -> u32 {
    match device {
        ResolvedDevice::Metal => explicit.unwrap_or(1),
        ResolvedDevice::Cuda | ResolvedDevice::Cpu => explicit.unwrap_or(0),
    }
}

pub struct LlamaCppLoader {
    locator: ModelLocator,
    binary: Option<PathBuf>,
    endpoint: RuntimeEndpoint,
    preferred_quant: String,
}

impl LlamaCppLoader {
    pub fn new(
        locator: ModelLocator,
        binary: Option<PathBuf>,
        endpoint: RuntimeEndpoint,
        preferred_quant: impl Into<String>,
    ) -> Self {
        Self {
            locator,
            binary,
            endpoint,
            preferred_quant: preferred_quant.into(),
        }
    }
}

#[async_trait]
impl BackendLoader for LlamaCppLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::LlamaCpp
    }

    fn resolve_local_artifact(&self, request: &LoadRequest) -> Option<PathBuf> {
        let path = self.locator.model_path(request);
        if path.is_file() {
            return Some(path);
        }
        if path.is_dir() {
            return FormatDetector::find_with_extension(&path, ArtifactFormat::GGUF);
        }
        None
    }

    async fn resolve_artifact(&self, request: &LoadRequest) -> HostResult<PathBuf> {
        if let Some(path) = self.resolve_local_artifact(request) {
            info!("Using local GGUF artifact: {}", path.display());
            return Ok(path);
        }
        if request.is_hub_repo_id() {
            info!("No local GGUF for {}, downloading from hub", request.model_name);
            return self
                .locator
                .fetch_best_candidate(request, "gguf", &self.preferred_quant)
                .await;
        }
        Err(HostError::ModelLoad(format!(
            "Model path does not exist: {}",
            self.locator.model_path(request).display()
        )))
    }

    fn build_parameters(&self, request: &LoadRequest, artifact: &Path, device: ResolvedDevice) -> HostResult<LaunchPlan> {
        let binary = self
            .binary
            .clone()
            .ok_or_else(|| HostError::ModelLoad("llama-server binary not found. Set LLAMA_BIN".to_string()))?;
        let opts = &request.options;

        let n_threads = opts.n_threads.unwrap_or_else(default_threads);
        let n_threads_batch = opts.n_threads_batch.unwrap_or_else(default_batch_threads);
        let n_gpu_layers = offload_layers(device, opts.n_gpu_layers);

        let mut args: Vec<String> = vec![
            "--model".into(),
            artifact.display().to_string(),
            "--host".into(),
            self.endpoint.host.clone(),
            "--port".into(),
            self.endpoint.port.to_string(),
            "--ctx-size".into(),
            opts.n_ctx.to_string(),
            "--batch-size".into(),
            opts.n_batch.to_string(),
            "--threads".into(),
            n_threads.to_string(),
            "--threads-batch".into(),
            n_threads_batch.to_string(),
            "--n-gpu-layers".into(),
            n_gpu_layers.to_string(),
            "--main-gpu".into(),
            opts.main_gpu.to_string(),
        ];

        if let Some(split) = &opts.tensor_split {
            let joined: Vec<String> = split.iter().map(|v| v.to_string()).collect();
            args.extend(["--tensor-split".into(), joined.join(",")]);
        }
        if let Some(mode) = &opts.split_mode {
            args.extend(["--split-mode".into(), mode.clone()]);
        }
        if !opts.use_mmap {
            args.push("--no-mmap".into());
        }
        if opts.use_mlock {
            args.push("--mlock".into());
        }
        if opts.offload_kqv == Some(false) {
            args.push("--no-kv-offload".into());
        }
        if opts.flash_attn {
            args.push("--flash-attn".into());
        }
        if let Some(cache_type) = &opts.cache_type {
            args.extend(["--cache-type-k".into(), cache_type.clone()]);
            args.extend(["--cache-type-v".into(), cache_type.clone()]);
        }
        // Frequency overrides only mean something alongside a scaling type.
        if let Some(scaling) = &opts.rope_scaling_type {
            args.extend(["--rope-scaling".into(), scaling.clone()]);
            if let Some(base) = opts.rope_freq_base {
                args.extend(["--rope-freq-base".into(), base.to_string()]);
            }
            if let Some(scale) = opts.rope_freq_scale {
                args.extend(["--rope-freq-scale".into(), scale.to_string()]);
            }
        }

        info!(
            "llama.cpp parameters: device {}, ctx {}, batch {}, threads {}/{}, gpu layers {}",
            device, opts.n_ctx, opts.n_batch, n_threads, n_threads_batch, n_gpu_layers
        );

        let mut config = ConfigSnapshot::new();
        config.insert("model_path".into(), artifact.to_path_buf().into());
        config.insert("device".into(), device.as_str().into());
        config.insert("n_ctx".into(), opts.n_ctx.into());
        config.insert("n_batch".into(), opts.n_batch.into());
        config.insert("n_threads".into(), n_threads.into());
        config.insert("n_threads_batch".into(), n_threads_batch.into());
        config.insert("n_gpu_layers".into(), n_gpu_layers.into());
        config.insert("main_gpu".into(), opts.main_gpu.into());
        config.insert("tensor_split".into(), opts.tensor_split.clone().into());
        config.insert("split_mode".into(), opts.split_mode.clone().into());
        config.insert("use_mmap".into(), opts.use_mmap.into());
        config.insert("use_mlock".into(), opts.use_mlock.into());
        config.insert("offload_kqv".into(), opts.offload_kqv.into());
        config.insert("flash_attn".into(), opts.flash_attn.into());
        config.insert("cache_type".into(), opts.cache_type.clone().into());
        config.insert("cache_size".into(), opts.cache_size.into());
        if opts.rope_scaling_type.is_some() {
            config.insert("rope_scaling_type".into(), opts.rope_scaling_type.clone().into());
            config.insert("rope_freq_base".into(), opts.rope_freq_base.into());
            config.insert("rope_freq_scale".into(), opts.rope_freq_scale.into());
        }

        Ok(LaunchPlan { binary, args, config })
    }

    async fn load(&self, request: &LoadRequest, device: ResolvedDevice) -> HostResult<LoadOutcome> {
        let artifact = self.resolve_artifact(request).await?;
        let plan = self.build_parameters(request, &artifact, device)?;
        let server = ServerProcess::spawn(BackendKind::LlamaCpp, &plan, &self.endpoint).await?;

        if let Some(size) = request.options.cache_size {
            if let Err(e) = server.attach_prompt_cache(PromptCache::new(size)) {
                warn!("Prompt cache not attached: {}", e);
            }
        }

        let handle: Arc<dyn ModelHandle> = server;
        Ok(LoadOutcome::unified(handle, self.get_config(&plan)))
    }

    async fn get_metadata(&self, request: &LoadRequest) -> Option<ModelMetadata> {
        let path = self.resolve_local_artifact(request)?;
        let file_size = tokio::fs::metadata(&path).await.ok()?.len();

        let mut meta = ModelMetadata {
            backend: Some(BackendKind::LlamaCpp),
            model_path: path.clone(),
            format: Some(ArtifactFormat::GGUF),
            file_size,
            ..Default::default()
        };

        let probe_path = path.clone();
        match tokio::task::spawn_blocking(move || gguf_header::read_summary(&probe_path)).await {
            Ok(Ok(summary)) => {
                meta.vocab_size = summary.vocab_size;
                meta.context_length = summary.context_length;
                meta.embedding_length = summary.embedding_length;
                meta.description = summary.architecture.as_ref().map(|arch| match &summary.name {
                    Some(name) => format!("{} ({}, GGUF v{})", name, arch, summary.version),
                    None => format!("{} (GGUF v{})", arch, summary.version),
                });
                meta.architecture = summary.architecture;
            }
            Ok(Err(e)) => debug!("GGUF header probe skipped for {}: {}", path.display(), e),
            Err(e) => debug!("GGUF header probe task failed: {}", e),
        }
        Some(meta)
    }

    fn cleanup(&self, handle: &dyn ModelHandle) -> CleanupOutcome {
        if let Some(cache) = handle.prompt_cache() {
            cache.clear();
        }
        if let Err(e) = handle.shutdown() {
            warn!("llama.cpp shutdown reported: {}", e);
        }
        CleanupOutcome::Handled
    }
}
