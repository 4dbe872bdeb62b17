//! Full-precision safetensors models served by a text-generation launcher.

use super::config_value::ConfigSnapshot;
use super::format_detector::FormatDetector;
use super::hub_client::HubFile;
use super::locator::ModelLocator;
use super::platform::ResolvedDevice;
use super::request::{BackendKind, ComputeDType, LoadRequest};
use super::runtime_trait::{ArtifactFormat, BackendLoader, LaunchPlan, LoadOutcome, ModelHandle, ModelMetadata};
use super::server_process::{RuntimeEndpoint, ServerProcess};
use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Non-weight files fetched alongside the weights when present.
const SUPPORT_FILES: &[&str] = &[
    "config.json",
    "generation_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "tokenizer.model",
    "special_tokens_map.json",
    "model.safetensors.index.json",
];

/// Fields of `config.json` reported as metadata.
#[derive(Debug, Default, Deserialize)]
struct HfModelConfig {
    vocab_size: Option<u64>,
    max_position_embeddings: Option<u64>,
    hidden_size: Option<u64>,
    #[serde(default)]
    architectures: Vec<String>,
    model_type: Option<String>,
    torch_dtype: Option<String>,
}

/// Files to download for a Transformers checkpoint. Safetensors weights are
/// preferred; `pytorch_model*.bin` is used only when none exist.
pub fn download_set(files: &[HubFile]) -> Vec<HubFile> {
    let mut weights: Vec<HubFile> = files
        .iter()
        .filter(|f| f.is_file() && f.has_extension("safetensors"))
        .cloned()
        .collect();
    if weights.is_empty() {
        weights = files
            .iter()
            .filter(|f| f.is_file() && f.file_name().starts_with("pytorch_model") && f.has_extension("bin"))
            .cloned()
            .collect();
    }
    if weights.is_empty() {
        return Vec::new();
    }

    let mut selected: Vec<HubFile> = files
        .iter()
        .filter(|f| SUPPORT_FILES.contains(&f.path.as_str()))
        .cloned()
        .collect();
    selected.extend(weights);
    selected
}

pub struct TransformersLoader {
    locator: ModelLocator,
    binary: Option<PathBuf>,
    endpoint: RuntimeEndpoint,
    download_workers: usize,
}

impl TransformersLoader {
    pub fn new(locator: ModelLocator, binary: Option<PathBuf>, endpoint: RuntimeEndpoint, download_workers: usize) -> Self {
        Self {
            locator,
            binary,
            endpoint,
            download_workers,
        }
    }

    fn read_model_config(dir: &Path) -> Option<HfModelConfig> {
        let bytes = std::fs::read(dir.join("config.json")).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                debug!("Unreadable config.json in {}: {}", dir.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl BackendLoader for TransformersLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::Transformers
    }

    fn resolve_local_artifact(&self, request: &LoadRequest) -> Option<PathBuf> {
        let path = self.locator.model_path(request);
        let dir = if path.is_file() { path.parent()?.to_path_buf() } else { path };
        // A config.json left by an interrupted download is not a checkpoint.
        (dir.is_dir() && dir.join("config.json").is_file() && FormatDetector::has_transformers_weights(&dir))
            .then_some(dir)
    }

    async fn resolve_artifact(&self, request: &LoadRequest) -> HostResult<PathBuf> {
        if let Some(dir) = self.resolve_local_artifact(request) {
            info!("Using local checkpoint: {}", dir.display());
            return Ok(dir);
        }
        if request.is_hub_repo_id() {
            let listing = self.locator.list_repository(request).await?;
            let files = download_set(&listing);
            if files.is_empty() {
                return Err(HostError::ModelDownload(format!(
                    "No safetensors or PyTorch weights found in repository {}",
                    request.model_name
                )));
            }
            return self.locator.fetch_files(request, &files, self.download_workers).await;
        }
        Err(HostError::ModelLoad(format!(
            "Model path does not exist: {}",
            self.locator.model_path(request).display()
        )))
    }

    fn build_parameters(&self, request: &LoadRequest, artifact: &Path, device: ResolvedDevice) -> HostResult<LaunchPlan> {
        let binary = self.binary.clone().ok_or_else(|| {
            HostError::ModelLoad("text-generation-launcher binary not found. Set TRANSFORMERS_BIN".to_string())
        })?;
        let opts = &request.options;

        let mut args: Vec<String> = vec![
            "--model-id".into(),
            artifact.display().to_string(),
            "--hostname".into(),
            self.endpoint.host.clone(),
            "--port".into(),
            self.endpoint.port.to_string(),
        ];

        // bitsandbytes kernels need CUDA.
        let quantize = match (opts.load_in_4bit, opts.load_in_8bit) {
            _ if device != ResolvedDevice::Cuda && (opts.load_in_4bit || opts.load_in_8bit) => {
                warn!("Quantized loading requires CUDA; loading {} unquantized", request.model_name);
                None
            }
            (true, _) => Some("bitsandbytes-nf4"),
            (false, true) => Some("bitsandbytes"),
            (false, false) => None,
        };
        if let Some(q) = quantize {
            args.extend(["--quantize".into(), q.into()]);
        } else if opts.compute_dtype != ComputeDType::Float32 {
            args.extend(["--dtype".into(), opts.compute_dtype.as_str().into()]);
        }
        if opts.trust_remote_code {
            args.push("--trust-remote-code".into());
        }
        if let Some(revision) = &opts.revision {
            args.extend(["--revision".into(), revision.clone()]);
        }
        if device == ResolvedDevice::Cpu {
            args.push("--disable-custom-kernels".into());
        }
        if opts.use_flash_attention || opts.max_memory.is_some() {
            warn!("use_flash_attention and max_memory have no launcher equivalent and are ignored");
        }

        info!(
            "Transformers parameters: device {}, dtype {}, quantize {}",
            device,
            opts.compute_dtype.as_str(),
            quantize.unwrap_or("none")
        );

        let mut config = ConfigSnapshot::new();
        config.insert("model_path".into(), artifact.to_path_buf().into());
        config.insert("device".into(), device.as_str().into());
        config.insert("compute_dtype".into(), opts.compute_dtype.into());
        config.insert("load_in_8bit".into(), opts.load_in_8bit.into());
        config.insert("load_in_4bit".into(), opts.load_in_4bit.into());
        config.insert("quantize".into(), quantize.into());
        config.insert("trust_remote_code".into(), opts.trust_remote_code.into());
        config.insert("revision".into(), opts.revision.clone().into());

        Ok(LaunchPlan { binary, args, config })
    }

    async fn load(&self, request: &LoadRequest, device: ResolvedDevice) -> HostResult<LoadOutcome> {
        let artifact = self.resolve_artifact(request).await?;
        let plan = self.build_parameters(request, &artifact, device)?;
        let server = ServerProcess::spawn(BackendKind::Transformers, &plan, &self.endpoint).await?;
        let handle: Arc<dyn ModelHandle> = server;
        Ok(LoadOutcome::unified(handle, self.get_config(&plan)))
    }

    async fn get_metadata(&self, request: &LoadRequest) -> Option<ModelMetadata> {
        let dir = self.resolve_local_artifact(request)?;

        let mut weights = FormatDetector::files_with_extension(&dir, ArtifactFormat::Safetensors);
        let format = if weights.is_empty() {
            weights = FormatDetector::files_with_extension(&dir, ArtifactFormat::PyTorchBin);
            ArtifactFormat::PyTorchBin
        } else {
            ArtifactFormat::Safetensors
        };
        let file_size = weights
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        let mut meta = ModelMetadata {
            backend: Some(BackendKind::Transformers),
            model_path: dir.clone(),
            format: Some(format),
            file_size,
            ..Default::default()
        };

        if let Some(cfg) = Self::read_model_config(&dir) {
            meta.vocab_size = cfg.vocab_size;
            meta.context_length = cfg.max_position_embeddings;
            meta.embedding_length = cfg.hidden_size;
            meta.architecture = cfg.architectures.first().cloned().or(cfg.model_type);
            meta.description = meta.architecture.as_ref().map(|arch| match &cfg.torch_dtype {
                Some(dtype) => format!("{} ({}, {} weight file(s))", arch, dtype, weights.len()),
                None => format!("{} ({} weight file(s))", arch, weights.len()),
            });
        }
        Some(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::config_value::ConfigValue;
    use crate::model_runtime::hub_client::HubClient;
    use crate::model_runtime::request::LoadOptions;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn loader(models_dir: &Path, endpoint: &str) -> TransformersLoader {
        TransformersLoader::new(
            ModelLocator::new(models_dir, models_dir.join("ollama"), HubClient::new(endpoint, None)),
            Some(PathBuf::from("/usr/local/bin/text-generation-launcher")),
            RuntimeEndpoint { host: "127.0.0.1".into(), port: 8081, startup_timeout: Duration::from_secs(1) },
            2,
        )
    }

    fn hub(path: &str) -> HubFile {
        HubFile { path: path.into(), size: Some(1), entry_type: Some("file".into()) }
    }

    #[test]
    fn test_download_set_prefers_safetensors() {
        let listing = vec![
            hub("config.json"),
            hub("tokenizer.json"),
            hub("README.md"),
            hub("model-00001-of-00002.safetensors"),
            hub("model-00002-of-00002.safetensors"),
            hub("pytorch_model.bin"),
        ];
        let names: Vec<String> = download_set(&listing).into_iter().map(|f| f.path).collect();
        assert!(names.contains(&"config.json".to_string()));
        assert!(names.contains(&"tokenizer.json".to_string()));
        assert!(!names.contains(&"pytorch_model.bin".to_string()));
        assert!(!names.contains(&"README.md".to_string()));
        assert_eq!(names.iter().filter(|n| n.ends_with(".safetensors")).count(), 2);
    }

    #[test]
    fn test_download_set_without_weights_is_empty() {
        assert!(download_set(&[hub("config.json"), hub("README.md")]).is_empty());
    }

    #[test]
    fn test_dtype_kept_typed_in_config() {
        let dir = tempdir().unwrap();
        let options = LoadOptions { compute_dtype: ComputeDType::BFloat16, ..LoadOptions::default() };
        let req = LoadRequest::new("m").with_options(options);
        let plan = loader(dir.path(), "http://127.0.0.1:9")
            .build_parameters(&req, Path::new("/m"), ResolvedDevice::Cuda)
            .unwrap();
        assert_eq!(plan.config.get("compute_dtype"), Some(&ConfigValue::DType(ComputeDType::BFloat16)));
        assert!(plan.args.windows(2).any(|w| w[0] == "--dtype" && w[1] == "bfloat16"));
    }

    #[test]
    fn test_quantization_dropped_on_cpu() {
        let dir = tempdir().unwrap();
        let l = loader(dir.path(), "http://127.0.0.1:9");
        let options = LoadOptions { load_in_4bit: true, ..LoadOptions::default() };
        let req = LoadRequest::new("m").with_options(options);

        let cuda = l.build_parameters(&req, Path::new("/m"), ResolvedDevice::Cuda).unwrap();
        assert!(cuda.args.windows(2).any(|w| w[0] == "--quantize" && w[1] == "bitsandbytes-nf4"));

        let cpu = l.build_parameters(&req, Path::new("/m"), ResolvedDevice::Cpu).unwrap();
        assert!(!cpu.args.iter().any(|a| a == "--quantize"));
        assert!(cpu.args.iter().any(|a| a == "--disable-custom-kernels"));
    }

    #[tokio::test]
    async fn test_metadata_reads_config_json() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("tiny");
        fs::create_dir_all(&model).unwrap();
        fs::write(
            model.join("config.json"),
            r#"{"architectures":["LlamaForCausalLM"],"vocab_size":32000,
                "max_position_embeddings":4096,"hidden_size":2048,"torch_dtype":"bfloat16"}"#,
        )
        .unwrap();
        fs::write(model.join("model.safetensors"), vec![0u8; 64]).unwrap();

        let meta = loader(dir.path(), "http://127.0.0.1:9")
            .get_metadata(&LoadRequest::new("tiny"))
            .await
            .unwrap();
        assert_eq!(meta.file_size, 64);
        assert_eq!(meta.vocab_size, Some(32000));
        assert_eq!(meta.context_length, Some(4096));
        assert_eq!(meta.architecture.as_deref(), Some("LlamaForCausalLM"));
        assert_eq!(meta.format, Some(ArtifactFormat::Safetensors));
    }

    #[tokio::test]
    async fn test_metadata_absent_without_checkpoint() {
        let dir = tempdir().unwrap();
        let l = loader(dir.path(), "http://127.0.0.1:9");
        assert!(l.get_metadata(&LoadRequest::new("ghost")).await.is_none());
    }

    #[tokio::test]
    async fn test_hub_download_fetches_checkpoint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/models/org/tiny/tree/main")
            .with_body(
                r#"[{"type":"file","path":"config.json","size":2},
                    {"type":"file","path":"model.safetensors","size":7},
                    {"type":"file","path":"README.md","size":5}]"#,
            )
            .create_async()
            .await;
        let config = server.mock("GET", "/org/tiny/resolve/main/config.json").with_body("{}").create_async().await;
        let weights = server
            .mock("GET", "/org/tiny/resolve/main/model.safetensors")
            .with_body("weights")
            .create_async()
            .await;
        let readme = server.mock("GET", "/org/tiny/resolve/main/README.md").expect(0).create_async().await;

        let dir = tempdir().unwrap();
        let path = loader(dir.path(), &server.url())
            .resolve_artifact(&LoadRequest::new("org/tiny"))
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("org/tiny"));
        assert!(path.join("model.safetensors").is_file());
        config.assert_async().await;
        weights.assert_async().await;
        readme.assert_async().await;
    }

    #[tokio::test]
    async fn test_interrupted_download_is_fetched_again() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/models/org/tiny/tree/main")
            .with_body(
                r#"[{"type":"file","path":"config.json","size":2},
                    {"type":"file","path":"model.safetensors","size":7}]"#,
            )
            .create_async()
            .await;
        let config = server
            .mock("GET", "/org/tiny/resolve/main/config.json")
            .expect(0)
            .create_async()
            .await;
        let broken = server
            .mock("GET", "/org/tiny/resolve/main/model.safetensors")
            .with_status(500)
            .create_async()
            .await;

        // config.json survived an earlier run whose weight transfer failed.
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("org/tiny")).unwrap();
        fs::write(dir.path().join("org/tiny/config.json"), b"{}").unwrap();
        let l = loader(dir.path(), &server.url());
        let req = LoadRequest::new("org/tiny");
        assert!(l.resolve_local_artifact(&req).is_none());

        let err = l.resolve_artifact(&req).await.unwrap_err();
        assert!(matches!(err, HostError::ModelDownload(_)));
        assert!(!dir.path().join("org/tiny/model.safetensors").exists());
        assert!(l.resolve_local_artifact(&req).is_none());

        broken.remove_async().await;
        server
            .mock("GET", "/org/tiny/resolve/main/model.safetensors")
            .with_body("weights")
            .create_async()
            .await;

        let path = l.resolve_artifact(&req).await.unwrap();
        assert_eq!(fs::read(path.join("model.safetensors")).unwrap(), b"weights");
        assert_eq!(l.resolve_local_artifact(&req), Some(path));
        config.assert_async().await;
    }

    #[test]
    fn test_options_without_launcher_flag_stay_out_of_config() {
        let dir = tempdir().unwrap();
        let mut max_memory = std::collections::BTreeMap::new();
        max_memory.insert("0".to_string(), "20GiB".to_string());
        let options = LoadOptions {
            use_flash_attention: true,
            max_memory: Some(max_memory),
            ..LoadOptions::default()
        };
        let plan = loader(dir.path(), "http://127.0.0.1:9")
            .build_parameters(&LoadRequest::new("m").with_options(options), Path::new("/m"), ResolvedDevice::Cuda)
            .unwrap();
        assert!(!plan.config.contains_key("use_flash_attention"));
        assert!(!plan.config.contains_key("max_memory"));
        assert!(!plan.args.iter().any(|a| a.contains("flash") || a.contains("memory")));
    }
}
