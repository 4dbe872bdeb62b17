//! Model lifecycle manager.
//!
//! Owns the single loaded model. Loads are serialized by an atomic flag that
//! is claimed before any teardown or I/O and released on every exit path.
//! Readers go through `ArcSwapOption` and never wait on a load.

use super::config_value::{normalize_snapshot, ConfigSnapshot};
use super::format_detector::FormatDetector;
use super::locator::ModelLocator;
use super::platform::{self, HostProbe, ResolvedDevice, SystemProbe};
use super::registry::LoaderRegistry;
use super::request::{BackendKind, LoadRequest};
use super::runtime_trait::{CleanupOutcome, InferenceRequest, InferenceResponse, ModelHandle, ModelMetadata};
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::metrics;
use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// `(model, tokenizer)`. Both are weak: the manager keeps the only strong
/// reference, so handles stop upgrading once the model is unloaded.
pub type HandlePair = (Weak<dyn ModelHandle>, Weak<dyn ModelHandle>);

struct LoadedModelState {
    model: Arc<dyn ModelHandle>,
    tokenizer: Arc<dyn ModelHandle>,
    backend_kind: BackendKind,
    device: ResolvedDevice,
    model_name: String,
    config: ConfigSnapshot,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InfoSnapshot {
    pub model_name: Option<String>,
    pub backend_kind: Option<BackendKind>,
    pub device: Option<ResolvedDevice>,
    pub is_loaded: bool,
    pub is_loading: bool,
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Clears the loading flag when the load scope ends, however it ends.
struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> HostResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| HostError::ConcurrentLoad)?;
        Ok(Self(flag))
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ModelManager {
    state: ArcSwapOption<LoadedModelState>,
    loading: AtomicBool,
    locator: ModelLocator,
    registry: LoaderRegistry,
    probe: Arc<dyn HostProbe>,
}

impl ModelManager {
    pub fn new(config: &HostConfig) -> Self {
        Self::with_parts(
            ModelLocator::from_config(config),
            LoaderRegistry::standard(config),
            Arc::new(SystemProbe::new()),
        )
    }

    pub fn with_parts(locator: ModelLocator, registry: LoaderRegistry, probe: Arc<dyn HostProbe>) -> Self {
        Self {
            state: ArcSwapOption::empty(),
            loading: AtomicBool::new(false),
            locator,
            registry,
            probe,
        }
    }

    /// Load `request`, replacing whatever was loaded before.
    ///
    /// The previous model is torn down before anything else happens, so a
    /// failed load leaves the manager empty.
    pub async fn load(&self, request: LoadRequest) -> HostResult<HandlePair> {
        let _guard = LoadingGuard::acquire(&self.loading)?;
        self.clear_state();

        let started = Instant::now();
        let requested_kind = request.backend_kind;
        info!("Loading model {} (backend: {})", request.model_name, requested_kind);

        match self.load_steps(request).await {
            Ok(state) => {
                let handles: HandlePair = (Arc::downgrade(&state.model), Arc::downgrade(&state.tokenizer));
                let elapsed = started.elapsed().as_secs_f64();
                info!(
                    "Loaded {} with {} on {} in {:.1}s",
                    state.model_name, state.backend_kind, state.device, elapsed
                );
                metrics::record_load(state.backend_kind.as_str(), "success");
                metrics::observe_load_seconds(elapsed);
                metrics::set_loaded(true);
                self.state.store(Some(Arc::new(state)));
                Ok(handles)
            }
            Err(e) => {
                error!("Failed to load model: {}", e);
                metrics::record_load(requested_kind.as_str(), "failure");
                Err(e)
            }
        }
    }

    async fn load_steps(&self, mut request: LoadRequest) -> HostResult<LoadedModelState> {
        let caps = self.probe.capabilities();

        let initial = platform::resolve(request.device, request.backend_kind, &caps);
        if !initial.compatible {
            return Err(HostError::PlatformIncompatible(initial.reason));
        }

        if request.backend_kind == BackendKind::HubNative {
            self.locator.bridge_hub_native(&mut request)?;
        }

        let path = self.locator.model_path(&request);
        let has_local = path.exists() || request.options.engine_dir.as_ref().is_some_and(|d| d.exists());
        if !has_local {
            if !request.is_hub_repo_id() {
                return Err(HostError::ModelNotFound(path.display().to_string()));
            }
            info!("{} not found locally, will fetch from hub", request.model_name);
        }

        if request.backend_kind == BackendKind::Auto {
            self.locator.bind_detected_backend(&mut request).await?;
        }

        // The backend may have changed above, so check again.
        let resolution = platform::resolve(request.device, request.backend_kind, &caps);
        if !resolution.compatible {
            return Err(HostError::PlatformIncompatible(resolution.reason));
        }
        info!("Device: {} ({})", resolution.device, resolution.reason);

        let loader = self.registry.get(request.backend_kind)?;
        let outcome = loader
            .load(&request, resolution.device)
            .await
            .map_err(HostError::into_domain)?;

        Ok(LoadedModelState {
            model: outcome.model,
            tokenizer: outcome.tokenizer,
            backend_kind: request.backend_kind,
            device: resolution.device,
            model_name: request.model_name,
            config: outcome.config,
        })
    }

    /// Release the loaded model. A no-op when nothing is loaded.
    pub fn unload(&self) {
        if !self.clear_state() {
            debug!("Unload requested with no model loaded");
        }
    }

    /// Tear down the current state, if any. Returns whether there was one.
    fn clear_state(&self) -> bool {
        let Some(state) = self.state.swap(None) else {
            return false;
        };
        info!("Unloading {} ({})", state.model_name, state.backend_kind);

        let outcome = match self.registry.get(state.backend_kind) {
            Ok(loader) => loader.cleanup(state.model.as_ref()),
            Err(_) => CleanupOutcome::NotHandled,
        };
        if outcome == CleanupOutcome::NotHandled {
            if let Err(e) = state.model.shutdown() {
                warn!("Generic release of {} failed: {}", state.model_name, e);
            }
            if !Arc::ptr_eq(&state.model, &state.tokenizer) {
                if let Err(e) = state.tokenizer.shutdown() {
                    warn!("Tokenizer release failed: {}", e);
                }
            }
        }

        let device = state.device;
        drop(state);
        self.probe.release_accelerator_memory(Some(device));
        metrics::inc_unloads();
        metrics::set_loaded(false);
        true
    }

    pub fn get_info(&self) -> InfoSnapshot {
        let is_loading = self.loading.load(Ordering::Acquire);
        match &*self.state.load() {
            Some(state) => InfoSnapshot {
                model_name: Some(state.model_name.clone()),
                backend_kind: Some(state.backend_kind),
                device: Some(state.device),
                is_loaded: true,
                is_loading,
                config: normalize_snapshot(&state.config),
            },
            None => InfoSnapshot {
                model_name: None,
                backend_kind: None,
                device: None,
                is_loaded: false,
                is_loading,
                config: serde_json::Map::new(),
            },
        }
    }

    /// Probe a local artifact without loading it. Never downloads and never
    /// touches the loaded state; any failure yields `None`.
    pub async fn get_metadata(&self, request: &LoadRequest) -> Option<ModelMetadata> {
        let mut probe = request.clone();
        match probe.backend_kind {
            BackendKind::HubNative => {
                self.locator.bridge_hub_native(&mut probe).ok()?;
            }
            BackendKind::Auto => {
                let path = self.locator.model_path(&probe);
                match FormatDetector::detect_backend(&path)? {
                    BackendKind::HubNative => {
                        probe.backend_kind = BackendKind::HubNative;
                        probe.model_path = Some(path);
                        self.locator.bridge_hub_native(&mut probe).ok()?;
                    }
                    kind => probe.backend_kind = kind,
                }
            }
            _ => {}
        }
        let loader = self.registry.get(probe.backend_kind).ok()?;
        loader.get_metadata(&probe).await
    }

    /// Forward a chat request to the loaded model.
    pub async fn generate(&self, request: InferenceRequest) -> HostResult<InferenceResponse> {
        let state = self
            .state
            .load_full()
            .ok_or_else(|| HostError::ModelLoad("No model loaded".to_string()))?;
        state.model.generate(request).await
    }

    pub fn locator(&self) -> &ModelLocator {
        &self.locator
    }

    pub fn probe(&self) -> &dyn HostProbe {
        self.probe.as_ref()
    }
}

impl Drop for ModelManager {
    fn drop(&mut self) {
        self.clear_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::hub_client::HubClient;
    use crate::model_runtime::platform::HostCapabilities;
    use std::fs;
    use tempfile::tempdir;

    struct CpuProbe;

    impl HostProbe for CpuProbe {
        fn capabilities(&self) -> HostCapabilities {
            HostCapabilities::cpu_only()
        }

        fn release_accelerator_memory(&self, _device: Option<ResolvedDevice>) {}
    }

    fn manager(root: &std::path::Path) -> ModelManager {
        let config = HostConfig {
            models_dir: root.join("models"),
            hub_native_dir: root.join("ollama"),
            hf_endpoint: "http://127.0.0.1:9".into(),
            llama_bin: None,
            ..HostConfig::default()
        };
        ModelManager::with_parts(
            ModelLocator::new(&config.models_dir, &config.hub_native_dir, HubClient::new("http://127.0.0.1:9", None)),
            LoaderRegistry::standard(&config),
            Arc::new(CpuProbe),
        )
    }

    #[test]
    fn test_loading_guard_rejects_second_claim() {
        let flag = AtomicBool::new(false);
        let guard = LoadingGuard::acquire(&flag).unwrap();
        assert!(matches!(LoadingGuard::acquire(&flag), Err(HostError::ConcurrentLoad)));
        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
        assert!(LoadingGuard::acquire(&flag).is_ok());
    }

    #[test]
    fn test_empty_info() {
        let dir = tempdir().unwrap();
        let info = manager(dir.path()).get_info();
        assert!(!info.is_loaded);
        assert!(!info.is_loading);
        assert!(info.model_name.is_none());
        assert!(info.config.is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_model_is_not_found() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        let err = m.load(LoadRequest::new("ghost")).await.unwrap_err();
        assert!(matches!(err, HostError::ModelNotFound(_)));
        let info = m.get_info();
        assert!(!info.is_loaded && !info.is_loading);
    }

    #[tokio::test]
    async fn test_tensorrt_on_cpu_host_is_incompatible() {
        let dir = tempdir().unwrap();
        let req = LoadRequest::new("engine").with_backend(BackendKind::TensorRtLlm);
        let err = manager(dir.path()).load(req).await.unwrap_err();
        assert!(matches!(err, HostError::PlatformIncompatible(_)));
    }

    #[tokio::test]
    async fn test_missing_runtime_binary_fails_cleanly() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("models/tiny");
        fs::create_dir_all(&model).unwrap();
        fs::write(model.join("tiny.gguf"), b"GGUF").unwrap();

        let m = manager(dir.path());
        let err = m.load(LoadRequest::new("tiny")).await.unwrap_err();
        assert!(matches!(err, HostError::ModelLoad(_)));
        assert!(!m.get_info().is_loaded);
    }

    #[tokio::test]
    async fn test_metadata_never_raises() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        assert!(m.get_metadata(&LoadRequest::new("ghost")).await.is_none());
        assert!(m
            .get_metadata(&LoadRequest::new("org/remote").with_backend(BackendKind::LlamaCpp))
            .await
            .is_none());
        assert!(m
            .get_metadata(&LoadRequest::new("llama3").with_backend(BackendKind::HubNative))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_metadata_auto_detects_local_gguf() {
        let dir = tempdir().unwrap();
        let model = dir.path().join("models/tiny");
        fs::create_dir_all(&model).unwrap();
        fs::write(model.join("tiny.gguf"), b"GGUF-ish").unwrap();

        let meta = manager(dir.path()).get_metadata(&LoadRequest::new("tiny")).await.unwrap();
        assert_eq!(meta.backend, Some(BackendKind::LlamaCpp));
        assert_eq!(meta.file_size, 8);
    }

    #[test]
    fn test_unload_twice_is_noop() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path());
        m.unload();
        m.unload();
        assert!(!m.get_info().is_loaded);
    }
}
