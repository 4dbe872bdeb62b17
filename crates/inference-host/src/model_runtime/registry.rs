//! Backend kind → loader table, built once at startup.

use super::llamacpp_runtime::LlamaCppLoader;
use super::locator::ModelLocator;
use super::request::BackendKind;
use super::runtime_trait::BackendLoader;
use super::server_process::RuntimeEndpoint;
use super::tensorrt_runtime::TensorRtLoader;
use super::transformers_runtime::TransformersLoader;
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct LoaderRegistry {
    loaders: HashMap<BackendKind, Arc<dyn BackendLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three real runtimes, wired from `config`.
    pub fn standard(config: &HostConfig) -> Self {
        let locator = ModelLocator::from_config(config);
        let endpoint = RuntimeEndpoint::from_config(config);

        let mut registry = Self::new();
        registry.register(Arc::new(LlamaCppLoader::new(
            locator.clone(),
            config.llama_bin.clone(),
            endpoint.clone(),
            config.preferred_quant.clone(),
        )));
        registry.register(Arc::new(TransformersLoader::new(
            locator.clone(),
            config.transformers_bin.clone(),
            endpoint.clone(),
            config.download_workers,
        )));
        registry.register(Arc::new(TensorRtLoader::new(
            locator,
            config.trtllm_bin.clone(),
            endpoint,
            config.download_workers,
        )));
        registry
    }

    /// Replaces any loader already registered for the same kind.
    pub fn register(&mut self, loader: Arc<dyn BackendLoader>) {
        self.loaders.insert(loader.kind(), loader);
    }

    pub fn get(&self, kind: BackendKind) -> HostResult<Arc<dyn BackendLoader>> {
        self.loaders
            .get(&kind)
            .cloned()
            .ok_or_else(|| HostError::ModelLoad(format!("Unsupported model type: {}", kind)))
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.loaders.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
