//! Load requests and the option bag carried with them.

use crate::error::HostError;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

lazy_static! {
    static ref HUB_REPO_ID: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*/[A-Za-z0-9_.\-]+$").unwrap();
}

/// Which runtime implementation handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    /// Detect from the artifact.
    Auto,
    /// Ollama manifest + blob store. Bridged to `LlamaCpp` before loading.
    HubNative,
    /// Quantized single-file GGUF runtime.
    LlamaCpp,
    /// Full-precision safetensors runtime.
    Transformers,
    /// Prebuilt TensorRT-LLM engines.
    TensorRtLlm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::HubNative => "ollama",
            BackendKind::LlamaCpp => "llama.cpp",
            BackendKind::Transformers => "Transformers",
            BackendKind::TensorRtLlm => "TensorRT-LLM",
        }
    }

    /// Kinds that map onto a real loader.
    pub fn loadable() -> &'static [BackendKind] {
        &[BackendKind::LlamaCpp, BackendKind::Transformers, BackendKind::TensorRtLlm]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(BackendKind::Auto),
            "ollama" | "hub-native" => Ok(BackendKind::HubNative),
            "llama.cpp" | "llamacpp" | "gguf" => Ok(BackendKind::LlamaCpp),
            "transformers" | "safetensors" => Ok(BackendKind::Transformers),
            "tensorrt-llm" | "tensorrt" | "trtllm" => Ok(BackendKind::TensorRtLlm),
            other => Err(HostError::ModelLoad(format!("Unsupported model type: {}", other))),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = HostError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Device the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceRequest {
    #[default]
    Auto,
    Cpu,
    Accelerator,
}

impl FromStr for DeviceRequest {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(DeviceRequest::Auto),
            "cpu" => Ok(DeviceRequest::Cpu),
            "accelerator" | "gpu" | "cuda" | "mps" | "metal" => Ok(DeviceRequest::Accelerator),
            other => Err(HostError::ModelLoad(format!("Unsupported device: {}", other))),
        }
    }
}

impl TryFrom<String> for DeviceRequest {
    type Error = HostError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceRequest> for String {
    fn from(device: DeviceRequest) -> Self {
        match device {
            DeviceRequest::Auto => "auto",
            DeviceRequest::Cpu => "cpu",
            DeviceRequest::Accelerator => "accelerator",
        }
        .to_string()
    }
}

/// Precision used by the full-precision runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDType {
    #[default]
    Float16,
    BFloat16,
    Float32,
}

impl ComputeDType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeDType::Float16 => "float16",
            ComputeDType::BFloat16 => "bfloat16",
            ComputeDType::Float32 => "float32",
        }
    }
}

fn default_n_ctx() -> u32 {
    2048
}

fn default_n_batch() -> u32 {
    512
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> u32 {
    1
}

fn default_max_input_len() -> u32 {
    2048
}

fn default_max_output_len() -> u32 {
    512
}

/// Backend-specific options. Each loader reads the fields it understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadOptions {
    // llama.cpp
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
    #[serde(default = "default_n_batch")]
    pub n_batch: u32,
    #[serde(default)]
    pub n_threads: Option<u32>,
    #[serde(default)]
    pub n_threads_batch: Option<u32>,
    #[serde(default)]
    pub n_gpu_layers: Option<u32>,
    #[serde(default)]
    pub main_gpu: u32,
    #[serde(default)]
    pub tensor_split: Option<Vec<f32>>,
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    #[serde(default)]
    pub use_mlock: bool,
    #[serde(default)]
    pub offload_kqv: Option<bool>,
    #[serde(default)]
    pub split_mode: Option<String>,
    #[serde(default)]
    pub flash_attn: bool,
    #[serde(default)]
    pub cache_type: Option<String>,
    /// Prompt cache capacity in bytes.
    #[serde(default)]
    pub cache_size: Option<u64>,
    #[serde(default)]
    pub rope_scaling_type: Option<String>,
    #[serde(default)]
    pub rope_freq_base: Option<f32>,
    #[serde(default)]
    pub rope_freq_scale: Option<f32>,

    // Transformers
    #[serde(default)]
    pub load_in_8bit: bool,
    #[serde(default)]
    pub load_in_4bit: bool,
    #[serde(default)]
    pub compute_dtype: ComputeDType,
    #[serde(default = "default_true")]
    pub trust_remote_code: bool,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub use_flash_attention: bool,
    #[serde(default)]
    pub max_memory: Option<BTreeMap<String, String>>,

    // TensorRT-LLM
    #[serde(default)]
    pub engine_dir: Option<PathBuf>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
    #[serde(default = "default_max_input_len")]
    pub max_input_len: u32,
    #[serde(default = "default_max_output_len")]
    pub max_output_len: u32,

    /// Bearer token for gated hub repositories.
    #[serde(default)]
    pub hf_token: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_threads: None,
            n_threads_batch: None,
            n_gpu_layers: None,
            main_gpu: 0,
            tensor_split: None,
            use_mmap: true,
            use_mlock: false,
            offload_kqv: None,
            split_mode: None,
            flash_attn: false,
            cache_type: None,
            cache_size: None,
            rope_scaling_type: None,
            rope_freq_base: None,
            rope_freq_scale: None,
            load_in_8bit: false,
            load_in_4bit: false,
            compute_dtype: ComputeDType::Float16,
            trust_remote_code: true,
            revision: None,
            use_flash_attention: false,
            max_memory: None,
            engine_dir: None,
            max_batch_size: default_max_batch_size(),
            max_input_len: default_max_input_len(),
            max_output_len: default_max_output_len(),
            hf_token: None,
        }
    }
}

/// A single load request.
///
/// Once handed to the manager, the only permitted rewrite is the locator's
/// single `rebind` of artifact path and backend kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub model_name: String,
    #[serde(default = "default_backend")]
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default)]
    pub device: DeviceRequest,
    #[serde(default)]
    pub options: LoadOptions,
    #[serde(skip)]
    rebound: bool,
}

fn default_backend() -> BackendKind {
    BackendKind::Auto
}

impl LoadRequest {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            backend_kind: BackendKind::Auto,
            model_path: None,
            device: DeviceRequest::Auto,
            options: LoadOptions::default(),
            rebound: false,
        }
    }

    pub fn with_backend(mut self, kind: BackendKind) -> Self {
        self.backend_kind = kind;
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn with_device(mut self, device: DeviceRequest) -> Self {
        self.device = device;
        self
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    /// Explicit path, or `<models_dir>/<model_name>`.
    pub fn artifact_path(&self, models_dir: &Path) -> PathBuf {
        match &self.model_path {
            Some(path) => path.clone(),
            None => models_dir.join(&self.model_name),
        }
    }

    /// `owner/name` shape, the only names eligible for remote download.
    pub fn is_hub_repo_id(&self) -> bool {
        is_hub_repo_id(&self.model_name)
    }

    pub(crate) fn rebind(&mut self, kind: BackendKind, path: Option<PathBuf>) {
        debug_assert!(!self.rebound, "load request rebound twice");
        self.rebound = true;
        self.backend_kind = kind;
        if path.is_some() {
            self.model_path = path;
        }
    }
}

pub fn is_hub_repo_id(name: &str) -> bool {
    HUB_REPO_ID.is_match(name)
}
