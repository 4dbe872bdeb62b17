use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root for `models/<logical name>` artifacts.
    pub models_dir: PathBuf,
    /// Root of the local hub-native store (`manifests/` + `blobs/`).
    pub hub_native_dir: PathBuf,
    pub hf_endpoint: String,
    pub hf_token: Option<String>,
    pub llama_bin: Option<PathBuf>,
    pub transformers_bin: Option<PathBuf>,
    pub trtllm_bin: Option<PathBuf>,
    pub runtime_host: String,
    pub runtime_port: u16,
    pub startup_timeout_seconds: u64,
    pub preferred_quant: String,
    pub download_workers: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            hub_native_dir: default_hub_native_dir(),
            hf_endpoint: DEFAULT_HF_ENDPOINT.to_string(),
            hf_token: None,
            llama_bin: None,
            transformers_bin: None,
            trtllm_bin: None,
            runtime_host: "127.0.0.1".to_string(),
            runtime_port: 8081,
            startup_timeout_seconds: 120,
            preferred_quant: "q4_k_m".to_string(),
            download_workers: 4,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        Ok(Self {
            models_dir: env::var("MODELS_DIR").map(PathBuf::from).unwrap_or(defaults.models_dir),
            hub_native_dir: env::var("OLLAMA_MODELS")
                .map(PathBuf::from)
                .unwrap_or(defaults.hub_native_dir),
            hf_endpoint: env::var("HF_ENDPOINT").unwrap_or(defaults.hf_endpoint),
            hf_token: env::var("HF_TOKEN").ok().filter(|t| !t.is_empty()),
            llama_bin: Self::runtime_binary("LLAMA_BIN", "llama-server"),
            transformers_bin: Self::runtime_binary("TRANSFORMERS_BIN", "text-generation-launcher"),
            trtllm_bin: Self::runtime_binary("TRTLLM_BIN", "trtllm-serve"),
            runtime_host: env::var("RUNTIME_HOST").unwrap_or(defaults.runtime_host),
            runtime_port: env::var("RUNTIME_PORT")
                .unwrap_or_else(|_| "8081".into())
                .parse()
                .context("RUNTIME_PORT must be a port number")?,
            startup_timeout_seconds: env::var("STARTUP_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "120".into())
                .parse()
                .context("STARTUP_TIMEOUT_SECONDS must be an integer")?,
            preferred_quant: env::var("PREFERRED_QUANT").unwrap_or(defaults.preferred_quant),
            download_workers: env::var("DOWNLOAD_WORKERS")
                .unwrap_or_else(|_| "4".into())
                .parse::<usize>()
                .context("DOWNLOAD_WORKERS must be an integer")?
                .max(1),
        })
    }

    /// Explicit env path first, then a `PATH` lookup.
    fn runtime_binary(var: &str, name: &str) -> Option<PathBuf> {
        if let Ok(path) = env::var(var) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            warn!("{} set but binary doesn't exist: {}", var, path.display());
        }
        which::which(name).ok()
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn runtime_base_url(&self) -> String {
        format!("http://{}:{}", self.runtime_host, self.runtime_port)
    }

    pub fn print_config(&self) {
        info!("Configuration:");
        info!("  Models dir: {}", self.models_dir.display());
        info!("  Hub-native store: {}", self.hub_native_dir.display());
        info!("  Hub endpoint: {} (token: {})", self.hf_endpoint, self.hf_token.is_some());
        info!("  llama.cpp binary: {}", display_bin(&self.llama_bin));
        info!("  Transformers binary: {}", display_bin(&self.transformers_bin));
        info!("  TensorRT-LLM binary: {}", display_bin(&self.trtllm_bin));
        info!("  Runtime server: {}", self.runtime_base_url());
        info!("  Startup timeout: {}s", self.startup_timeout_seconds);
        info!("  Preferred quantization: {}", self.preferred_quant);
        info!("  Download workers: {}", self.download_workers);
    }
}

fn display_bin(bin: &Option<PathBuf>) -> String {
    bin.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "not found".to_string())
}

fn default_hub_native_dir() -> PathBuf {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".ollama").join("models"))
        .unwrap_or_else(|| PathBuf::from(".ollama/models"))
}

/// Thread count used when a request leaves `n_threads` unset.
pub fn default_threads() -> u32 {
    num_cpus::get().max(1) as u32
}

pub fn default_batch_threads() -> u32 {
    default_threads().min(8)
}
