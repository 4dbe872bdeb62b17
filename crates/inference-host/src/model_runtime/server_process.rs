//! A runtime server child process speaking the OpenAI chat API.
//!
//! Every backend ends up here: the loader assembles a `LaunchPlan`, this
//! module spawns it, waits for `/health`, and owns the child until
//! `shutdown` or drop.

use super::prompt_cache::PromptCache;
use super::request::BackendKind;
use super::runtime_trait::{InferenceRequest, InferenceResponse, LaunchPlan, ModelHandle};
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Where runtime servers listen and how long they get to come up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEndpoint {
    pub host: String,
    pub port: u16,
    pub startup_timeout: Duration,
}

impl RuntimeEndpoint {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            host: config.runtime_host.clone(),
            port: config.runtime_port,
            startup_timeout: config.startup_timeout(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

pub struct ServerProcess {
    backend: BackendKind,
    child: Mutex<Option<Child>>,
    http: reqwest::Client,
    base_url: String,
    cache: Mutex<Option<PromptCache>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ServerProcess {
    fn new(backend: BackendKind, child: Option<Child>, base_url: String) -> Self {
        Self {
            backend,
            child: Mutex::new(child),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url,
            cache: Mutex::new(None),
        }
    }

    /// Spawn `plan` and return once the server answers `/health`.
    pub async fn spawn(backend: BackendKind, plan: &LaunchPlan, endpoint: &RuntimeEndpoint) -> HostResult<Arc<Self>> {
        if !plan.binary.exists() {
            return Err(HostError::ModelLoad(format!(
                "{} runtime binary not found at: {}",
                backend,
                plan.binary.display()
            )));
        }

        info!("Starting {} runtime: {}", backend, plan.binary.display());
        debug!("  Args: {}", plan.args.join(" "));

        let child = Command::new(&plan.binary)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| HostError::ModelLoad(format!("Failed to spawn {}: {}", plan.binary.display(), e)))?;

        let server = Arc::new(Self::new(backend, Some(child), endpoint.base_url()));
        info!("{} process started, waiting for health check...", backend);

        // On any failure below, dropping `server` kills the child.
        server.wait_until_ready(endpoint.startup_timeout).await?;
        Ok(server)
    }

    async fn wait_until_ready(&self, timeout: Duration) -> HostResult<()> {
        let started = Instant::now();
        let mut next_report = Duration::from_secs(10);

        loop {
            if let Some(status) = self.exit_status() {
                return Err(HostError::ModelLoad(format!(
                    "{} runtime exited during startup ({})",
                    self.backend, status
                )));
            }
            if self.is_ready().await {
                info!("{} runtime ready after {:.1}s", self.backend, started.elapsed().as_secs_f32());
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(HostError::ModelLoad(format!(
                    "{} runtime failed to start within {} seconds",
                    self.backend,
                    timeout.as_secs()
                )));
            }
            if elapsed >= next_report {
                info!("Still waiting for {} runtime... ({}s)", self.backend, elapsed.as_secs());
                next_report += Duration::from_secs(10);
            }
            sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    fn exit_status(&self) -> Option<std::process::ExitStatus> {
        lock(&self.child).as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    pub fn is_running(&self) -> bool {
        match lock(&self.child).as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    /// Handle for a server this process does not own.
    #[cfg(test)]
    pub(crate) fn detached(backend: BackendKind, base_url: String) -> Self {
        Self::new(backend, None, base_url)
    }
}

#[async_trait]
impl ModelHandle for ServerProcess {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    async fn is_ready(&self) -> bool {
        let health_url = format!("{}/health", self.base_url);
        match self.http.get(&health_url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn generate(&self, request: InferenceRequest) -> HostResult<InferenceResponse> {
        let payload = serde_json::json!({
            "model": "local-llm",
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": false,
        });

        let cache = self.prompt_cache();
        let cache_key = payload.to_string();
        if let Some(hit) = cache.as_ref().and_then(|c| c.get(&cache_key)) {
            debug!("Prompt cache hit ({} bytes)", hit.len());
            return Ok(InferenceResponse {
                content: hit.to_string(),
                finish_reason: Some("stop".to_string()),
            });
        }

        let resp = self
            .http
            .post(self.completions_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| HostError::ModelLoad(format!("Inference request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(HostError::ModelLoad(format!("Inference failed ({}): {}", status, body)));
        }

        let response: serde_json::Value = resp.json().await?;
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let finish_reason = response["choices"][0]["finish_reason"]
            .as_str()
            .map(|s| s.to_string());

        if let Some(cache) = cache {
            cache.insert(cache_key, &content);
        }

        Ok(InferenceResponse { content, finish_reason })
    }

    fn shutdown(&self) -> HostResult<()> {
        if let Some(mut child) = lock(&self.child).take() {
            info!("Shutting down {} runtime (pid {})", self.backend, child.id());
            match child.kill() {
                Ok(_) => {
                    let _ = child.wait();
                }
                Err(e) => warn!("Failed to kill {} process: {}", self.backend, e),
            }
        }
        Ok(())
    }

    fn attach_prompt_cache(&self, cache: PromptCache) -> HostResult<()> {
        info!("Attached {} MB prompt cache to {} runtime", cache.capacity_bytes() / 1024 / 1024, self.backend);
        *lock(&self.cache) = Some(cache);
        Ok(())
    }

    fn prompt_cache(&self) -> Option<PromptCache> {
        lock(&self.cache).clone()
    }
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("backend", &self.backend)
            .field("base_url", &self.base_url)
            .field("pid", &lock(&self.child).as_ref().map(|c| c.id()))
            .finish()
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if let Some(mut child) = lock(&self.child).take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::runtime_trait::ChatMessage;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn chat(text: &str) -> InferenceRequest {
        InferenceRequest {
            messages: vec![ChatMessage { role: "user".into(), content: text.into() }],
            max_tokens: 16,
            temperature: 0.0,
        }
    }

    fn endpoint() -> RuntimeEndpoint {
        RuntimeEndpoint { host: "127.0.0.1".into(), port: 9, startup_timeout: Duration::from_secs(1) }
    }

    const COMPLETION: &str = r#"{"choices":[{"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}]}"#;

    #[tokio::test]
    async fn test_missing_binary_is_load_error() {
        let plan = LaunchPlan {
            binary: PathBuf::from("/no/such/llama-server"),
            args: vec![],
            config: BTreeMap::new(),
        };
        let err = ServerProcess::spawn(BackendKind::LlamaCpp, &plan, &endpoint())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::ModelLoad(msg) if msg.contains("binary not found")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_startup_timeout_kills_child() {
        let Ok(sleep_bin) = which::which("sleep") else { return };
        let plan = LaunchPlan { binary: sleep_bin, args: vec!["30".into()], config: BTreeMap::new() };
        let started = Instant::now();
        let err = ServerProcess::spawn(BackendKind::LlamaCpp, &plan, &endpoint())
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::ModelLoad(msg) if msg.contains("failed to start")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_generate_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(COMPLETION)
            .create_async()
            .await;

        let handle = ServerProcess::detached(BackendKind::LlamaCpp, server.url());
        let resp = handle.generate(chat("hello")).await.unwrap();
        assert_eq!(resp.content, "hi");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_prompt_cache_serves_repeat_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(COMPLETION)
            .expect(1)
            .create_async()
            .await;

        let handle = ServerProcess::detached(BackendKind::LlamaCpp, server.url());
        handle.attach_prompt_cache(PromptCache::new(1 << 20)).unwrap();
        handle.generate(chat("hello")).await.unwrap();
        let again = handle.generate(chat("hello")).await.unwrap();
        assert_eq!(again.content, "hi");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_health_reflects_status() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/health").with_status(503).create_async().await;
        let handle = ServerProcess::detached(BackendKind::Transformers, server.url());
        assert!(!handle.is_ready().await);
        assert!(handle.shutdown().is_ok());
        assert!(handle.shutdown().is_ok());
    }
}
