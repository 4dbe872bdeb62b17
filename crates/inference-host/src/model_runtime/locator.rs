//! Model locator: logical name → artifact path, backend detection, and the
//! hub-native manifest bridge.

use super::format_detector::{FormatDetector, HUB_MANIFEST_TAG};
use super::hub_client::{select_candidate, HubClient, HubFile, DEFAULT_REVISION};
use super::request::{BackendKind, LoadRequest};
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Media type of the weights layer in a hub-native manifest.
pub const MODEL_LAYER_MEDIA_TYPE: &str = "application/vnd.ollama.image.model";

const HUB_NATIVE_REGISTRY: &str = "registry.ollama.ai";
const HUB_NATIVE_NAMESPACE: &str = "library";

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    layers: Vec<ManifestLayer>,
}

#[derive(Debug, Deserialize)]
struct ManifestLayer {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
}

#[derive(Debug, Clone)]
pub struct ModelLocator {
    models_dir: PathBuf,
    hub_native_root: PathBuf,
    hub: HubClient,
}

impl ModelLocator {
    pub fn new(models_dir: impl Into<PathBuf>, hub_native_root: impl Into<PathBuf>, hub: HubClient) -> Self {
        Self {
            models_dir: models_dir.into(),
            hub_native_root: hub_native_root.into(),
            hub,
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(
            &config.models_dir,
            &config.hub_native_dir,
            HubClient::new(&config.hf_endpoint, config.hf_token.clone()),
        )
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn hub(&self) -> &HubClient {
        &self.hub
    }

    pub fn model_path(&self, request: &LoadRequest) -> PathBuf {
        request.artifact_path(&self.models_dir)
    }

    /// Resolve a hub-native request to the blob holding its weights.
    ///
    /// With an explicit path the manifest is `<path>/latest` (or `<path>`
    /// itself when it is a file). Otherwise `name[:tag]` is looked up under
    /// the local hub-native store.
    pub fn resolve_hub_native(&self, request: &LoadRequest) -> HostResult<PathBuf> {
        let manifest_path = match &request.model_path {
            Some(path) if path.is_file() => path.clone(),
            Some(path) => path.join(HUB_MANIFEST_TAG),
            None => {
                let (name, tag) = request
                    .model_name
                    .split_once(':')
                    .unwrap_or((request.model_name.as_str(), HUB_MANIFEST_TAG));
                self.hub_native_root
                    .join("manifests")
                    .join(HUB_NATIVE_REGISTRY)
                    .join(HUB_NATIVE_NAMESPACE)
                    .join(name)
                    .join(tag)
            }
        };
        resolve_manifest_blob(&manifest_path)
    }

    /// Remote fetches for `owner/name` land in `<models_dir>/owner/name`.
    pub fn download_dir(&self, request: &LoadRequest) -> PathBuf {
        self.models_dir.join(&request.model_name)
    }

    pub async fn list_repository(&self, request: &LoadRequest) -> HostResult<Vec<HubFile>> {
        let revision = request.options.revision.as_deref().unwrap_or(DEFAULT_REVISION);
        self.hub
            .list_files(&request.model_name, revision, request.options.hf_token.as_deref())
            .await
    }

    /// Download the best `.ext` file of the request's repository.
    pub async fn fetch_best_candidate(
        &self,
        request: &LoadRequest,
        ext: &str,
        preferred_tag: &str,
    ) -> HostResult<PathBuf> {
        let files = self.list_repository(request).await?;
        let candidate = select_candidate(&files, ext, preferred_tag).ok_or_else(|| {
            HostError::ModelDownload(format!("No .{} files found in repository {}", ext, request.model_name))
        })?;
        info!(
            "Selected {} ({} bytes) from {}",
            candidate.path,
            candidate.size.unwrap_or(0),
            request.model_name
        );
        let revision = request.options.revision.as_deref().unwrap_or(DEFAULT_REVISION);
        self.hub
            .download_file(
                &request.model_name,
                revision,
                &candidate.path,
                &self.download_dir(request),
                request.options.hf_token.as_deref(),
            )
            .await
    }

    /// Download a set of files into the request's download directory.
    pub async fn fetch_files(&self, request: &LoadRequest, files: &[HubFile], workers: usize) -> HostResult<PathBuf> {
        let dest = self.download_dir(request);
        let revision = request.options.revision.as_deref().unwrap_or(DEFAULT_REVISION);
        info!("Fetching {} files from {} with {} workers", files.len(), request.model_name, workers);
        self.hub
            .download_many(
                &request.model_name,
                revision,
                files,
                &dest,
                request.options.hf_token.as_deref(),
                workers,
            )
            .await?;
        Ok(dest)
    }

    /// Rewrite a hub-native request to the llama.cpp runtime and its blob.
    pub fn bridge_hub_native(&self, request: &mut LoadRequest) -> HostResult<()> {
        let blob = self.resolve_hub_native(request)?;
        info!("Hub-native model {} resolved to blob {}", request.model_name, blob.display());
        request.rebind(BackendKind::LlamaCpp, Some(blob));
        Ok(())
    }

    /// Replace `auto` with the detected backend. A detected hub-native
    /// layout is bridged in the same step.
    pub async fn bind_detected_backend(&self, request: &mut LoadRequest) -> HostResult<()> {
        match self.detect_backend(request).await? {
            BackendKind::HubNative => {
                let path = self.model_path(request);
                let manifest = if path.is_file() { path } else { path.join(HUB_MANIFEST_TAG) };
                let blob = resolve_manifest_blob(&manifest)?;
                info!("Auto-detected hub-native layout, using blob {}", blob.display());
                request.rebind(BackendKind::LlamaCpp, Some(blob));
            }
            kind => {
                info!("Auto-detected backend {} for {}", kind, request.model_name);
                request.rebind(kind, None);
            }
        }
        Ok(())
    }

    /// Detect the backend for an `auto` request. Local artifacts are
    /// inspected on disk; hub ids without a local copy are classified from
    /// the repository listing.
    pub async fn detect_backend(&self, request: &LoadRequest) -> HostResult<BackendKind> {
        let path = self.model_path(request);
        if path.exists() {
            return FormatDetector::detect_backend(&path).ok_or_else(|| {
                HostError::ModelNotFound(format!("Could not detect model type: {}", path.display()))
            });
        }
        if request.is_hub_repo_id() {
            return self.detect_remote_backend(request).await;
        }
        Err(HostError::ModelNotFound(format!(
            "Could not detect model type: {}",
            request.model_name
        )))
    }

    async fn detect_remote_backend(&self, request: &LoadRequest) -> HostResult<BackendKind> {
        let files = self.list_repository(request).await?;
        classify_listing(&files).ok_or_else(|| {
            HostError::ModelNotFound(format!(
                "No loadable artifact in repository {}",
                request.model_name
            ))
        })
    }
}

/// Backend implied by a repository listing.
pub fn classify_listing(files: &[HubFile]) -> Option<BackendKind> {
    let has = |ext: &str| files.iter().any(|f| f.is_file() && f.has_extension(ext));
    let kind = if has("gguf") {
        Some(BackendKind::LlamaCpp)
    } else if has("engine") {
        Some(BackendKind::TensorRtLlm)
    } else if files.iter().any(|f| f.path == "config.json") && (has("safetensors") || has("bin")) {
        Some(BackendKind::Transformers)
    } else {
        None
    };
    debug!("Listing of {} files classified as {:?}", files.len(), kind);
    kind
}

/// Read a hub-native manifest and return the path of its model blob.
pub fn resolve_manifest_blob(manifest_path: &Path) -> HostResult<PathBuf> {
    info!("Looking for manifest at: {}", manifest_path.display());
    let bytes = match fs::read(manifest_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(HostError::ManifestNotFound(manifest_path.display().to_string()));
        }
        Err(e) => {
            return Err(HostError::ModelLoad(format!(
                "Unreadable manifest {}: {}",
                manifest_path.display(),
                e
            )));
        }
    };

    let manifest: Manifest = serde_json::from_slice(&bytes)
        .map_err(|e| HostError::ModelLoad(format!("Invalid manifest {}: {}", manifest_path.display(), e)))?;

    let layer = manifest
        .layers
        .iter()
        .find(|l| l.media_type == MODEL_LAYER_MEDIA_TYPE)
        .ok_or_else(|| HostError::ManifestLayerMissing(manifest_path.display().to_string()))?;

    let (algorithm, hash) = layer
        .digest
        .split_once(':')
        .ok_or_else(|| HostError::ModelLoad(format!("Malformed layer digest: {}", layer.digest)))?;

    let blob_path = blob_store_for(manifest_path).join(format!("{}-{}", algorithm, hash));
    info!("Looking for blob at: {}", blob_path.display());
    if !blob_path.is_file() {
        return Err(HostError::BlobNotFound(blob_path.display().to_string()));
    }
    Ok(blob_path)
}

/// `blobs` sits next to the `manifests` directory the manifest lives under.
/// Outside that layout, fall back to five levels above the tag file.
fn blob_store_for(manifest_path: &Path) -> PathBuf {
    if let Some(manifests) = manifest_path
        .ancestors()
        .find(|a| a.file_name().map(|n| n == "manifests").unwrap_or(false))
    {
        if let Some(root) = manifests.parent() {
            return root.join("blobs");
        }
    }
    manifest_path
        .ancestors()
        .nth(5)
        .unwrap_or_else(|| Path::new("."))
        .join("blobs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const TWO_LAYER_MANIFEST: &str = r#"{"layers":[
        {"mediaType":"app/other","digest":"sha256:aa"},
        {"mediaType":"application/vnd.ollama.image.model","digest":"sha256:bb"}
    ]}"#;

    fn hub_native_store(root: &Path, manifest: &str) -> PathBuf {
        let model_dir = root.join("manifests/registry.ollama.ai/library/llama3");
        fs::create_dir_all(&model_dir).unwrap();
        fs::write(model_dir.join("latest"), manifest).unwrap();
        fs::create_dir_all(root.join("blobs")).unwrap();
        fs::write(root.join("blobs/sha256-aa"), b"other").unwrap();
        fs::write(root.join("blobs/sha256-bb"), b"GGUF").unwrap();
        model_dir
    }

    fn locator(root: &Path) -> ModelLocator {
        ModelLocator::new(root.join("models"), root, HubClient::new("http://127.0.0.1:9", None))
    }

    #[test]
    fn test_manifest_resolves_model_layer_blob() {
        let root = tempdir().unwrap();
        let model_dir = hub_native_store(root.path(), TWO_LAYER_MANIFEST);
        let blob = resolve_manifest_blob(&model_dir.join("latest")).unwrap();
        assert!(blob.ends_with("blobs/sha256-bb"));
    }

    #[test]
    fn test_explicit_dir_uses_latest_tag() {
        let root = tempdir().unwrap();
        let model_dir = hub_native_store(root.path(), TWO_LAYER_MANIFEST);
        let req = LoadRequest::new("llama3").with_backend(BackendKind::HubNative).with_path(&model_dir);
        let blob = locator(root.path()).resolve_hub_native(&req).unwrap();
        assert!(blob.ends_with("blobs/sha256-bb"));
    }

    #[test]
    fn test_name_lookup_under_store_root() {
        let root = tempdir().unwrap();
        hub_native_store(root.path(), TWO_LAYER_MANIFEST);
        let req = LoadRequest::new("llama3").with_backend(BackendKind::HubNative);
        let blob = locator(root.path()).resolve_hub_native(&req).unwrap();
        assert!(blob.ends_with("blobs/sha256-bb"));
    }

    #[test]
    fn test_missing_manifest() {
        let root = tempdir().unwrap();
        let err = resolve_manifest_blob(&root.path().join("nope/latest")).unwrap_err();
        assert!(matches!(err, HostError::ManifestNotFound(_)));
    }

    #[test]
    fn test_unreadable_manifest_is_a_load_error() {
        let root = tempdir().unwrap();
        let tag = root.path().join("manifests/registry.ollama.ai/library/llama3/latest");
        fs::create_dir_all(&tag).unwrap();
        let err = resolve_manifest_blob(&tag).unwrap_err();
        assert!(matches!(&err, HostError::ModelLoad(msg) if msg.contains("Unreadable manifest")));
    }

    #[test]
    fn test_manifest_without_model_layer() {
        let root = tempdir().unwrap();
        let model_dir = hub_native_store(root.path(), r#"{"layers":[{"mediaType":"app/other","digest":"sha256:aa"}]}"#);
        let err = resolve_manifest_blob(&model_dir.join("latest")).unwrap_err();
        assert!(matches!(err, HostError::ManifestLayerMissing(_)));
    }

    #[test]
    fn test_missing_blob() {
        let root = tempdir().unwrap();
        let model_dir = hub_native_store(
            root.path(),
            r#"{"layers":[{"mediaType":"application/vnd.ollama.image.model","digest":"sha256:cc"}]}"#,
        );
        let err = resolve_manifest_blob(&model_dir.join("latest")).unwrap_err();
        assert!(matches!(err, HostError::BlobNotFound(p) if p.ends_with("sha256-cc")));
    }

    #[test]
    fn test_classify_listing() {
        let f = |p: &str| HubFile { path: p.to_string(), size: Some(1), entry_type: None };
        assert_eq!(classify_listing(&[f("a.Q4_K_M.gguf")]), Some(BackendKind::LlamaCpp));
        assert_eq!(
            classify_listing(&[f("config.json"), f("model.safetensors")]),
            Some(BackendKind::Transformers)
        );
        assert_eq!(classify_listing(&[f("README.md")]), None);
    }

    #[tokio::test]
    async fn test_auto_detected_manifest_is_bridged_once() {
        let root = tempdir().unwrap();
        let model_dir = hub_native_store(root.path(), TWO_LAYER_MANIFEST);
        let mut req = LoadRequest::new("llama3").with_path(&model_dir);
        locator(root.path()).bind_detected_backend(&mut req).await.unwrap();
        assert_eq!(req.backend_kind, BackendKind::LlamaCpp);
        assert!(req.model_path.unwrap().ends_with("blobs/sha256-bb"));
    }

    #[test]
    fn test_bridge_rewrites_kind_and_path() {
        let root = tempdir().unwrap();
        hub_native_store(root.path(), TWO_LAYER_MANIFEST);
        let mut req = LoadRequest::new("llama3").with_backend(BackendKind::HubNative);
        locator(root.path()).bridge_hub_native(&mut req).unwrap();
        assert_eq!(req.backend_kind, BackendKind::LlamaCpp);
        assert!(req.model_path.unwrap().ends_with("blobs/sha256-bb"));
    }

    #[tokio::test]
    async fn test_undetectable_local_artifact_is_not_found() {
        let root = tempdir().unwrap();
        let dir = root.path().join("models/plain");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("notes.txt"), b"x").unwrap();
        let req = LoadRequest::new("plain");
        let err = locator(root.path()).detect_backend(&req).await.unwrap_err();
        assert!(matches!(err, HostError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_non_hub_name_is_not_found() {
        let root = tempdir().unwrap();
        let err = locator(root.path()).detect_backend(&LoadRequest::new("ghost")).await.unwrap_err();
        assert!(matches!(err, HostError::ModelNotFound(_)));
    }
}
