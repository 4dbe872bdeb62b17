//! Minimal client for a Hugging Face style model hub.
//!
//! Two calls are needed: the repository file tree and a streamed download of
//! a single file. Downloads are skipped when the destination already holds a
//! non-empty file.

use crate::error::{HostError, HostResult};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub const DEFAULT_REVISION: &str = "main";

const PROGRESS_LOG_BYTES: u64 = 256 * 1024 * 1024;

/// One entry of the repository tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HubFile {
    pub path: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(rename = "type", default)]
    pub entry_type: Option<String>,
}

impl HubFile {
    pub fn is_file(&self) -> bool {
        self.entry_type.as_deref().map(|t| t == "file").unwrap_or(true)
    }

    pub fn has_extension(&self, ext: &str) -> bool {
        self.path.to_lowercase().ends_with(&format!(".{}", ext.to_lowercase()))
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Filter `files` to `ext` and order them: preferred quantization tag first,
/// then ascending size. Entries without a size sort last within their group.
pub fn rank_candidates(files: &[HubFile], ext: &str, preferred_tag: &str) -> Vec<HubFile> {
    let preferred = preferred_tag.to_lowercase();
    let mut candidates: Vec<HubFile> = files
        .iter()
        .filter(|f| f.is_file() && f.has_extension(ext))
        .cloned()
        .collect();
    candidates.sort_by_key(|f| {
        let tag_rank = if f.path.to_lowercase().contains(&preferred) { 0u8 } else { 1u8 };
        (tag_rank, f.size.unwrap_or(u64::MAX))
    });
    candidates
}

pub fn select_candidate(files: &[HubFile], ext: &str, preferred_tag: &str) -> Option<HubFile> {
    rank_candidates(files, ext, preferred_tag).into_iter().next()
}

#[derive(Clone)]
pub struct HubClient {
    http: reqwest::Client,
    endpoint: String,
    default_token: Option<String>,
}

impl HubClient {
    pub fn new(endpoint: impl Into<String>, default_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            default_token,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorize(&self, builder: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        match token.or(self.default_token.as_deref()) {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }

    pub fn tree_url(&self, repo: &str, revision: &str) -> String {
        format!("{}/api/models/{}/tree/{}", self.endpoint, repo, revision)
    }

    pub fn file_url(&self, repo: &str, revision: &str, file: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.endpoint, repo, revision, file)
    }

    pub async fn list_files(&self, repo: &str, revision: &str, token: Option<&str>) -> HostResult<Vec<HubFile>> {
        let url = self.tree_url(repo, revision);
        debug!("Listing hub repository: {}", url);

        let resp = self
            .authorize(self.http.get(&url).header("Accept", "application/json"), token)
            .send()
            .await
            .map_err(|e| HostError::ModelDownload(format!("Listing {} failed: {}", repo, e)))?;

        if !resp.status().is_success() {
            return Err(HostError::ModelDownload(format!("HTTP {}: {}", resp.status(), url)));
        }

        resp.json::<Vec<HubFile>>()
            .await
            .map_err(|e| HostError::ModelDownload(format!("Invalid listing for {}: {}", repo, e)))
    }

    /// Stream `file` from `repo` into `dest_dir`. A non-empty file already at
    /// the destination is trusted and returned without any transfer.
    pub async fn download_file(
        &self,
        repo: &str,
        revision: &str,
        file: &str,
        dest_dir: &Path,
        token: Option<&str>,
    ) -> HostResult<PathBuf> {
        let dest = dest_dir.join(file);
        if let Ok(meta) = tokio::fs::metadata(&dest).await {
            if meta.is_file() && meta.len() > 0 {
                info!("Using existing download: {} ({} bytes)", dest.display(), meta.len());
                return Ok(dest);
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = self.file_url(repo, revision, file);
        info!("Downloading {} -> {}", url, dest.display());

        let resp = self
            .authorize(self.http.get(&url), token)
            .send()
            .await
            .map_err(|e| HostError::ModelDownload(format!("Request for {} failed: {}", file, e)))?;

        if !resp.status().is_success() {
            return Err(HostError::ModelDownload(format!("HTTP {}: {}", resp.status(), url)));
        }

        let total = resp.content_length();
        // Stream into a side file so an interrupted transfer never leaves a
        // non-empty file at `dest`.
        let partial = dest_dir.join(format!("{}.part", file));
        let mut out = tokio::fs::File::create(&partial).await?;
        let body = resp.bytes_stream();
        futures_util::pin_mut!(body);
        let mut written: u64 = 0;
        let mut next_report = PROGRESS_LOG_BYTES;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| HostError::ModelDownload(format!("Transfer of {} failed: {}", file, e)))?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if written >= next_report {
                info!("{}: {} MB / {} MB", file, written / 1024 / 1024, total.unwrap_or(0) / 1024 / 1024);
                next_report += PROGRESS_LOG_BYTES;
            }
        }
        out.flush().await?;
        drop(out);
        tokio::fs::rename(&partial, &dest).await?;

        info!("Downloaded {} ({} bytes)", file, written);
        Ok(dest)
    }

    /// Fetch several files with at most `workers` transfers in flight.
    pub async fn download_many(
        &self,
        repo: &str,
        revision: &str,
        files: &[HubFile],
        dest_dir: &Path,
        token: Option<&str>,
        workers: usize,
    ) -> HostResult<Vec<PathBuf>> {
        let transfers: Vec<BoxFuture<'_, HostResult<PathBuf>>> = files
            .iter()
            .map(|f| self.download_file(repo, revision, &f.path, dest_dir, token).boxed())
            .collect();
        stream::iter(transfers)
            .buffer_unordered(workers.max(1))
            .try_collect()
            .await
    }
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("endpoint", &self.endpoint)
            .field("authenticated", &self.default_token.is_some())
            .finish()
    }
}
