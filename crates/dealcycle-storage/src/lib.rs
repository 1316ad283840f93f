//! Retry/backoff, local JSON state files, and the remote document
//! synchronizer used to persist progress and the website product feed.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const CRATE_NAME: &str = "dealcycle-storage";

/// How a failed call should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    /// Provider asked for a pause; `retry_after` carries its hint when one
    /// was supplied.
    RateLimited { retry_after: Option<Duration> },
    Fatal,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Shared bounded-retry loop. `classify` decides whether an error is worth
/// another attempt; rate-limit errors wait the provider's hinted delay (or
/// the policy cap) instead of the exponential step. After `max_retries`
/// additional attempts the last error is returned to the caller, which must
/// not assume the operation happened.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &BackoffPolicy,
    classify: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryClass,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(err);
                }
                let wait = match classify(&err) {
                    RetryClass::Fatal => return Err(err),
                    RetryClass::Retryable => policy.delay_for_attempt(attempt),
                    RetryClass::RateLimited { retry_after } => retry_after
                        .unwrap_or(policy.max_delay)
                        .max(policy.delay_for_attempt(attempt)),
                };
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

pub fn classify_status(status: StatusCode) -> RetryClass {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryClass::RateLimited { retry_after: None }
    } else if status.is_server_error() {
        RetryClass::Retryable
    } else {
        RetryClass::Fatal
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryClass::Retryable
    } else {
        RetryClass::Fatal
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Named JSON documents in a local data directory, written atomically via a
/// temp file and rename so a crashed run never leaves a half-written file.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    root: PathBuf,
}

impl LocalStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Read and parse a document; a missing file is `None`, not an error.
    pub async fn read_json<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        let path = self.path_of(name);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    pub async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {name}"))?;
        self.write_bytes(name, &bytes).await
    }

    pub async fn write_bytes(&self, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.path_of(name);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating state directory {}", parent.display()))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let temp_path = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        fs::rename(&temp_path, &path).await.with_context(|| {
            format!(
                "renaming temp state file {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    }
}

#[derive(Debug, Error)]
pub enum RemoteDocError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("stale revision token writing {path}")]
    Conflict { path: String },
    #[error("malformed contents payload for {path}: {reason}")]
    Payload { path: String, reason: String },
}

/// Conflicts are retryable here only because every commit attempt re-reads
/// the revision token first; a blind replay of the same token could never
/// succeed. Payload errors are data-shape problems and never retried.
pub fn classify_remote_error(err: &RemoteDocError) -> RetryClass {
    match err {
        RemoteDocError::Request(e) => classify_reqwest_error(e),
        RemoteDocError::HttpStatus { status, .. } => {
            classify_status(StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY))
        }
        RemoteDocError::Conflict { .. } => RetryClass::Retryable,
        RemoteDocError::Payload { .. } => RetryClass::Fatal,
    }
}

/// A fetched remote file plus the opaque revision token guarding writes.
#[derive(Debug, Clone)]
pub struct RemoteDocument {
    pub content: Vec<u8>,
    pub revision: String,
}

/// Coordinates of the remote version-controlled repository holding the
/// progress and product-feed documents.
#[derive(Debug, Clone)]
pub struct RemoteRepoConfig {
    pub api_base: String,
    /// `owner/name`
    pub repo: String,
    pub branch: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: String,
    sha: String,
}

/// Read-current-version / encode / conditionally-write primitive against a
/// repository contents API. Writes carry the revision token captured
/// immediately beforehand so a concurrent writer makes the PUT fail instead
/// of being clobbered.
#[derive(Debug)]
pub struct RemoteDocStore {
    client: reqwest::Client,
    config: RemoteRepoConfig,
    backoff: BackoffPolicy,
}

impl RemoteDocStore {
    pub fn new(config: RemoteRepoConfig, backoff: BackoffPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building remote repository client")?;
        Ok(Self {
            client,
            config,
            backoff,
        })
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.config.api_base, self.config.repo, path
        )
    }

    fn auth_header(&self) -> String {
        format!("token {}", self.config.token)
    }

    /// Fetch a document; 404 means "absent", not an error.
    pub async fn fetch(&self, path: &str) -> Result<Option<RemoteDocument>, RemoteDocError> {
        retry_with_backoff(&self.backoff, classify_remote_error, || {
            self.fetch_once(path)
        })
        .await
    }

    async fn fetch_once(&self, path: &str) -> Result<Option<RemoteDocument>, RemoteDocError> {
        let url = self.contents_url(path);
        let response = self
            .client
            .get(&url)
            .query(&[("ref", self.config.branch.as_str())])
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RemoteDocError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body: ContentsResponse =
            response.json().await.map_err(RemoteDocError::Request)?;
        let content = decode_base64_content(&body.content).map_err(|err| {
            RemoteDocError::Payload {
                path: path.to_string(),
                reason: err.to_string(),
            }
        })?;
        Ok(Some(RemoteDocument {
            content,
            revision: body.sha,
        }))
    }

    /// Commit `content` to `path`. The current revision token is re-read on
    /// every attempt; an absent file commits without one (create).
    pub async fn commit(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<(), RemoteDocError> {
        retry_with_backoff(&self.backoff, classify_remote_error, || {
            self.commit_once(path, content, message)
        })
        .await
    }

    async fn commit_once(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<(), RemoteDocError> {
        let existing = self.fetch_once(path).await?;

        let mut body = serde_json::json!({
            "message": message,
            "content": STANDARD.encode(content),
            "branch": self.config.branch,
        });
        if let Some(doc) = &existing {
            body["sha"] = serde_json::Value::String(doc.revision.clone());
        }

        let url = self.contents_url(path);
        let response = self
            .client
            .put(&url)
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(RemoteDocError::Conflict {
                    path: path.to_string(),
                })
            }
            status => Err(RemoteDocError::HttpStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }

    /// Commit only when the remote content actually differs; re-running an
    /// identical session produces no empty commits.
    pub async fn commit_if_changed(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> Result<bool, RemoteDocError> {
        if let Some(doc) = self.fetch(path).await? {
            if sha256_hex(&doc.content) == sha256_hex(content) {
                debug!(path, "remote document unchanged, skipping commit");
                return Ok(false);
            }
        }
        self.commit(path, content, message).await?;
        Ok(true)
    }
}

/// The contents API wraps base64 payloads with newlines; strip whitespace
/// before decoding.
pub fn decode_base64_content(raw: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let cleaned: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(cleaned.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryClass::RateLimited { retry_after: None }
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryClass::Retryable
        );
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryClass::Fatal);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryClass::Fatal);
    }

    #[derive(Debug)]
    struct FakeError(RetryClass);

    fn tiny_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, FakeError> =
            retry_with_backoff(&tiny_policy(), |e: &FakeError| e.0, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FakeError(RetryClass::Retryable))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_immediately_on_fatal() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, FakeError> =
            retry_with_backoff(&tiny_policy(), |e: &FakeError| e.0, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError(RetryClass::Fatal))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_gives_up_after_the_bound() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, FakeError> =
            retry_with_backoff(&tiny_policy(), |e: &FakeError| e.0, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FakeError(RetryClass::Retryable))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_honors_rate_limit_hint() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, FakeError> =
            retry_with_backoff(&tiny_policy(), |e: &FakeError| e.0, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FakeError(RetryClass::RateLimited {
                        retry_after: Some(Duration::from_millis(5)),
                    }))
                } else {
                    Ok(1)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn conflict_is_retryable_payload_is_not() {
        assert_eq!(
            classify_remote_error(&RemoteDocError::Conflict { path: "p".into() }),
            RetryClass::Retryable
        );
        assert_eq!(
            classify_remote_error(&RemoteDocError::Payload {
                path: "p".into(),
                reason: "bad".into()
            }),
            RetryClass::Fatal
        );
    }

    #[test]
    fn base64_content_with_newlines_decodes() {
        let encoded = "eyJjdXJyZW50X2lu\nZGV4IjogN30=\n";
        let decoded = decode_base64_content(encoded).unwrap();
        assert_eq!(decoded, br#"{"current_index": 7}"#);
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Doc {
        value: u32,
    }

    #[tokio::test]
    async fn local_store_roundtrips_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStateStore::new(dir.path());

        assert!(store.read_json::<Doc>("state.json").await.unwrap().is_none());

        store.write_json("state.json", &Doc { value: 1 }).await.unwrap();
        store.write_json("state.json", &Doc { value: 2 }).await.unwrap();

        let read: Doc = store.read_json("state.json").await.unwrap().unwrap();
        assert_eq!(read, Doc { value: 2 });

        // no temp files left behind
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["state.json"]);
    }

    #[tokio::test]
    async fn local_store_creates_nested_directories() {
        let dir = tempdir().expect("tempdir");
        let store = LocalStateStore::new(dir.path().join("data"));
        store.write_json("progress.json", &Doc { value: 9 }).await.unwrap();
        let read: Doc = store.read_json("progress.json").await.unwrap().unwrap();
        assert_eq!(read.value, 9);
    }
}
