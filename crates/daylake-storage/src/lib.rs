//! Raw payload staging, content fingerprinting and rate-limited HTTP fetch for daylake.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use daylake_core::{date_partition_dir, ContentFingerprint, STAGED_FILE_NAME};
use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "daylake-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Compact JSON with object keys sorted recursively, so key order and
/// formatting never affect the fingerprint.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn fingerprint(payload: &JsonValue) -> ContentFingerprint {
    ContentFingerprint::from_hex(sha256_hex(canonical_json(payload).as_bytes()))
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("serializing payload for {date}: {source}")]
    Serialize {
        date: NaiveDate,
        #[source]
        source: serde_json::Error,
    },
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Date-partitioned raw staging directory (`year=Y/month=M/day=D/file.json`).
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staged_path(&self, date: NaiveDate) -> PathBuf {
        date_partition_dir(&self.root, date).join(STAGED_FILE_NAME)
    }

    /// Write the payload as JSON through a temp file renamed over `file.json`,
    /// replacing any previously staged payload for the date.
    pub async fn stage_json(
        &self,
        date: NaiveDate,
        payload: &JsonValue,
    ) -> Result<PathBuf, StageError> {
        let bytes =
            serde_json::to_vec(payload).map_err(|source| StageError::Serialize { date, source })?;
        let target = self.staged_path(date);
        let dir = date_partition_dir(&self.root, date);

        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StageError::io("creating staging directory", &dir, err))?;

        let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = write_new_file(&temp_path, &bytes).await;
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StageError::io("renaming staged file into", &target, err));
        }
        Ok(target)
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> Result<(), StageError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(|err| StageError::io("opening temp file", path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| StageError::io("writing temp file", path, err))?;
    file.flush()
        .await
        .map_err(|err| StageError::io("flushing temp file", path, err))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only rate-limit responses are retried. Every other failure status is terminal.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per fetch, including the first.
    pub retries: u32,
    pub delay: Duration,
    pub backoff: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_secs(3),
            backoff: 3,
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the sleep after the `attempt`-th (0-based) rate-limited response.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff.checked_pow(attempt).unwrap_or(u32::MAX);
        self.delay.saturating_mul(factor)
    }

    /// Deterministic delay plus uniform jitter in `[0, delay)`.
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        base.saturating_add(jitter_below(base))
    }
}

fn jitter_below(ceiling: Duration) -> Duration {
    let fraction: f64 = rand::thread_rng().gen();
    Duration::try_from_secs_f64(ceiling.as_secs_f64() * fraction).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("max retries reached for URL: {url} ({attempts} attempts)")]
    MaxRetriesExceeded { url: String, attempts: u32 },
}

/// Anything that can turn a request URL into a JSON payload.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn fetch_json(&self, url: &str) -> Result<JsonValue, FetchError>;
}

/// GET with transparent backoff on HTTP 429. Backoff state lives in each call,
/// so one fetcher serves any number of concurrent callers.
#[derive(Debug, Clone)]
pub struct RateLimitedFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl RateLimitedFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn fetch_with_backoff(&self, url: &str) -> Result<JsonValue, FetchError> {
        for attempt in 0..self.retry.retries {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| FetchError::Transport {
                    url: url.to_string(),
                    source,
                })?;
            let status = response.status();

            if status.is_success() {
                let body = response
                    .bytes()
                    .await
                    .map_err(|source| FetchError::Transport {
                        url: url.to_string(),
                        source,
                    })?;
                debug!(attempt = attempt + 1, bytes = body.len(), "fetched payload");
                return serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                    url: url.to_string(),
                    source,
                });
            }

            match classify_status(status) {
                RetryDisposition::Retryable => {
                    if attempt + 1 == self.retry.retries {
                        break;
                    }
                    let wait = self.retry.jittered_delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        retries = self.retry.retries,
                        delay_ms = wait.as_millis() as u64,
                        "HTTP 429 received; backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                RetryDisposition::NonRetryable => {
                    error!(status = status.as_u16(), "terminal HTTP status");
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
            }
        }

        Err(FetchError::MaxRetriesExceeded {
            url: url.to_string(),
            attempts: self.retry.retries,
        })
    }
}

#[async_trait]
impl PayloadSource for RateLimitedFetcher {
    async fn fetch_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let started = Instant::now();
        let span = info_span!("http_fetch", url);
        let result = self.fetch_with_backoff(url).instrument(span).await;
        debug!(
            url,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "fetch finished"
        );
        result
    }
}
