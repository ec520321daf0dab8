//! Extraction pipeline orchestration: configuration, metadata store, per-date
//! processing, batch fan-out and Parquet conversion.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use daylake_core::{resolve_last_n_days, template_has_single_placeholder, BatchResult};
use daylake_storage::{
    HttpClientConfig, PayloadSource, RateLimitedFetcher, RetryPolicy, StagingArea,
};
use serde::Serialize;
use tokio::fs;
use tracing::info;

pub mod extract;
pub mod metadata;
pub mod transform;

pub use extract::{reconcile, record_change, BatchExtractor, DateUnitProcessor};
pub use metadata::{
    MemoryMetadataStore, MetadataStore, MetadataTransaction, PgMetadataStore, StoreError,
};
pub use transform::{convert_file, transform_to_parquet, TransformError, TransformSummary};

pub const CRATE_NAME: &str = "daylake-sync";

pub const DEFAULT_API_URL_TEMPLATE: &str =
    "https://api.coingecko.com/api/v3/coins/bitcoin/history?date={}";

#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            host: var("HOST_METADATA_DB").unwrap_or_else(|| "localhost".to_string()),
            port: parsed(&var, "PORT_METADATA_DB", 5432),
            user: var("USER_METADATA_DB").unwrap_or_else(|| "postgres".to_string()),
            password: var("PASSWORD_METADATA_DB").unwrap_or_default(),
            name: var("METADATA_DB").unwrap_or_else(|| "metadata_db".to_string()),
            min_connections: 7,
            max_connections: 14,
            connect_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub database: DatabaseConfig,
    pub raw_data_dir: PathBuf,
    pub processed_data_dir: PathBuf,
    pub api_url_template: String,
    pub max_concurrent_requests: usize,
    pub http: HttpClientConfig,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl ExtractConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = RetryPolicy::default();
        Self {
            database: DatabaseConfig::from_vars(&var),
            raw_data_dir: var("RAW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/raw")),
            processed_data_dir: var("PROCESSED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/processed")),
            api_url_template: var("API_URL_TEMPLATE")
                .unwrap_or_else(|| DEFAULT_API_URL_TEMPLATE.to_string()),
            max_concurrent_requests: parsed(&var, "MAX_CONCURRENT_REQUESTS", 5),
            http: HttpClientConfig {
                timeout: Duration::from_secs(parsed(&var, "HTTP_TIMEOUT_SECS", 30)),
                user_agent: Some(
                    var("DAYLAKE_USER_AGENT").unwrap_or_else(|| "daylake/0.1".to_string()),
                ),
                retry: RetryPolicy {
                    retries: parsed(&var, "HTTP_RETRIES", defaults.retries),
                    delay: Duration::from_secs(parsed(
                        &var,
                        "HTTP_RETRY_DELAY_SECS",
                        defaults.delay.as_secs(),
                    )),
                    backoff: parsed(&var, "HTTP_RETRY_BACKOFF", defaults.backoff),
                },
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !template_has_single_placeholder(&self.api_url_template) {
            bail!(
                "API URL template must contain exactly one {{}} placeholder: {}",
                self.api_url_template
            );
        }
        if self.max_concurrent_requests == 0 {
            bail!("max_concurrent_requests must be at least 1");
        }
        if self.http.retry.retries == 0 {
            bail!("retries must be at least 1");
        }
        if self.http.retry.backoff == 0 {
            bail!("backoff multiplier must be at least 1");
        }
        Ok(())
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub requested_dates: usize,
    pub staged: BatchResult,
    pub converted: usize,
    pub conversion_failures: usize,
}

/// Extract-then-convert over one date range, sharing one fetcher and staging area.
pub struct ExtractPipeline {
    config: ExtractConfig,
    extractor: BatchExtractor,
}

impl ExtractPipeline {
    pub fn new(config: ExtractConfig) -> Result<Self> {
        config.validate()?;
        let fetcher = RateLimitedFetcher::new(config.http.clone())?;
        Ok(Self::with_source(config, Arc::new(fetcher)))
    }

    pub fn with_source(config: ExtractConfig, source: Arc<dyn PayloadSource>) -> Self {
        let extractor = BatchExtractor::new(
            source,
            StagingArea::new(config.raw_data_dir.clone()),
            config.max_concurrent_requests,
        );
        Self { config, extractor }
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.config
    }

    /// Never fails: date-level faults only shrink the staged set. The store
    /// stays open; the caller that connected it closes it.
    pub async fn run(
        &self,
        store: Arc<dyn MetadataStore>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> RunSummary {
        let requested_dates = daylake_core::date_range(start, end).len();
        let staged = self
            .extractor
            .extract(store, &self.config.api_url_template, start, end)
            .await;
        let transformed = transform_to_parquet(&staged, &self.config.processed_data_dir).await;

        RunSummary {
            start,
            end,
            requested_dates,
            converted: transformed.converted.len(),
            conversion_failures: transformed.failed.len(),
            staged,
        }
    }
}

/// Full daily run for the last `days` days ending yesterday (local time).
///
/// Only setup problems fail the run: bad configuration, unwritable data
/// directories or an unreachable metadata database.
pub async fn run_once_from_env(days: u32) -> Result<RunSummary> {
    let config = ExtractConfig::from_env();
    let today = Local::now().date_naive();
    let (start, end) = resolve_last_n_days(today, days)
        .with_context(|| format!("cannot resolve a date range for the last {days} days"))?;

    for dir in [&config.raw_data_dir, &config.processed_data_dir] {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }

    let pipeline = ExtractPipeline::new(config)?;
    let store = Arc::new(
        PgMetadataStore::connect(&pipeline.config().database)
            .await
            .context("failed to connect to metadata_db")?,
    );
    info!(%start, %end, "metadata pool ready");

    let summary = pipeline.run(store.clone(), start, end).await;
    store.close().await;
    Ok(summary)
}

/// Create the metadata table if it does not exist yet.
pub async fn migrate_from_env() -> Result<()> {
    let config = DatabaseConfig::from_env();
    let store = PgMetadataStore::connect(&config)
        .await
        .context("failed to connect to metadata_db")?;
    let created = store.ensure_schema().await.context("creating metadata_tbl");
    store.close().await;
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_tunables() {
        let config = ExtractConfig::default();
        assert_eq!(config.max_concurrent_requests, 5);
        assert_eq!(config.http.retry.retries, 5);
        assert_eq!(config.http.retry.delay, Duration::from_secs(3));
        assert_eq!(config.http.retry.backoff, 3);
        assert_eq!(config.database.min_connections, 7);
        assert_eq!(config.database.max_connections, 14);
        assert_eq!(config.database.connect_timeout, Duration::from_secs(60));
        assert_eq!(config.api_url_template, DEFAULT_API_URL_TEMPLATE);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn environment_overrides_are_applied() {
        let config = ExtractConfig::from_vars(vars(&[
            ("HOST_METADATA_DB", "db.internal"),
            ("METADATA_DB", "meta"),
            ("USER_METADATA_DB", "ingest"),
            ("PASSWORD_METADATA_DB", "s3cret"),
            ("RAW_DATA_DIR", "/lake/raw"),
            ("MAX_CONCURRENT_REQUESTS", "9"),
            ("HTTP_RETRIES", "2"),
            ("HTTP_RETRY_BACKOFF", "not-a-number"),
        ]));
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.name, "meta");
        assert_eq!(config.database.user, "ingest");
        assert_eq!(config.raw_data_dir, PathBuf::from("/lake/raw"));
        assert_eq!(config.max_concurrent_requests, 9);
        assert_eq!(config.http.retry.retries, 2);
        assert_eq!(config.http.retry.backoff, 3);
        assert!(!format!("{:?}", config.database).contains("s3cret"));
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut config = ExtractConfig::default();
        config.api_url_template = "https://example.test/history".into();
        assert!(config.validate().is_err());

        let mut config = ExtractConfig::default();
        config.max_concurrent_requests = 0;
        assert!(config.validate().is_err());

        let mut config = ExtractConfig::default();
        config.http.retry.retries = 0;
        assert!(config.validate().is_err());
    }
}
