//! Per-date content hash store with transactional lookup/insert/update.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use daylake_core::{ContentFingerprint, MetadataRecord};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::DatabaseConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("metadata record for {0} already exists")]
    DuplicateRecord(NaiveDate),
    #[error("no metadata record for {0}")]
    MissingRecord(NaiveDate),
    #[error("metadata transaction already finished")]
    TransactionFinished,
}

/// One atomic unit of work against the store. Dropping it without `commit`
/// discards its writes.
#[async_trait]
pub trait MetadataTransaction: Send {
    async fn lookup(&mut self, date: NaiveDate) -> Result<Option<ContentFingerprint>, StoreError>;

    /// Fails with [`StoreError::DuplicateRecord`] if the date already has a record.
    async fn insert(
        &mut self,
        date: NaiveDate,
        hash: &ContentFingerprint,
    ) -> Result<(), StoreError>;

    /// Fails with [`StoreError::MissingRecord`] if the date has no record.
    async fn update(
        &mut self,
        date: NaiveDate,
        hash: &ContentFingerprint,
    ) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, StoreError>;

    /// Release pooled resources. Called once per batch run.
    async fn close(&self) {}
}

pub const CREATE_METADATA_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS metadata_tbl (
        file_date DATE PRIMARY KEY,
        hash TEXT NOT NULL
    )
"#;

#[derive(Debug, Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.name);
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_METADATA_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgMetadataTransaction { tx: Some(tx) }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgMetadataTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgMetadataTransaction {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionFinished)
    }
}

#[async_trait]
impl MetadataTransaction for PgMetadataTransaction {
    async fn lookup(&mut self, date: NaiveDate) -> Result<Option<ContentFingerprint>, StoreError> {
        let tx = self.open()?;
        let row = sqlx::query("SELECT hash FROM metadata_tbl WHERE file_date = $1")
            .bind(date)
            .fetch_optional(&mut **tx)
            .await?;
        match row {
            Some(row) => Ok(Some(ContentFingerprint::from_hex(
                row.try_get::<String, _>("hash")?,
            ))),
            None => Ok(None),
        }
    }

    async fn insert(
        &mut self,
        date: NaiveDate,
        hash: &ContentFingerprint,
    ) -> Result<(), StoreError> {
        let tx = self.open()?;
        let inserted = sqlx::query("INSERT INTO metadata_tbl (file_date, hash) VALUES ($1, $2)")
            .bind(date)
            .bind(hash.as_str())
            .execute(&mut **tx)
            .await;
        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateRecord(date))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(
        &mut self,
        date: NaiveDate,
        hash: &ContentFingerprint,
    ) -> Result<(), StoreError> {
        let tx = self.open()?;
        let updated = sqlx::query("UPDATE metadata_tbl SET hash = $1 WHERE file_date = $2")
            .bind(hash.as_str())
            .bind(date)
            .execute(&mut **tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::MissingRecord(date));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }
}

/// In-process store. Each transaction holds the whole table lock until it is
/// committed or dropped, so transactions are serialized.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadataStore {
    records: Arc<Mutex<BTreeMap<NaiveDate, ContentFingerprint>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = MetadataRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|record| (record.date, record.hash))
            .collect();
        Self {
            records: Arc::new(Mutex::new(map)),
        }
    }

    pub async fn get(&self, date: NaiveDate) -> Option<ContentFingerprint> {
        self.records.lock().await.get(&date).cloned()
    }

    pub async fn records(&self) -> Vec<MetadataRecord> {
        self.records
            .lock()
            .await
            .iter()
            .map(|(date, hash)| MetadataRecord {
                date: *date,
                hash: hash.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, StoreError> {
        let guard = self.records.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard: Some(guard),
            pending: BTreeMap::new(),
        }))
    }
}

struct MemoryTransaction {
    guard: Option<OwnedMutexGuard<BTreeMap<NaiveDate, ContentFingerprint>>>,
    pending: BTreeMap<NaiveDate, ContentFingerprint>,
}

impl MemoryTransaction {
    fn current(&self, date: NaiveDate) -> Result<Option<ContentFingerprint>, StoreError> {
        let committed = self.guard.as_ref().ok_or(StoreError::TransactionFinished)?;
        Ok(self
            .pending
            .get(&date)
            .or_else(|| committed.get(&date))
            .cloned())
    }
}

#[async_trait]
impl MetadataTransaction for MemoryTransaction {
    async fn lookup(&mut self, date: NaiveDate) -> Result<Option<ContentFingerprint>, StoreError> {
        self.current(date)
    }

    async fn insert(
        &mut self,
        date: NaiveDate,
        hash: &ContentFingerprint,
    ) -> Result<(), StoreError> {
        if self.current(date)?.is_some() {
            return Err(StoreError::DuplicateRecord(date));
        }
        self.pending.insert(date, hash.clone());
        Ok(())
    }

    async fn update(
        &mut self,
        date: NaiveDate,
        hash: &ContentFingerprint,
    ) -> Result<(), StoreError> {
        if self.current(date)?.is_none() {
            return Err(StoreError::MissingRecord(date));
        }
        self.pending.insert(date, hash.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut guard = self.guard.take().ok_or(StoreError::TransactionFinished)?;
        guard.extend(std::mem::take(&mut self.pending));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).expect("date")
    }

    fn hash(hex: &str) -> ContentFingerprint {
        ContentFingerprint::from_hex(hex)
    }

    #[tokio::test]
    async fn insert_then_update_is_visible_after_commit() {
        let store = MemoryMetadataStore::new();

        let mut tx = store.begin().await.expect("begin");
        assert_eq!(tx.lookup(day(1)).await.expect("lookup"), None);
        tx.insert(day(1), &hash("aa")).await.expect("insert");
        assert_eq!(tx.lookup(day(1)).await.expect("lookup"), Some(hash("aa")));
        tx.commit().await.expect("commit");
        drop(tx);

        let mut tx = store.begin().await.expect("begin");
        tx.update(day(1), &hash("bb")).await.expect("update");
        tx.commit().await.expect("commit");
        drop(tx);

        assert_eq!(store.get(day(1)).await, Some(hash("bb")));
    }

    #[tokio::test]
    async fn duplicate_insert_and_missing_update_are_rejected() {
        let store = MemoryMetadataStore::with_records([MetadataRecord {
            date: day(2),
            hash: hash("aa"),
        }]);

        let mut tx = store.begin().await.expect("begin");
        assert!(matches!(
            tx.insert(day(2), &hash("bb")).await,
            Err(StoreError::DuplicateRecord(d)) if d == day(2)
        ));
        assert!(matches!(
            tx.update(day(3), &hash("bb")).await,
            Err(StoreError::MissingRecord(d)) if d == day(3)
        ));
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = MemoryMetadataStore::new();
        {
            let mut tx = store.begin().await.expect("begin");
            tx.insert(day(4), &hash("aa")).await.expect("insert");
        }
        assert_eq!(store.get(day(4)).await, None);
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn finished_transaction_refuses_further_work() {
        let store = MemoryMetadataStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.commit().await.expect("commit");
        assert!(matches!(
            tx.lookup(day(5)).await,
            Err(StoreError::TransactionFinished)
        ));
        assert!(matches!(tx.commit().await, Err(StoreError::TransactionFinished)));
    }
}
