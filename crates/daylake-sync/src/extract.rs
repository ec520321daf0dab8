//! Per-date processing and the bounded fan-out over a date range.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use daylake_core::{
    detect_change, expand_date_units, BatchResult, ChangeKind, ContentFingerprint, DateUnit,
};
use daylake_storage::{fingerprint, PayloadSource, StagingArea};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::metadata::{MetadataStore, MetadataTransaction, StoreError};

/// Look up the stored hash for `date`, decide the change kind and apply the
/// matching insert or update. The transaction is handed back still open so the
/// caller can commit only once the payload is on disk.
pub async fn record_change(
    store: &dyn MetadataStore,
    date: NaiveDate,
    fresh: &ContentFingerprint,
) -> Result<(ChangeKind, Box<dyn MetadataTransaction>), StoreError> {
    let mut tx = store.begin().await?;
    let stored = tx.lookup(date).await?;
    let change = detect_change(stored.as_ref(), fresh);
    match change {
        ChangeKind::New => tx.insert(date, fresh).await?,
        ChangeKind::Changed => tx.update(date, fresh).await?,
        ChangeKind::Unchanged => {}
    }
    Ok((change, tx))
}

/// [`record_change`] followed by an immediate commit.
pub async fn reconcile(
    store: &dyn MetadataStore,
    date: NaiveDate,
    fresh: &ContentFingerprint,
) -> Result<ChangeKind, StoreError> {
    let (change, mut tx) = record_change(store, date, fresh).await?;
    tx.commit().await?;
    Ok(change)
}

/// Runs one date end to end. Every failure is logged and turned into `None`.
pub struct DateUnitProcessor {
    source: Arc<dyn PayloadSource>,
    store: Arc<dyn MetadataStore>,
    staging: StagingArea,
    gate: Arc<Semaphore>,
}

impl DateUnitProcessor {
    pub fn new(
        source: Arc<dyn PayloadSource>,
        store: Arc<dyn MetadataStore>,
        staging: StagingArea,
        gate: Arc<Semaphore>,
    ) -> Self {
        Self {
            source,
            store,
            staging,
            gate,
        }
    }

    pub async fn process(&self, unit: &DateUnit) -> Option<PathBuf> {
        let date = unit.date;

        let payload = {
            let Ok(_permit) = self.gate.acquire().await else {
                error!(%date, "admission gate closed; skipping date");
                return None;
            };
            match self.source.fetch_json(&unit.source_url).await {
                Ok(payload) => payload,
                Err(err) => {
                    error!(%date, error = %err, "skipping date due to error in fetching data");
                    return None;
                }
            }
        };

        let fresh = fingerprint(&payload);

        let (change, mut tx) = match record_change(self.store.as_ref(), date, &fresh).await {
            Ok(recorded) => recorded,
            Err(err) => {
                error!(%date, error = %err, "skipping date: metadata transaction failed");
                return None;
            }
        };

        match change {
            ChangeKind::Unchanged => {
                info!(%date, "data for date is already ingested");
                return None;
            }
            ChangeKind::New => info!(%date, hash = %fresh, "new date; staging payload"),
            ChangeKind::Changed => {
                warn!(%date, hash = %fresh, "historical data for date has changed upstream")
            }
        }

        // The metadata write only lands once the file is staged; dropping `tx`
        // rolls it back so the next run retries the date.
        let path = match self.staging.stage_json(date, &payload).await {
            Ok(path) => path,
            Err(err) => {
                error!(%date, error = %err, "failed to stage payload; metadata rolled back");
                return None;
            }
        };

        if let Err(err) = tx.commit().await {
            error!(
                %date,
                path = %path.display(),
                error = %err,
                "staged payload but metadata commit failed"
            );
            return None;
        }

        info!(%date, path = %path.display(), "staged payload");
        Some(path)
    }
}

/// Fans a date range out over [`DateUnitProcessor`]s, at most
/// `max_concurrent_requests` fetches in flight.
pub struct BatchExtractor {
    source: Arc<dyn PayloadSource>,
    staging: StagingArea,
    max_concurrent_requests: usize,
}

impl BatchExtractor {
    pub fn new(
        source: Arc<dyn PayloadSource>,
        staging: StagingArea,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            source,
            staging,
            max_concurrent_requests: max_concurrent_requests.max(1),
        }
    }

    /// Extract every date in `[start, end]`. The store is left open; its owner
    /// closes it.
    pub async fn extract(
        &self,
        store: Arc<dyn MetadataStore>,
        url_template: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BatchResult {
        let units = expand_date_units(url_template, start, end);
        let processor = Arc::new(DateUnitProcessor::new(
            self.source.clone(),
            store,
            self.staging.clone(),
            Arc::new(Semaphore::new(self.max_concurrent_requests)),
        ));

        info!(
            %start,
            %end,
            dates = units.len(),
            max_concurrent_requests = self.max_concurrent_requests,
            "starting extraction"
        );

        let mut tasks = JoinSet::new();
        for unit in units {
            let processor = processor.clone();
            tasks.spawn(async move {
                let staged = processor.process(&unit).await;
                (unit.date, staged)
            });
        }

        let mut staged = BatchResult::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((date, Some(path))) => {
                    staged.insert(date, path);
                }
                Ok((_, None)) => {}
                Err(err) => error!(error = %err, "date task aborted"),
            }
        }

        info!(staged = staged.len(), "extraction finished");
        staged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryMetadataStore;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).expect("date")
    }

    #[tokio::test]
    async fn reconcile_walks_new_unchanged_changed() {
        let store = MemoryMetadataStore::new();
        let a = ContentFingerprint::from_hex("aa");
        let b = ContentFingerprint::from_hex("bb");

        assert_eq!(reconcile(&store, day(1), &a).await.expect("new"), ChangeKind::New);
        assert_eq!(
            reconcile(&store, day(1), &a).await.expect("unchanged"),
            ChangeKind::Unchanged
        );
        assert_eq!(
            reconcile(&store, day(1), &b).await.expect("changed"),
            ChangeKind::Changed
        );
        assert_eq!(store.get(day(1)).await, Some(b));
    }

    #[tokio::test]
    async fn uncommitted_change_is_discarded() {
        let store = MemoryMetadataStore::new();
        let a = ContentFingerprint::from_hex("aa");

        let (change, tx) = record_change(&store, day(2), &a).await.expect("record");
        assert_eq!(change, ChangeKind::New);
        drop(tx);
        assert_eq!(store.get(day(2)).await, None);

        let (change, mut tx) = record_change(&store, day(2), &a).await.expect("record");
        assert_eq!(change, ChangeKind::New);
        tx.commit().await.expect("commit");
        drop(tx);
        assert_eq!(store.get(day(2)).await, Some(a));
    }
}
