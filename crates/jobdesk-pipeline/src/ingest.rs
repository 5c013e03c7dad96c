//! Ingestion boundary: validate, normalize, fingerprint, then write archive and pending.

use std::ops::AddAssign;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use jobdesk_core::{
    validate_batch_len, Fingerprint, NormalizedJob, RawJob, ValidationErrors, MAX_BATCH_ITEMS,
};
use jobdesk_storage::{JobStore, PendingInsert, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::normalize::Normalizer;

pub const DEFAULT_NORMALIZE_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error("job {fingerprint} is already pending review")]
    Duplicate { fingerprint: Fingerprint },
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// Tallies for one batch call. Duplicates are not errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub errors: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.inserted + self.duplicates + self.errors
    }
}

impl AddAssign for BatchReport {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.errors += other.errors;
    }
}

pub struct IngestPipeline {
    store: Arc<dyn JobStore>,
    normalizer: Normalizer,
    concurrency: usize,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn JobStore>, normalizer: Normalizer) -> Self {
        Self {
            store,
            normalizer,
            concurrency: DEFAULT_NORMALIZE_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Ingest one submission. The archive copy is kept even when pending reports a duplicate.
    pub async fn ingest(&self, raw: RawJob) -> Result<Fingerprint, IngestError> {
        let raw = raw.validated()?;
        let job = self.normalizer.normalize(raw, Utc::now()).await;
        self.write(job).await
    }

    /// Ingest 1..=100 submissions with per-item isolation.
    ///
    /// Normalization runs with bounded concurrency; writes happen in submission order.
    pub async fn ingest_batch(&self, raws: Vec<RawJob>) -> Result<BatchReport, IngestError> {
        self.ingest_decoded(raws.into_iter().map(Ok).collect()).await
    }

    /// Batch whose items were decoded upstream; an item that failed to decode carries
    /// the decoder's message and is tallied as an error alongside validation failures.
    pub async fn ingest_decoded(
        &self,
        items: Vec<Result<RawJob, String>>,
    ) -> Result<BatchReport, IngestError> {
        validate_batch_len("jobs", items.len())?;
        let submitted = items.len();

        let prepared = stream::iter(items.into_iter().map(|item| async move {
            let raw = item?.validated().map_err(|err| err.to_string())?;
            Ok::<_, String>(self.normalizer.normalize(raw, Utc::now()).await)
        }))
        .buffered(self.concurrency)
        .collect::<Vec<_>>()
        .await;

        let mut report = BatchReport::default();
        for (index, item) in prepared.into_iter().enumerate() {
            let job = match item {
                Ok(job) => job,
                Err(err) => {
                    debug!(index, error = %err, "batch item rejected");
                    report.errors += 1;
                    continue;
                }
            };
            match self.write(job).await {
                Ok(_) => report.inserted += 1,
                Err(IngestError::Duplicate { .. }) => report.duplicates += 1,
                Err(err) => {
                    warn!(index, error = %err, "batch item failed to store");
                    report.errors += 1;
                }
            }
        }

        info!(
            submitted,
            inserted = report.inserted,
            duplicates = report.duplicates,
            errors = report.errors,
            "batch ingested"
        );
        Ok(report)
    }

    /// Feed output of any size, split into batch-sized chunks.
    pub async fn ingest_all(&self, raws: Vec<RawJob>) -> BatchReport {
        let mut report = BatchReport::default();
        let mut remaining = raws;
        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(MAX_BATCH_ITEMS));
            match self.ingest_batch(remaining).await {
                Ok(chunk) => report += chunk,
                Err(err) => warn!(error = %err, "chunk rejected before ingestion"),
            }
            remaining = rest;
        }
        report
    }

    async fn write(&self, job: NormalizedJob) -> Result<Fingerprint, IngestError> {
        let fingerprint = job
            .fingerprint
            .clone()
            .unwrap_or_else(|| job.raw.fingerprint());

        let archive_id = self.store.insert_archive(&job).await?;
        match self.store.insert_pending(&job).await? {
            PendingInsert::Inserted(pending_id) => {
                debug!(
                    fingerprint = fingerprint.short(),
                    %archive_id,
                    %pending_id,
                    source = job.raw.source.as_deref().unwrap_or_default(),
                    "job queued for review"
                );
                Ok(fingerprint)
            }
            PendingInsert::Duplicate => {
                debug!(fingerprint = fingerprint.short(), %archive_id, "duplicate submission archived");
                Err(IngestError::Duplicate { fingerprint })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NoopGeocoder;
    use crate::review::ReviewWorkflow;
    use jobdesk_core::{Actor, ListQuery, Role, Stage};
    use jobdesk_storage::MemoryJobStore;

    fn pipeline() -> (Arc<MemoryJobStore>, IngestPipeline) {
        let store = Arc::new(MemoryJobStore::new());
        let pipeline = IngestPipeline::new(store.clone(), Normalizer::new(Arc::new(NoopGeocoder)));
        (store, pipeline)
    }

    fn job(title: &str) -> RawJob {
        RawJob {
            location: Some("Remote".to_string()),
            description: Some("first sighting".to_string()),
            ..RawJob::new(title, "Acme")
        }
    }

    #[tokio::test]
    async fn reingest_is_duplicate_but_still_archived() {
        let (store, pipeline) = pipeline();

        let first = pipeline.ingest(job("Rust Engineer")).await.expect("first");
        let again = RawJob {
            description: Some("seen on another board".to_string()),
            salary: Some("$100k".to_string()),
            ..job("  rust ENGINEER ")
        };
        let err = pipeline.ingest(again).await.expect_err("duplicate");
        assert!(matches!(err, IngestError::Duplicate { ref fingerprint } if *fingerprint == first));

        assert_eq!(store.count(Stage::Pending).await.expect("count"), 1);
        assert_eq!(store.count(Stage::Archive).await.expect("count"), 2);
        pipeline.ingest(job("Rust Engineer")).await.expect_err("third");
        assert_eq!(store.count(Stage::Archive).await.expect("count"), 3);
    }

    async fn only_pending_id(store: &MemoryJobStore) -> String {
        let page = store
            .list(Stage::Pending, &ListQuery::default())
            .await
            .expect("list");
        assert_eq!(page.data.len(), 1);
        page.data[0].id.to_string()
    }

    #[tokio::test]
    async fn approved_fingerprint_is_duplicate_on_reingest() {
        let (store, pipeline) = pipeline();
        let review = ReviewWorkflow::new(store.clone());
        let admin = Actor::new("alice", Role::Admin);

        let fingerprint = pipeline.ingest(job("Platform Engineer")).await.expect("first");
        let id = only_pending_id(&store).await;
        review.approve(&admin, &id).await.expect("approve");

        let err = pipeline
            .ingest(job("platform engineer"))
            .await
            .expect_err("approved fingerprint");
        assert!(matches!(err, IngestError::Duplicate { fingerprint: ref f } if *f == fingerprint));

        assert_eq!(store.count(Stage::Archive).await.expect("count"), 2);
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 0);
        assert_eq!(store.count(Stage::Approved).await.expect("count"), 1);
        assert_eq!(store.count(Stage::Rejected).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn rejected_fingerprint_is_duplicate_on_reingest() {
        let (store, pipeline) = pipeline();
        let review = ReviewWorkflow::new(store.clone());
        let admin = Actor::new("alice", Role::Admin);

        pipeline.ingest(job("Crypto Ninja")).await.expect("first");
        let id = only_pending_id(&store).await;
        review.reject(&admin, &id, "spam").await.expect("reject");

        let report = pipeline
            .ingest_batch(vec![job("Crypto Ninja"), job("Data Engineer")])
            .await
            .expect("batch");
        assert_eq!((report.inserted, report.duplicates, report.errors), (1, 1, 0));

        assert_eq!(store.count(Stage::Archive).await.expect("count"), 3);
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 1);
        assert_eq!(store.count(Stage::Approved).await.expect("count"), 0);
        assert_eq!(store.count(Stage::Rejected).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn validation_failure_writes_nothing() {
        let (store, pipeline) = pipeline();
        let err = pipeline
            .ingest(RawJob::new("   ", "Acme"))
            .await
            .expect_err("blank title");
        let IngestError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert_eq!(errors.fields[0].field, "title");
        assert_eq!(store.count(Stage::Archive).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn batch_isolates_items_and_tallies() {
        let (store, pipeline) = pipeline();
        pipeline.ingest(job("Existing")).await.expect("seed");

        let report = pipeline
            .ingest_batch(vec![
                job("Fresh One"),
                job("Existing"),
                RawJob::new("", ""),
                job("Fresh Two"),
                job("Fresh One"),
            ])
            .await
            .expect("batch");
        assert_eq!(
            report,
            BatchReport {
                inserted: 2,
                duplicates: 2,
                errors: 1
            }
        );
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 3);
        assert_eq!(store.count(Stage::Archive).await.expect("count"), 5);
    }

    #[tokio::test]
    async fn batch_size_is_bounded() {
        let (_, pipeline) = pipeline();
        assert!(matches!(
            pipeline.ingest_batch(Vec::new()).await,
            Err(IngestError::Validation(_))
        ));
        let oversized = (0..101).map(|i| job(&format!("Job {i}"))).collect();
        assert!(matches!(
            pipeline.ingest_batch(oversized).await,
            Err(IngestError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn ingest_all_chunks_large_feeds() {
        let (store, pipeline) = pipeline();
        let jobs = (0..250).map(|i| job(&format!("Job {i}"))).collect();
        let report = pipeline.ingest_all(jobs).await;
        assert_eq!(report.inserted, 250);
        assert_eq!(report.total(), 250);
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 250);
    }

    #[tokio::test]
    async fn concurrent_duplicate_ingestion_has_one_winner() {
        let (store, pipeline) = pipeline();
        let pipeline = Arc::new(pipeline);
        let mut handles = Vec::new();
        for _ in 0..12 {
            let pipeline = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                pipeline.ingest(job("Race Condition Engineer")).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join").is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 1);
        assert_eq!(store.count(Stage::Archive).await.expect("count"), 12);
    }
}
