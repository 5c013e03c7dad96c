//! Lifecycle storage for jobdesk: archive, pending, approved and rejected stages, plus the
//! snapshot store used by feeds.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jobdesk_core::{Disposition, Fingerprint, JobRecord, ListQuery, NormalizedJob, Page, Stage};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod retry;
pub mod snapshot;

pub use memory::MemoryJobStore;
pub use postgres::{PgJobStore, PgStoreConfig};
pub use retry::{BackoffPolicy, RetryDisposition};
pub use snapshot::{LocalSnapshotStore, SnapshotStore, StoredSnapshot};

pub const CRATE_NAME: &str = "jobdesk-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fingerprint {fingerprint} already present in {stage}")]
    Duplicate {
        stage: Stage,
        fingerprint: Fingerprint,
    },
    #[error("job {id} not found in {stage}")]
    NotFound { stage: Stage, id: Uuid },
    #[error("malformed {stage} row {id}: {reason}")]
    Corrupt {
        stage: Stage,
        id: String,
        reason: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn retry_disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Database(err) => retry::classify_sqlx_error(err),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Outcome of the duplicate-safe pending insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInsert {
    Inserted(Uuid),
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub success: usize,
    pub not_found: usize,
    pub errors: usize,
}

/// Counts plus the records that actually moved, so callers can audit each transition.
#[derive(Debug, Clone, Default)]
pub struct BulkOutcome {
    pub report: BulkReport,
    pub moved: Vec<JobRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_raw: u64,
    pub total_pending: u64,
    pub total_approved: u64,
    pub total_rejected: u64,
    pub jobs_by_source: BTreeMap<String, u64>,
    pub jobs_today: u64,
    pub jobs_this_week: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Archived fingerprints with no downstream copy that were put back into pending.
    pub requeued: u64,
    /// Pending rows whose fingerprint was already published.
    pub pruned: u64,
}

/// Activity windows used by [`JobStore::stats`]: since UTC midnight, and the last 7 days.
pub fn stats_windows(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now);
    (today, now - ChronoDuration::days(7))
}

/// Label used for archive rows that carry no source tag.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Persistent four-stage job storage.
///
/// Implementations must make [`JobStore::insert_pending`] an atomic insert-if-absent on the
/// fingerprint; that is the only guard against concurrent duplicate ingestion.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Append to the archive. Never deduplicates.
    async fn insert_archive(&self, job: &NormalizedJob) -> Result<Uuid, StoreError>;

    async fn insert_pending(&self, job: &NormalizedJob) -> Result<PendingInsert, StoreError>;

    async fn get(&self, stage: Stage, id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    async fn list(&self, stage: Stage, query: &ListQuery) -> Result<Page<JobRecord>, StoreError>;

    async fn count(&self, stage: Stage) -> Result<u64, StoreError>;

    /// Take a record out of pending and write it to the stage its disposition names.
    async fn move_from_pending(
        &self,
        id: Uuid,
        disposition: Disposition,
    ) -> Result<JobRecord, StoreError>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError>;

    /// Reconcile archive coverage by fingerprint. Safe to run repeatedly.
    async fn repair_coverage(&self) -> Result<RepairReport, StoreError>;

    async fn close(&self) {}

    async fn move_to_approved(
        &self,
        id: Uuid,
        approver: &str,
        at: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        self.move_from_pending(
            id,
            Disposition::Approved {
                approved_at: at,
                approved_by: approver.to_string(),
            },
        )
        .await
    }

    async fn move_to_rejected(
        &self,
        id: Uuid,
        rejector: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        self.move_from_pending(
            id,
            Disposition::Rejected {
                rejected_at: at,
                rejected_by: rejector.to_string(),
                rejection_reason: reason.to_string(),
            },
        )
        .await
    }

    /// Apply one disposition to many pending ids, each independently.
    ///
    /// Ids that are malformed or no longer pending count as `not_found`. Callers bound the
    /// list length.
    async fn bulk_move(&self, ids: &[String], disposition: &Disposition) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for raw_id in ids {
            let Ok(id) = Uuid::parse_str(raw_id.trim()) else {
                outcome.report.not_found += 1;
                continue;
            };
            match self.move_from_pending(id, disposition.clone()).await {
                Ok(record) => {
                    outcome.report.success += 1;
                    outcome.moved.push(record);
                }
                Err(StoreError::NotFound { .. }) => outcome.report.not_found += 1,
                Err(err) => {
                    warn!(%id, error = %err, "bulk move failed for job");
                    outcome.report.errors += 1;
                }
            }
        }
        outcome
    }
}

/// Target stage for a disposition.
pub fn disposition_stage(disposition: &Disposition) -> Stage {
    match disposition {
        Disposition::Approved { .. } => Stage::Approved,
        Disposition::Rejected { .. } => Stage::Rejected,
    }
}

/// Whether a stage enforces fingerprint uniqueness.
pub fn stage_is_unique(stage: Stage) -> bool {
    matches!(stage, Stage::Pending | Stage::Approved)
}
