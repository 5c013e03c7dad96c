//! Review workflow: actor-checked stage transitions and reads over a [`JobStore`].
//!
//! Transitions need [`Role::Admin`]; staff reads accept any reviewer role. The approved
//! listing and detail are public and take no actor. Every transition is written to the
//! `jobdesk::audit` tracing target.

use std::sync::Arc;

use chrono::Utc;
use jobdesk_core::{
    validate_batch_len, validate_reason, Actor, Disposition, Fingerprint, JobRecord, ListQuery,
    Page, Role, Stage, ValidationErrors,
};
use jobdesk_storage::{BulkReport, JobStore, RepairReport, StoreError, StoreStats};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "jobdesk::audit";

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("{actor} ({role:?}) may not {action}")]
    Forbidden {
        actor: String,
        role: Role,
        action: &'static str,
    },
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error("job {id} not found in {stage}")]
    NotFound { stage: Stage, id: String },
    #[error("job {fingerprint} is already approved")]
    Duplicate { fingerprint: Fingerprint },
    #[error("storage failure: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for ReviewError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { stage, id } => ReviewError::NotFound {
                stage,
                id: id.to_string(),
            },
            StoreError::Duplicate { fingerprint, .. } => ReviewError::Duplicate { fingerprint },
            other => ReviewError::Storage(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permission {
    Read,
    Review,
}

fn authorize(actor: &Actor, permission: Permission, action: &'static str) -> Result<(), ReviewError> {
    let allowed = match permission {
        Permission::Read => actor.role.can_read(),
        Permission::Review => actor.role.can_review(),
    };
    if allowed {
        Ok(())
    } else {
        warn!(
            target: AUDIT_TARGET,
            actor = %actor.id,
            role = ?actor.role,
            action,
            "review action denied"
        );
        Err(ReviewError::Forbidden {
            actor: actor.id.clone(),
            role: actor.role,
            action,
        })
    }
}

fn parse_pending_id(job_id: &str) -> Result<Uuid, ReviewError> {
    Uuid::parse_str(job_id.trim()).map_err(|_| ReviewError::NotFound {
        stage: Stage::Pending,
        id: job_id.to_string(),
    })
}

fn audit(actor: &Actor, action: &str, record: &JobRecord) {
    let reason = match &record.disposition {
        Some(Disposition::Rejected {
            rejection_reason, ..
        }) => rejection_reason.as_str(),
        _ => "",
    };
    info!(
        target: AUDIT_TARGET,
        actor = %actor.id,
        role = ?actor.role,
        action,
        job_id = %record.id,
        fingerprint = record.fingerprint().map(Fingerprint::as_str).unwrap_or_default(),
        reason,
        "job transitioned"
    );
}

#[derive(Clone)]
pub struct ReviewWorkflow {
    store: Arc<dyn JobStore>,
}

impl ReviewWorkflow {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn approve(&self, actor: &Actor, job_id: &str) -> Result<JobRecord, ReviewError> {
        authorize(actor, Permission::Review, "approve")?;
        let id = parse_pending_id(job_id)?;
        let record = self.store.move_to_approved(id, &actor.id, Utc::now()).await?;
        audit(actor, "approve", &record);
        Ok(record)
    }

    pub async fn reject(
        &self,
        actor: &Actor,
        job_id: &str,
        reason: &str,
    ) -> Result<JobRecord, ReviewError> {
        authorize(actor, Permission::Review, "reject")?;
        let reason = validate_reason(reason)?;
        let id = parse_pending_id(job_id)?;
        let record = self
            .store
            .move_to_rejected(id, &actor.id, &reason, Utc::now())
            .await?;
        audit(actor, "reject", &record);
        Ok(record)
    }

    pub async fn bulk_approve(
        &self,
        actor: &Actor,
        job_ids: &[String],
    ) -> Result<BulkReport, ReviewError> {
        authorize(actor, Permission::Review, "bulk approve")?;
        validate_batch_len("job_ids", job_ids.len())?;
        let disposition = Disposition::Approved {
            approved_at: Utc::now(),
            approved_by: actor.id.clone(),
        };
        Ok(self.bulk(actor, "bulk_approve", job_ids, disposition).await)
    }

    pub async fn bulk_reject(
        &self,
        actor: &Actor,
        job_ids: &[String],
        reason: &str,
    ) -> Result<BulkReport, ReviewError> {
        authorize(actor, Permission::Review, "bulk reject")?;
        validate_batch_len("job_ids", job_ids.len())?;
        let disposition = Disposition::Rejected {
            rejected_at: Utc::now(),
            rejected_by: actor.id.clone(),
            rejection_reason: validate_reason(reason)?,
        };
        Ok(self.bulk(actor, "bulk_reject", job_ids, disposition).await)
    }

    async fn bulk(
        &self,
        actor: &Actor,
        action: &'static str,
        job_ids: &[String],
        disposition: Disposition,
    ) -> BulkReport {
        let outcome = self.store.bulk_move(job_ids, &disposition).await;
        for record in &outcome.moved {
            audit(actor, action, record);
        }
        info!(
            target: AUDIT_TARGET,
            actor = %actor.id,
            action,
            requested = job_ids.len(),
            success = outcome.report.success,
            not_found = outcome.report.not_found,
            errors = outcome.report.errors,
            "bulk review finished"
        );
        outcome.report
    }

    pub async fn list_pending(
        &self,
        actor: &Actor,
        query: &ListQuery,
    ) -> Result<Page<JobRecord>, ReviewError> {
        authorize(actor, Permission::Read, "list pending jobs")?;
        Ok(self.store.list(Stage::Pending, query).await?)
    }

    pub async fn list_rejected(
        &self,
        actor: &Actor,
        query: &ListQuery,
    ) -> Result<Page<JobRecord>, ReviewError> {
        authorize(actor, Permission::Read, "list rejected jobs")?;
        Ok(self.store.list(Stage::Rejected, query).await?)
    }

    pub async fn list_approved(&self, query: &ListQuery) -> Result<Page<JobRecord>, ReviewError> {
        Ok(self.store.list(Stage::Approved, query).await?)
    }

    pub async fn get_approved(&self, job_id: &str) -> Result<JobRecord, ReviewError> {
        let not_found = || ReviewError::NotFound {
            stage: Stage::Approved,
            id: job_id.to_string(),
        };
        let id = Uuid::parse_str(job_id.trim()).map_err(|_| not_found())?;
        self.store
            .get(Stage::Approved, id)
            .await?
            .ok_or_else(not_found)
    }

    pub async fn stats(&self, actor: &Actor) -> Result<StoreStats, ReviewError> {
        authorize(actor, Permission::Read, "read stats")?;
        Ok(self.store.stats(Utc::now()).await?)
    }

    pub async fn repair(&self, actor: &Actor) -> Result<RepairReport, ReviewError> {
        authorize(actor, Permission::Review, "repair coverage")?;
        let report = self.store.repair_coverage().await?;
        info!(
            target: AUDIT_TARGET,
            actor = %actor.id,
            requeued = report.requeued,
            pruned = report.pruned,
            "coverage repaired"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobdesk_core::{NormalizedJob, PageRequest, RawJob};
    use jobdesk_storage::{MemoryJobStore, PendingInsert};
    use std::collections::BTreeSet;

    fn admin() -> Actor {
        Actor::new("alice", Role::Admin)
    }

    fn viewer() -> Actor {
        Actor::new("victor", Role::Viewer)
    }

    async fn seed(store: &MemoryJobStore, title: &str) -> Uuid {
        let raw = RawJob::new(title, "Acme");
        let job = NormalizedJob {
            fingerprint: Some(raw.fingerprint()),
            raw,
            posted_date_parsed: None,
            salary_parsed: None,
            location_normalized: None,
            tags: BTreeSet::new(),
            ingested_at: Utc::now(),
        };
        store.insert_archive(&job).await.expect("archive");
        match store.insert_pending(&job).await.expect("pending") {
            PendingInsert::Inserted(id) => id,
            PendingInsert::Duplicate => panic!("seed titles must be unique"),
        }
    }

    fn workflow() -> (Arc<MemoryJobStore>, ReviewWorkflow) {
        let store = Arc::new(MemoryJobStore::new());
        (store.clone(), ReviewWorkflow::new(store))
    }

    #[tokio::test]
    async fn approve_then_reject_is_not_found() {
        let (store, review) = workflow();
        let id = seed(&store, "Rust Engineer").await.to_string();

        let approved = review.approve(&admin(), &id).await.expect("approve");
        assert_eq!(approved.id.to_string(), id);
        assert!(matches!(
            approved.disposition,
            Some(Disposition::Approved { ref approved_by, .. }) if approved_by == "alice"
        ));

        let err = review
            .reject(&admin(), &id, "spam")
            .await
            .expect_err("already moved");
        assert!(matches!(err, ReviewError::NotFound { stage: Stage::Pending, .. }));

        let public = review.get_approved(&id).await.expect("public detail");
        assert_eq!(public.job.raw.title, "Rust Engineer");
    }

    #[tokio::test]
    async fn viewers_read_but_cannot_transition() {
        let (store, review) = workflow();
        let id = seed(&store, "Data Analyst").await.to_string();

        let err = review.approve(&viewer(), &id).await.expect_err("viewer");
        assert!(matches!(err, ReviewError::Forbidden { action: "approve", .. }));
        assert!(matches!(
            review.repair(&viewer()).await,
            Err(ReviewError::Forbidden { .. })
        ));

        let page = review
            .list_pending(&viewer(), &ListQuery::default())
            .await
            .expect("viewer list");
        assert_eq!(page.total, 1);
        assert_eq!(review.stats(&viewer()).await.expect("stats").total_pending, 1);
    }

    #[tokio::test]
    async fn rejection_reason_is_validated_before_moving() {
        let (store, review) = workflow();
        let id = seed(&store, "QA Engineer").await.to_string();

        let err = review.reject(&admin(), &id, "   ").await.expect_err("blank");
        assert!(matches!(err, ReviewError::Validation(_)));
        let long = "x".repeat(501);
        assert!(matches!(
            review.reject(&admin(), &id, &long).await,
            Err(ReviewError::Validation(_))
        ));
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 1);

        let rejected = review
            .reject(&admin(), &id, "  duplicate of another posting ")
            .await
            .expect("reject");
        assert!(matches!(
            rejected.disposition,
            Some(Disposition::Rejected { ref rejection_reason, .. })
                if rejection_reason == "duplicate of another posting"
        ));
        let listed = review
            .list_rejected(&admin(), &ListQuery::default())
            .await
            .expect("rejected list");
        assert_eq!(listed.data.len(), 1);
    }

    #[tokio::test]
    async fn bulk_approve_counts_moved_and_malformed_ids_as_not_found() {
        let (store, review) = workflow();
        let mut ids = Vec::new();
        for i in 0..90 {
            ids.push(seed(&store, &format!("Engineer {i:02}")).await.to_string());
        }
        let already = ids.split_off(60);
        let report = review
            .bulk_approve(&admin(), &already)
            .await
            .expect("first bulk");
        assert_eq!(report.success, 30);

        let mut request = ids.clone();
        request.extend(already);
        request.extend((0..10).map(|i| format!("not-a-uuid-{i}")));
        assert_eq!(request.len(), 100);

        let report = review.bulk_approve(&admin(), &request).await.expect("bulk");
        assert_eq!(
            report,
            BulkReport {
                success: 60,
                not_found: 40,
                errors: 0
            }
        );
        assert_eq!(store.count(Stage::Approved).await.expect("count"), 90);
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn bulk_calls_are_bounded_and_share_one_reason() {
        let (store, review) = workflow();
        let ids = vec![
            seed(&store, "One").await.to_string(),
            seed(&store, "Two").await.to_string(),
        ];
        assert!(matches!(
            review.bulk_reject(&admin(), &[], "stale").await,
            Err(ReviewError::Validation(_))
        ));
        let too_many = vec![Uuid::new_v4().to_string(); 101];
        assert!(matches!(
            review.bulk_approve(&admin(), &too_many).await,
            Err(ReviewError::Validation(_))
        ));

        let report = review
            .bulk_reject(&admin(), &ids, "stale listing")
            .await
            .expect("bulk reject");
        assert_eq!(report.success, 2);
        let page = review
            .list_rejected(&viewer(), &ListQuery::page(PageRequest::default()))
            .await
            .expect("list");
        assert!(page.data.iter().all(|record| matches!(
            &record.disposition,
            Some(Disposition::Rejected { rejection_reason, .. }) if rejection_reason == "stale listing"
        )));
    }

    #[tokio::test]
    async fn decided_fingerprints_stay_out_of_the_review_queue() {
        let (store, review) = workflow();
        let approved = seed(&store, "Platform Lead").await.to_string();
        let rejected = seed(&store, "Crypto Ninja").await.to_string();
        review.approve(&admin(), &approved).await.expect("approve");
        review
            .reject(&admin(), &rejected, "spam")
            .await
            .expect("reject");

        let report = review.repair(&admin()).await.expect("repair");
        assert_eq!(report.requeued, 0);
        assert_eq!(report.pruned, 0);
        let queue = review
            .list_pending(&viewer(), &ListQuery::default())
            .await
            .expect("pending");
        assert_eq!(queue.total, 0);
    }
}
