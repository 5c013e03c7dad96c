//! In-process [`JobStore`] used by tests and by `serve --memory`.
//!
//! Every operation runs under one mutex, so the pending insert and stage moves are
//! trivially atomic.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobdesk_core::{Disposition, Fingerprint, JobRecord, ListQuery, NormalizedJob, Page, Stage};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    disposition_stage, stage_is_unique, stats_windows, JobStore, PendingInsert, RepairReport,
    StoreError, StoreStats, UNKNOWN_SOURCE,
};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    stages: BTreeMap<Stage, Vec<JobRecord>>,
}

impl MemoryState {
    fn rows(&self, stage: Stage) -> &[JobRecord] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or_default()
    }

    fn rows_mut(&mut self, stage: Stage) -> &mut Vec<JobRecord> {
        self.stages.entry(stage).or_default()
    }

    fn has_fingerprint(&self, stage: Stage, record: &JobRecord) -> bool {
        match record.fingerprint() {
            Some(fp) => self.rows(stage).iter().any(|r| r.fingerprint() == Some(fp)),
            None => false,
        }
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_query(stage: Stage, record: &JobRecord, query: &ListQuery) -> bool {
    let contains = |haystack: Option<&str>, needle: &str| {
        haystack.is_some_and(|h| h.to_lowercase().contains(needle))
    };
    let raw = &record.job.raw;

    if let Some(text) = query.search_text() {
        let needle = text.to_lowercase();
        let hit = contains(Some(&raw.title), &needle)
            || contains(Some(&raw.company), &needle)
            || (stage == Stage::Approved && contains(raw.location.as_deref(), &needle));
        if !hit {
            return false;
        }
    }
    if let Some(source) = query.source_filter() {
        if raw.source.as_deref() != Some(source) {
            return false;
        }
    }
    if let Some(location) = query.location_text() {
        if !contains(raw.location.as_deref(), &location.to_lowercase()) {
            return false;
        }
    }
    true
}

fn sort_key(stage: Stage, record: &JobRecord) -> DateTime<Utc> {
    match stage {
        Stage::Approved => record.approved_at().unwrap_or(record.job.ingested_at),
        Stage::Rejected => record.rejected_at().unwrap_or(record.job.ingested_at),
        Stage::Archive | Stage::Pending => record.job.ingested_at,
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_archive(&self, job: &NormalizedJob) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        state.rows_mut(Stage::Archive).push(JobRecord {
            id,
            job: job.clone(),
            disposition: None,
        });
        Ok(id)
    }

    async fn insert_pending(&self, job: &NormalizedJob) -> Result<PendingInsert, StoreError> {
        let record = JobRecord {
            id: Uuid::new_v4(),
            job: job.clone(),
            disposition: None,
        };
        let mut state = self.state.lock().await;
        let decided = [Stage::Pending, Stage::Approved, Stage::Rejected]
            .into_iter()
            .any(|stage| state.has_fingerprint(stage, &record));
        if decided {
            return Ok(PendingInsert::Duplicate);
        }
        let id = record.id;
        state.rows_mut(Stage::Pending).push(record);
        Ok(PendingInsert::Inserted(id))
    }

    async fn get(&self, stage: Stage, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows(stage).iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, stage: Stage, query: &ListQuery) -> Result<Page<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut matched = state
            .rows(stage)
            .iter()
            .filter(|r| matches_query(stage, r, query))
            .collect::<Vec<_>>();
        matched.sort_by(|a, b| sort_key(stage, b).cmp(&sort_key(stage, a)));

        let total = matched.len() as u64;
        let data = matched
            .into_iter()
            .skip(query.page.offset() as usize)
            .take(query.page.per_page() as usize)
            .cloned()
            .collect();
        Ok(Page::new(query.page, total, data))
    }

    async fn count(&self, stage: Stage) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.rows(stage).len() as u64)
    }

    async fn move_from_pending(
        &self,
        id: Uuid,
        disposition: Disposition,
    ) -> Result<JobRecord, StoreError> {
        let target = disposition_stage(&disposition);
        let mut state = self.state.lock().await;
        let position = state
            .rows(Stage::Pending)
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound {
                stage: Stage::Pending,
                id,
            })?;

        let mut record = state.rows(Stage::Pending)[position].clone();
        if stage_is_unique(target) && state.has_fingerprint(target, &record) {
            if let Some(fingerprint) = record.job.fingerprint.clone() {
                return Err(StoreError::Duplicate {
                    stage: target,
                    fingerprint,
                });
            }
        }

        record.disposition = Some(disposition);
        state.rows_mut(Stage::Pending).remove(position);
        state.rows_mut(target).push(record.clone());
        Ok(record)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        let (today, week) = stats_windows(now);
        let state = self.state.lock().await;
        let archive = state.rows(Stage::Archive);

        let mut jobs_by_source: BTreeMap<String, u64> = BTreeMap::new();
        for record in archive {
            let source = record
                .job
                .raw
                .source
                .clone()
                .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());
            *jobs_by_source.entry(source).or_default() += 1;
        }

        Ok(StoreStats {
            total_raw: archive.len() as u64,
            total_pending: state.rows(Stage::Pending).len() as u64,
            total_approved: state.rows(Stage::Approved).len() as u64,
            total_rejected: state.rows(Stage::Rejected).len() as u64,
            jobs_by_source,
            jobs_today: archive.iter().filter(|r| r.job.ingested_at >= today).count() as u64,
            jobs_this_week: archive.iter().filter(|r| r.job.ingested_at >= week).count() as u64,
        })
    }

    async fn repair_coverage(&self) -> Result<RepairReport, StoreError> {
        let mut state = self.state.lock().await;
        let mut report = RepairReport::default();

        let before = state.rows(Stage::Pending).len();
        let published = state
            .rows(Stage::Approved)
            .iter()
            .filter_map(|r| r.job.fingerprint.clone())
            .collect::<Vec<_>>();
        state
            .rows_mut(Stage::Pending)
            .retain(|r| r.fingerprint().map_or(true, |fp| !published.contains(fp)));
        report.pruned = (before - state.rows(Stage::Pending).len()) as u64;

        let mut newest: BTreeMap<Fingerprint, &JobRecord> = BTreeMap::new();
        for record in state.rows(Stage::Archive) {
            let Some(fp) = record.fingerprint() else {
                continue;
            };
            let replace = newest
                .get(fp)
                .map_or(true, |seen| seen.job.ingested_at < record.job.ingested_at);
            if replace {
                newest.insert(fp.clone(), record);
            }
        }
        let orphans = newest
            .into_iter()
            .filter(|(fp, _)| {
                [Stage::Pending, Stage::Approved, Stage::Rejected]
                    .iter()
                    .all(|stage| state.rows(*stage).iter().all(|r| r.fingerprint() != Some(fp)))
            })
            .map(|(_, record)| JobRecord {
                id: Uuid::new_v4(),
                job: record.job.clone(),
                disposition: None,
            })
            .collect::<Vec<_>>();

        report.requeued = orphans.len() as u64;
        state.rows_mut(Stage::Pending).extend(orphans);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobdesk_core::{PageRequest, RawJob};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn job(title: &str, source: &str, ingested_at: DateTime<Utc>) -> NormalizedJob {
        let raw = RawJob {
            source: Some(source.to_string()),
            location: Some("Berlin".to_string()),
            ..RawJob::new(title, "Acme")
        };
        NormalizedJob {
            fingerprint: Some(raw.fingerprint()),
            raw,
            posted_date_parsed: None,
            salary_parsed: None,
            location_normalized: None,
            tags: BTreeSet::new(),
            ingested_at,
        }
    }

    /// Plant a pending row directly, as a pending insert racing an approval can leave one.
    async fn plant_pending(store: &MemoryJobStore, job: &NormalizedJob) -> Uuid {
        let id = Uuid::new_v4();
        store.state.lock().await.rows_mut(Stage::Pending).push(JobRecord {
            id,
            job: job.clone(),
            disposition: None,
        });
        id
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn pending_insert_is_unique_per_fingerprint_but_archive_is_not() {
        let store = MemoryJobStore::new();
        let first = job("Rust Engineer", "remotive", t0());

        store.insert_archive(&first).await.expect("archive");
        assert!(matches!(
            store.insert_pending(&first).await.expect("pending"),
            PendingInsert::Inserted(_)
        ));
        store.insert_archive(&first).await.expect("archive again");
        assert_eq!(
            store.insert_pending(&first).await.expect("pending again"),
            PendingInsert::Duplicate
        );

        assert_eq!(store.count(Stage::Archive).await.expect("count"), 2);
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn records_without_fingerprint_are_not_constrained() {
        let store = MemoryJobStore::new();
        let mut unkeyed = job("Anything", "manual", t0());
        unkeyed.fingerprint = None;
        store.insert_pending(&unkeyed).await.expect("first");
        store.insert_pending(&unkeyed).await.expect("second");
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn concurrent_duplicate_inserts_have_one_winner() {
        let store = Arc::new(MemoryJobStore::new());
        let shared = job("Race", "remotive", t0());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let job = shared.clone();
            handles.push(tokio::spawn(async move { store.insert_pending(&job).await }));
        }
        let mut inserted = 0;
        for handle in handles {
            if let PendingInsert::Inserted(_) = handle.await.expect("join").expect("insert") {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn move_keeps_id_and_blocks_second_transition() {
        let store = MemoryJobStore::new();
        let PendingInsert::Inserted(id) = store
            .insert_pending(&job("Rust Engineer", "remotive", t0()))
            .await
            .expect("pending")
        else {
            panic!("expected insert");
        };

        let approved = store.move_to_approved(id, "ops", t0()).await.expect("approve");
        assert_eq!(approved.id, id);
        assert_eq!(approved.approved_at(), Some(t0()));
        assert!(store.get(Stage::Approved, id).await.expect("get").is_some());
        assert!(store.get(Stage::Pending, id).await.expect("get").is_none());

        let err = store
            .move_to_rejected(id, "ops", "spam", t0())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { stage: Stage::Pending, .. }));
    }

    #[tokio::test]
    async fn approving_a_second_copy_of_a_published_fingerprint_is_refused() {
        let store = MemoryJobStore::new();
        let posting = job("Rust Engineer", "remotive", t0());
        let PendingInsert::Inserted(first) = store.insert_pending(&posting).await.expect("p1")
        else {
            panic!("expected insert");
        };
        store.move_to_approved(first, "ops", t0()).await.expect("approve");

        let second = plant_pending(&store, &posting).await;
        let err = store.move_to_approved(second, "ops", t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { stage: Stage::Approved, .. }));
        assert!(store.get(Stage::Pending, second).await.expect("get").is_some());

        store
            .move_to_rejected(second, "ops", "already published", t0())
            .await
            .expect("rejected accepts repeats");
    }

    #[tokio::test]
    async fn decided_fingerprints_never_reenter_pending() {
        let store = MemoryJobStore::new();
        let published = job("Rust Engineer", "remotive", t0());
        let spam = job("Crypto Ninja", "remotive", t0());
        for posting in [&published, &spam] {
            store.insert_archive(posting).await.expect("archive");
        }
        let PendingInsert::Inserted(approve_id) = store.insert_pending(&published).await.expect("p")
        else {
            panic!("expected insert");
        };
        let PendingInsert::Inserted(reject_id) = store.insert_pending(&spam).await.expect("p")
        else {
            panic!("expected insert");
        };
        store.move_to_approved(approve_id, "ops", t0()).await.expect("approve");
        store
            .move_to_rejected(reject_id, "ops", "spam", t0())
            .await
            .expect("reject");

        for posting in [&published, &spam] {
            assert_eq!(
                store.insert_pending(posting).await.expect("re-sighting"),
                PendingInsert::Duplicate
            );
        }
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 0);
        assert_eq!(store.count(Stage::Approved).await.expect("count"), 1);
        assert_eq!(store.count(Stage::Rejected).await.expect("count"), 1);
        assert_eq!(store.repair_coverage().await.expect("repair"), RepairReport::default());
    }

    #[tokio::test]
    async fn listing_filters_sorts_and_paginates() {
        let store = MemoryJobStore::new();
        for i in 0..45 {
            let source = if i % 3 == 0 { "remoteok" } else { "remotive" };
            let posting = job(&format!("Engineer {i:02}"), source, t0() + Duration::minutes(i));
            store.insert_pending(&posting).await.expect("pending");
        }

        let page = store
            .list(Stage::Pending, &ListQuery::page(PageRequest::new(2, 20).expect("page")))
            .await
            .expect("list");
        assert_eq!(page.total, 45);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.data.len(), 20);
        assert_eq!(page.data[0].job.raw.title, "Engineer 24");
        assert_eq!(page.data[19].job.raw.title, "Engineer 05");

        let filtered = store
            .list(
                Stage::Pending,
                &ListQuery::default().with_text("ENGINEER 1").with_source("remoteok"),
            )
            .await
            .expect("list");
        let titles = filtered
            .data
            .iter()
            .map(|r| r.job.raw.title.as_str())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["Engineer 18", "Engineer 15", "Engineer 12"]);
    }

    #[tokio::test]
    async fn search_treats_pattern_characters_literally() {
        let store = MemoryJobStore::new();
        store
            .insert_pending(&job("C++ Developer (100%)", "remotive", t0()))
            .await
            .expect("pending");
        store
            .insert_pending(&job("Go Developer", "remotive", t0()))
            .await
            .expect("pending");
        let page = store
            .list(Stage::Pending, &ListQuery::default().with_text("(100%)"))
            .await
            .expect("list");
        assert_eq!(page.total, 1);
        let page = store
            .list(Stage::Pending, &ListQuery::default().with_text(".*"))
            .await
            .expect("list");
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn stats_count_stages_sources_and_windows() {
        let store = MemoryJobStore::new();
        let now = t0();
        store.insert_archive(&job("a", "remotive", now)).await.expect("a");
        store
            .insert_archive(&job("b", "remotive", now - Duration::days(3)))
            .await
            .expect("b");
        let mut unsourced = job("c", "x", now - Duration::days(30));
        unsourced.raw.source = None;
        store.insert_archive(&unsourced).await.expect("c");
        store.insert_pending(&job("a", "remotive", now)).await.expect("p");

        let stats = store.stats(now).await.expect("stats");
        assert_eq!(stats.total_raw, 3);
        assert_eq!(stats.total_pending, 1);
        assert_eq!(stats.jobs_by_source.get("remotive"), Some(&2));
        assert_eq!(stats.jobs_by_source.get(UNKNOWN_SOURCE), Some(&1));
        assert_eq!(stats.jobs_today, 1);
        assert_eq!(stats.jobs_this_week, 2);
    }

    #[tokio::test]
    async fn repair_requeues_orphans_and_prunes_published_pending() {
        let store = MemoryJobStore::new();
        let orphan = job("Lost In Crash", "remotive", t0());
        store.insert_archive(&orphan).await.expect("archive only");
        store
            .insert_archive(&job("Lost In Crash", "remotive", t0() + Duration::hours(1)))
            .await
            .expect("re-sighting");

        let published = job("Published", "remotive", t0());
        store.insert_archive(&published).await.expect("archive");
        let PendingInsert::Inserted(id) = store.insert_pending(&published).await.expect("p")
        else {
            panic!("expected insert");
        };
        store.move_to_approved(id, "ops", t0()).await.expect("approve");
        plant_pending(&store, &published).await;

        let report = store.repair_coverage().await.expect("repair");
        assert_eq!(report, RepairReport { requeued: 1, pruned: 1 });

        let pending = store
            .list(Stage::Pending, &ListQuery::default())
            .await
            .expect("list");
        assert_eq!(pending.total, 1);
        assert_eq!(pending.data[0].job.raw.title, "Lost In Crash");
        assert_eq!(pending.data[0].job.ingested_at, t0() + Duration::hours(1));

        let again = store.repair_coverage().await.expect("repair again");
        assert_eq!(again, RepairReport::default());
    }
}
