//! Postgres-backed [`JobStore`]. One table per stage; the unique fingerprint indexes on
//! `jobs_pending` and `jobs_approved` are what make duplicate-safe inserts atomic.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jobdesk_core::{
    Disposition, Fingerprint, JobRecord, ListQuery, NormalizedJob, NormalizedLocation, Page,
    RawJob, SalaryRange, Stage,
};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    disposition_stage, stats_windows, BackoffPolicy, JobStore, PendingInsert, RepairReport,
    StoreError, StoreStats, UNKNOWN_SOURCE,
};

macro_rules! job_columns {
    () => {
        "id, fingerprint, title, company, location, description, apply_url, posted_date, \
         salary, source, raw_snapshot_url, posted_date_parsed, salary_min, salary_max, \
         location_raw, location_lat, location_lon, location_display_name, tags, ingested_at"
    };
}

macro_rules! job_values {
    () => {
        "$1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20"
    };
}

const INSERT_ARCHIVE: &str = concat!(
    "INSERT INTO jobs_archive (",
    job_columns!(),
    ") VALUES (",
    job_values!(),
    ")"
);

// A fingerprint that already reached a review decision never re-enters pending.
const INSERT_PENDING: &str = concat!(
    "INSERT INTO jobs_pending (",
    job_columns!(),
    ") SELECT ",
    job_values!(),
    " WHERE $2::text IS NULL OR (",
    "NOT EXISTS (SELECT 1 FROM jobs_approved a WHERE a.fingerprint = $2) ",
    "AND NOT EXISTS (SELECT 1 FROM jobs_rejected r WHERE r.fingerprint = $2)",
    ") ON CONFLICT (fingerprint) DO NOTHING RETURNING id"
);

const INSERT_APPROVED: &str = concat!(
    "INSERT INTO jobs_approved (",
    job_columns!(),
    ", approved_at, approved_by) VALUES (",
    job_values!(),
    ", $21, $22) ON CONFLICT (fingerprint) DO NOTHING RETURNING id"
);

const INSERT_REJECTED: &str = concat!(
    "INSERT INTO jobs_rejected (",
    job_columns!(),
    ", rejected_at, rejected_by, rejection_reason) VALUES (",
    job_values!(),
    ", $21, $22, $23)"
);

const TAKE_PENDING: &str = concat!(
    "DELETE FROM jobs_pending WHERE id = $1 RETURNING ",
    job_columns!()
);

const PRUNE_PUBLISHED_PENDING: &str = "DELETE FROM jobs_pending p USING jobs_approved a \
     WHERE p.fingerprint = a.fingerprint";

const REQUEUE_ORPHANS: &str = concat!(
    "INSERT INTO jobs_pending (",
    job_columns!(),
    ") SELECT DISTINCT ON (ar.fingerprint) gen_random_uuid(), ar.fingerprint, ar.title, \
     ar.company, ar.location, ar.description, ar.apply_url, ar.posted_date, ar.salary, \
     ar.source, ar.raw_snapshot_url, ar.posted_date_parsed, ar.salary_min, ar.salary_max, \
     ar.location_raw, ar.location_lat, ar.location_lon, ar.location_display_name, ar.tags, \
     ar.ingested_at \
     FROM jobs_archive ar \
     WHERE ar.fingerprint IS NOT NULL \
       AND NOT EXISTS (SELECT 1 FROM jobs_pending p WHERE p.fingerprint = ar.fingerprint) \
       AND NOT EXISTS (SELECT 1 FROM jobs_approved a WHERE a.fingerprint = ar.fingerprint) \
       AND NOT EXISTS (SELECT 1 FROM jobs_rejected r WHERE r.fingerprint = ar.fingerprint) \
     ORDER BY ar.fingerprint, ar.ingested_at DESC \
     ON CONFLICT (fingerprint) DO NOTHING"
);

const STAGE_COUNTS: &str = "SELECT \
     (SELECT COUNT(*) FROM jobs_archive) AS total_raw, \
     (SELECT COUNT(*) FROM jobs_pending) AS total_pending, \
     (SELECT COUNT(*) FROM jobs_approved) AS total_approved, \
     (SELECT COUNT(*) FROM jobs_rejected) AS total_rejected, \
     (SELECT COUNT(*) FROM jobs_archive WHERE ingested_at >= $1) AS jobs_today, \
     (SELECT COUNT(*) FROM jobs_archive WHERE ingested_at >= $2) AS jobs_this_week";

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
    retry: BackoffPolicy,
}

impl PgJobStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(&config.database_url)?.options([(
            "statement_timeout",
            format!("{}ms", config.statement_timeout.as_millis()),
        )]);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;
        debug!(max_connections = config.max_connections, "postgres pool ready");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            retry: BackoffPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("lifecycle schema migrated");
        Ok(())
    }

    async fn get_once(&self, stage: Stage, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            select_columns(stage),
            table_for(stage)
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| record_from_row(stage, &row)).transpose()
    }

    async fn list_once(
        &self,
        stage: Stage,
        query: &ListQuery,
    ) -> Result<Page<JobRecord>, StoreError> {
        let mut counter = filtered_select(stage, "COUNT(*)", query);
        let total: i64 = counter
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut select = filtered_select(stage, &select_columns(stage), query);
        select
            .push(" ORDER BY ")
            .push(order_column(stage))
            .push(" DESC, id LIMIT ")
            .push_bind(i64::from(query.page.per_page()))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.page.offset()).unwrap_or(i64::MAX));
        let rows = select.build().fetch_all(&self.pool).await?;
        let data = rows
            .iter()
            .map(|row| record_from_row(stage, row))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::new(query.page, total.max(0) as u64, data))
    }

    async fn count_once(&self, stage: Stage) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table_for(stage));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn stats_once(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        let (today, week) = stats_windows(now);
        let by_source = sqlx::query(
            "SELECT COALESCE(source, $1) AS source, COUNT(*) AS jobs \
             FROM jobs_archive GROUP BY 1",
        )
        .bind(UNKNOWN_SOURCE)
        .fetch_all(&self.pool)
        .await?;
        let mut jobs_by_source = BTreeMap::new();
        for source_row in by_source {
            let source: String = source_row.try_get("source")?;
            let jobs: i64 = source_row.try_get("jobs")?;
            jobs_by_source.insert(source, jobs.max(0) as u64);
        }

        let row = sqlx::query(STAGE_COUNTS)
            .bind(today)
            .bind(week)
            .fetch_one(&self.pool)
            .await?;
        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row.try_get(column)?;
            Ok(value.max(0) as u64)
        };

        Ok(StoreStats {
            total_raw: count("total_raw")?,
            total_pending: count("total_pending")?,
            total_approved: count("total_approved")?,
            total_rejected: count("total_rejected")?,
            jobs_by_source,
            jobs_today: count("jobs_today")?,
            jobs_this_week: count("jobs_this_week")?,
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_archive(&self, job: &NormalizedJob) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        bind_job(sqlx::query(INSERT_ARCHIVE), id, job)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn insert_pending(&self, job: &NormalizedJob) -> Result<PendingInsert, StoreError> {
        let row = bind_job(sqlx::query(INSERT_PENDING), Uuid::new_v4(), job)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(PendingInsert::Inserted(row.try_get("id")?)),
            None => Ok(PendingInsert::Duplicate),
        }
    }

    async fn get(&self, stage: Stage, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        self.retry
            .retry_read("get", move || self.get_once(stage, id))
            .await
    }

    async fn list(&self, stage: Stage, query: &ListQuery) -> Result<Page<JobRecord>, StoreError> {
        self.retry
            .retry_read("list", move || self.list_once(stage, query))
            .await
    }

    async fn count(&self, stage: Stage) -> Result<u64, StoreError> {
        self.retry
            .retry_read("count", move || self.count_once(stage))
            .await
    }

    async fn move_from_pending(
        &self,
        id: Uuid,
        disposition: Disposition,
    ) -> Result<JobRecord, StoreError> {
        let target = disposition_stage(&disposition);
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query(TAKE_PENDING)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Err(StoreError::NotFound {
                stage: Stage::Pending,
                id,
            });
        };
        let mut record = record_from_row(Stage::Pending, &row)?;

        match &disposition {
            Disposition::Approved {
                approved_at,
                approved_by,
            } => {
                let inserted = bind_job(sqlx::query(INSERT_APPROVED), record.id, &record.job)
                    .bind(*approved_at)
                    .bind(approved_by.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
                if inserted.is_none() {
                    // Dropping the transaction restores the pending row.
                    let fingerprint = record.job.fingerprint.clone().ok_or_else(|| {
                        StoreError::Corrupt {
                            stage: target,
                            id: id.to_string(),
                            reason: "conflict on a record without fingerprint".to_string(),
                        }
                    })?;
                    return Err(StoreError::Duplicate {
                        stage: target,
                        fingerprint,
                    });
                }
            }
            Disposition::Rejected {
                rejected_at,
                rejected_by,
                rejection_reason,
            } => {
                bind_job(sqlx::query(INSERT_REJECTED), record.id, &record.job)
                    .bind(*rejected_at)
                    .bind(rejected_by.as_str())
                    .bind(rejection_reason.as_str())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        record.disposition = Some(disposition);
        Ok(record)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        self.retry
            .retry_read("stats", move || self.stats_once(now))
            .await
    }

    async fn repair_coverage(&self) -> Result<RepairReport, StoreError> {
        let mut tx = self.pool.begin().await?;
        let pruned = sqlx::query(PRUNE_PUBLISHED_PENDING)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let requeued = sqlx::query(REQUEUE_ORPHANS)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(RepairReport { requeued, pruned })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn table_for(stage: Stage) -> &'static str {
    match stage {
        Stage::Archive => "jobs_archive",
        Stage::Pending => "jobs_pending",
        Stage::Approved => "jobs_approved",
        Stage::Rejected => "jobs_rejected",
    }
}

fn select_columns(stage: Stage) -> String {
    match stage {
        Stage::Approved => format!("{}, approved_at, approved_by", job_columns!()),
        Stage::Rejected => format!(
            "{}, rejected_at, rejected_by, rejection_reason",
            job_columns!()
        ),
        Stage::Archive | Stage::Pending => job_columns!().to_string(),
    }
}

fn order_column(stage: Stage) -> &'static str {
    match stage {
        Stage::Approved => "approved_at",
        Stage::Rejected => "rejected_at",
        Stage::Archive | Stage::Pending => "ingested_at",
    }
}

/// Escape `%`, `_` and `\` so user text matches literally under ILIKE.
fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn filtered_select<'a>(
    stage: Stage,
    projection: &str,
    query: &ListQuery,
) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {projection} FROM {} WHERE TRUE",
        table_for(stage)
    ));

    if let Some(text) = query.search_text() {
        let pattern = like_pattern(&text);
        builder
            .push(" AND (title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR company ILIKE ")
            .push_bind(pattern.clone());
        if stage == Stage::Approved {
            builder.push(" OR location ILIKE ").push_bind(pattern);
        }
        builder.push(")");
    }
    if let Some(source) = query.source_filter() {
        builder.push(" AND source = ").push_bind(source.to_string());
    }
    if let Some(location) = query.location_text() {
        builder
            .push(" AND location ILIKE ")
            .push_bind(like_pattern(&location));
    }
    builder
}

fn bind_job<'q>(
    query: Query<'q, Postgres, PgArguments>,
    id: Uuid,
    job: &'q NormalizedJob,
) -> Query<'q, Postgres, PgArguments> {
    let raw = &job.raw;
    let location = job.location_normalized.as_ref();
    query
        .bind(id)
        .bind(job.fingerprint.as_ref().map(Fingerprint::as_str))
        .bind(raw.title.as_str())
        .bind(raw.company.as_str())
        .bind(raw.location.as_deref())
        .bind(raw.description.as_deref())
        .bind(raw.apply_url.as_deref())
        .bind(raw.posted_date.as_deref())
        .bind(raw.salary.as_deref())
        .bind(raw.source.as_deref())
        .bind(raw.raw_snapshot_url.as_deref())
        .bind(job.posted_date_parsed)
        .bind(job.salary_parsed.map(|s| s.min))
        .bind(job.salary_parsed.map(|s| s.max))
        .bind(location.map(|l| l.raw.as_str()))
        .bind(location.and_then(|l| l.lat))
        .bind(location.and_then(|l| l.lon))
        .bind(location.and_then(|l| l.display_name.as_deref()))
        .bind(job.tags.iter().cloned().collect::<Vec<String>>())
        .bind(job.ingested_at)
}

fn record_from_row(stage: Stage, row: &PgRow) -> Result<JobRecord, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let corrupt = |reason: &str| StoreError::Corrupt {
        stage,
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let fingerprint = match row.try_get::<Option<String>, _>("fingerprint")? {
        Some(value) => Some(Fingerprint::parse(&value).ok_or_else(|| corrupt("bad fingerprint"))?),
        None => None,
    };
    let salary_parsed = match (
        row.try_get::<Option<i64>, _>("salary_min")?,
        row.try_get::<Option<i64>, _>("salary_max")?,
    ) {
        (Some(min), Some(max)) => Some(SalaryRange { min, max }),
        (None, None) => None,
        _ => return Err(corrupt("half-populated salary range")),
    };
    let location_normalized = row
        .try_get::<Option<String>, _>("location_raw")?
        .map(|raw| -> Result<NormalizedLocation, StoreError> {
            Ok(NormalizedLocation {
                raw,
                lat: row.try_get("location_lat")?,
                lon: row.try_get("location_lon")?,
                display_name: row.try_get("location_display_name")?,
            })
        })
        .transpose()?;
    let tags: Vec<String> = row.try_get("tags")?;

    let job = NormalizedJob {
        raw: RawJob {
            title: row.try_get("title")?,
            company: row.try_get("company")?,
            location: row.try_get("location")?,
            description: row.try_get("description")?,
            apply_url: row.try_get("apply_url")?,
            posted_date: row.try_get("posted_date")?,
            salary: row.try_get("salary")?,
            source: row.try_get("source")?,
            raw_snapshot_url: row.try_get("raw_snapshot_url")?,
        },
        fingerprint,
        posted_date_parsed: row.try_get::<Option<NaiveDate>, _>("posted_date_parsed")?,
        salary_parsed,
        location_normalized,
        tags: tags.into_iter().collect(),
        ingested_at: row.try_get("ingested_at")?,
    };

    let disposition = match stage {
        Stage::Approved => Some(Disposition::Approved {
            approved_at: row.try_get("approved_at")?,
            approved_by: row.try_get("approved_by")?,
        }),
        Stage::Rejected => Some(Disposition::Rejected {
            rejected_at: row.try_get("rejected_at")?,
            rejected_by: row.try_get("rejected_by")?,
            rejection_reason: row.try_get("rejection_reason")?,
        }),
        Stage::Archive | Stage::Pending => None,
    };

    Ok(JobRecord {
        id,
        job,
        disposition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobdesk_core::PageRequest;
    use std::collections::BTreeSet;

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(like_pattern("rust"), "%rust%");
        assert_eq!(like_pattern("100%_off\\"), "%100\\%\\_off\\\\%");
    }

    #[test]
    fn insert_statements_carry_every_column() {
        assert!(INSERT_PENDING.contains("ON CONFLICT (fingerprint) DO NOTHING"));
        assert!(INSERT_PENDING.contains("NOT EXISTS (SELECT 1 FROM jobs_approved"));
        assert!(INSERT_PENDING.contains("NOT EXISTS (SELECT 1 FROM jobs_rejected"));
        assert!(INSERT_APPROVED.ends_with("RETURNING id"));
        assert!(INSERT_REJECTED.contains("rejection_reason"));
        assert!(!INSERT_ARCHIVE.contains("ON CONFLICT"));
        assert_eq!(job_columns!().split(',').count(), 20);
    }

    #[test]
    fn approved_search_also_matches_location() {
        let query = ListQuery::page(PageRequest::default()).with_text("berlin");
        let approved = filtered_select(Stage::Approved, "COUNT(*)", &query).into_sql();
        let pending = filtered_select(Stage::Pending, "COUNT(*)", &query).into_sql();
        assert!(approved.contains("location ILIKE"));
        assert!(!pending.contains("location ILIKE"));
        assert!(approved.starts_with("SELECT COUNT(*) FROM jobs_approved"));
    }

    fn sample(title: &str, now: DateTime<Utc>) -> NormalizedJob {
        let raw = RawJob {
            location: Some("Berlin".to_string()),
            salary: Some("$90,000 - $120,000".to_string()),
            source: Some("remotive".to_string()),
            ..RawJob::new(title, "Acme")
        };
        NormalizedJob {
            fingerprint: Some(raw.fingerprint()),
            raw,
            posted_date_parsed: NaiveDate::from_ymd_opt(2024, 1, 15),
            salary_parsed: Some(SalaryRange {
                min: 90_000,
                max: 120_000,
            }),
            location_normalized: Some(NormalizedLocation::raw_only("Berlin")),
            tags: BTreeSet::from(["source:remotive".to_string()]),
            ingested_at: now,
        }
    }

    /// Runs only when `JOBDESK_TEST_DATABASE_URL` points at a disposable database.
    #[tokio::test]
    async fn postgres_lifecycle_round_trip() {
        let Ok(url) = std::env::var("JOBDESK_TEST_DATABASE_URL") else {
            return;
        };
        let store = PgJobStore::connect(&PgStoreConfig::new(url))
            .await
            .expect("connect");
        store.migrate().await.expect("migrate");
        for stage in Stage::ALL {
            sqlx::query(&format!("TRUNCATE {}", table_for(stage)))
                .execute(store.pool())
                .await
                .expect("truncate");
        }

        let now = Utc::now();
        let job = sample("Postgres Engineer", now);
        store.insert_archive(&job).await.expect("archive");
        let PendingInsert::Inserted(id) = store.insert_pending(&job).await.expect("pending")
        else {
            panic!("first insert should land");
        };
        assert_eq!(
            store.insert_pending(&job).await.expect("second pending"),
            PendingInsert::Duplicate
        );

        let fetched = store
            .get(Stage::Pending, id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.job, job_with_truncated_time(&job, &fetched.job));

        let approved = store.move_to_approved(id, "admin", now).await.expect("approve");
        assert_eq!(approved.id, id);
        assert!(matches!(
            store.move_to_rejected(id, "admin", "late", now).await,
            Err(StoreError::NotFound { .. })
        ));

        let page = store
            .list(
                Stage::Approved,
                &ListQuery::page(PageRequest::default()).with_text("berlin"),
            )
            .await
            .expect("list");
        assert_eq!(page.total, 1);

        store.insert_archive(&job).await.expect("re-sighting archived");
        assert_eq!(
            store.insert_pending(&job).await.expect("re-sighting"),
            PendingInsert::Duplicate
        );
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 0);

        let spam = sample("Spam Posting", now);
        let PendingInsert::Inserted(spam_id) = store.insert_pending(&spam).await.expect("spam")
        else {
            panic!("spam insert should land");
        };
        store
            .move_to_rejected(spam_id, "admin", "spam", now)
            .await
            .expect("reject");
        assert_eq!(
            store.insert_pending(&spam).await.expect("spam again"),
            PendingInsert::Duplicate
        );
        assert_eq!(store.count(Stage::Pending).await.expect("count"), 0);
        assert_eq!(store.count(Stage::Rejected).await.expect("count"), 1);

        let stats = store.stats(now).await.expect("stats");
        assert_eq!(stats.total_raw, 2);
        assert_eq!(stats.total_approved, 1);
        assert_eq!(stats.jobs_by_source.get("remotive"), Some(&2));

        let report = store.repair_coverage().await.expect("repair");
        assert_eq!(report, RepairReport::default());
        store.close().await;
    }

    // Postgres keeps microseconds; compare against the stored timestamp.
    fn job_with_truncated_time(expected: &NormalizedJob, stored: &NormalizedJob) -> NormalizedJob {
        NormalizedJob {
            ingested_at: stored.ingested_at,
            ..expected.clone()
        }
    }
}
