//! Cron-driven feed runs. Each trigger fetches every registered feed and pushes the jobs
//! through [`IngestPipeline::ingest_all`].

use std::sync::Arc;

use anyhow::{Context, Result};
use jobdesk_feeds::JobFeed;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

use crate::ingest::{BatchReport, IngestPipeline};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedRunSummary {
    pub feeds_run: usize,
    pub feeds_failed: usize,
    pub report: BatchReport,
}

pub struct FeedScheduler {
    pipeline: Arc<IngestPipeline>,
    feeds: Vec<Arc<dyn JobFeed>>,
    cron: String,
}

impl FeedScheduler {
    pub fn new(
        pipeline: Arc<IngestPipeline>,
        feeds: Vec<Arc<dyn JobFeed>>,
        cron: impl Into<String>,
    ) -> Self {
        Self {
            pipeline,
            feeds,
            cron: cron.into(),
        }
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    /// Run every feed once. A failing feed is logged and skipped.
    pub async fn run_once(&self) -> FeedRunSummary {
        let mut summary = FeedRunSummary::default();
        for feed in &self.feeds {
            let span = info_span!("feed", source_id = %feed.source_id());
            let jobs = match feed.fetch().instrument(span.clone()).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(parent: &span, error = %err, "feed fetch failed");
                    summary.feeds_failed += 1;
                    continue;
                }
            };
            summary.feeds_run += 1;
            if jobs.is_empty() {
                continue;
            }
            summary.report += self.pipeline.ingest_all(jobs).instrument(span).await;
        }
        info!(
            feeds_run = summary.feeds_run,
            feeds_failed = summary.feeds_failed,
            inserted = summary.report.inserted,
            duplicates = summary.report.duplicates,
            errors = summary.report.errors,
            "feed run finished"
        );
        summary
    }

    /// Register the cron job and start the scheduler. The caller keeps the handle alive and
    /// shuts it down.
    pub async fn start(self: Arc<Self>) -> Result<JobScheduler> {
        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.cron.clone();
        let runner = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                runner.run_once().await;
            })
        })
        .with_context(|| format!("creating feed job for cron {cron}"))?;
        let job_id = sched.add(job).await.context("adding feed job")?;
        sched.start().await.context("starting scheduler")?;

        match sched.next_tick_for_job(job_id).await {
            Ok(Some(next)) => info!(%cron, feeds = self.feeds.len(), next_run = %next, "feed scheduler started"),
            Ok(None) => warn!(%cron, "feed job has no upcoming run"),
            Err(err) => warn!(%cron, error = %err, "could not read next feed run"),
        }
        Ok(sched)
    }
}
