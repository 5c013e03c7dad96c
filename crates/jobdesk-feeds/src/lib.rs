//! Feed contract for scheduled job producers, plus the JSON bundle feed and `feeds.yaml`
//! registry used by the scheduler and the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobdesk_core::RawJob;
use jobdesk_storage::SnapshotStore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "jobdesk-feeds";

pub const REGISTRY_FILE: &str = "feeds.yaml";
pub const FEEDS_DIR: &str = "feeds";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("bundle at {path} belongs to source {declared}, expected {expected}")]
    SourceMismatch {
        path: String,
        declared: String,
        expected: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A producer of raw jobs. Output goes through batch ingestion like any other submission.
#[async_trait]
pub trait JobFeed: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<RawJob>, FeedError>;
}

/// One scraper run serialized to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedBundle {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_html: Option<String>,
    /// Sibling file holding the captured page, read when `raw_html` is not inline.
    #[serde(default)]
    pub raw_html_path: Option<String>,
    #[serde(default)]
    pub jobs: Vec<RawJob>,
}

/// Files accepted by `jobdesk ingest`: a full bundle or a bare list of jobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FeedDocument {
    Bundle(FeedBundle),
    Jobs(Vec<RawJob>),
}

impl FeedDocument {
    pub fn into_jobs(self) -> Vec<RawJob> {
        match self {
            FeedDocument::Bundle(bundle) => bundle.jobs,
            FeedDocument::Jobs(jobs) => jobs,
        }
    }
}

pub async fn load_feed_bundle(path: impl AsRef<Path>) -> Result<FeedBundle> {
    let path = path.as_ref();
    let mut bundle: FeedBundle = read_json_file(path).await?;
    hydrate_raw_html(path, &mut bundle).await?;
    Ok(bundle)
}

pub async fn load_feed_document(path: impl AsRef<Path>) -> Result<FeedDocument> {
    read_json_file(path).await
}

async fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

async fn hydrate_raw_html(bundle_path: &Path, bundle: &mut FeedBundle) -> Result<()> {
    if bundle.raw_html.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &bundle.raw_html_path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    if !fs::try_exists(&raw_path).await.unwrap_or(false) {
        debug!(path = %raw_path.display(), "raw html sibling missing; skipping snapshot");
        return Ok(());
    }
    let raw = fs::read_to_string(&raw_path)
        .await
        .with_context(|| format!("reading raw html {}", raw_path.display()))?;
    bundle.raw_html = Some(raw);
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedRegistry {
    #[serde(default)]
    pub sources: Vec<FeedSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSource {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bundle location relative to the workspace root. Defaults to `feeds/<source_id>.json`.
    #[serde(default)]
    pub path: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl FeedRegistry {
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(REGISTRY_FILE);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &FeedSource> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Build one [`JsonFileFeed`] per enabled source.
    pub fn build_feeds(
        &self,
        workspace_root: &Path,
        snapshots: Option<Arc<dyn SnapshotStore>>,
    ) -> Vec<Arc<dyn JobFeed>> {
        self.enabled()
            .map(|source| {
                let mut feed =
                    JsonFileFeed::new(&source.source_id, source.bundle_path(workspace_root));
                if let Some(store) = &snapshots {
                    feed = feed.with_snapshots(Arc::clone(store));
                }
                Arc::new(feed) as Arc<dyn JobFeed>
            })
            .collect()
    }
}

impl FeedSource {
    pub fn bundle_path(&self, workspace_root: &Path) -> PathBuf {
        match &self.path {
            Some(path) => workspace_root.join(path),
            None => workspace_root
                .join(FEEDS_DIR)
                .join(format!("{}.json", self.source_id)),
        }
    }
}

/// Feed backed by a bundle file that an external scraper rewrites between runs.
pub struct JsonFileFeed {
    source_id: String,
    path: PathBuf,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl JsonFileFeed {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            snapshots: None,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JobFeed for JsonFileFeed {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self) -> Result<Vec<RawJob>, FeedError> {
        let bundle = load_feed_bundle(&self.path).await?;
        if bundle.source_id != self.source_id {
            return Err(FeedError::SourceMismatch {
                path: self.path.display().to_string(),
                declared: bundle.source_id,
                expected: self.source_id.clone(),
            });
        }

        let snapshot_url = match (&self.snapshots, &bundle.raw_html) {
            (Some(store), Some(html)) => store.put_snapshot(&self.source_id, html.as_bytes()).await,
            _ => None,
        };

        let jobs = bundle
            .jobs
            .into_iter()
            .map(|mut job| {
                if job.source.is_none() {
                    job.source = Some(self.source_id.clone());
                }
                if job.raw_snapshot_url.is_none() {
                    job.raw_snapshot_url = snapshot_url.clone();
                }
                job
            })
            .collect::<Vec<_>>();

        info!(
            source_id = %self.source_id,
            fetched_at = %bundle.fetched_at,
            jobs = jobs.len(),
            snapshot = snapshot_url.is_some(),
            "feed bundle loaded"
        );
        Ok(jobs)
    }
}
