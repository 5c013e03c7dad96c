//! Raw HTML captured by feeds, filed as `<source>/<YYYY-MM-DD>/<sha256>.html`.
//!
//! A snapshot file is never rewritten once published: identical bytes captured again on
//! the same day for the same source resolve to the existing file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// Object-store capability: persist a snapshot and return a URL, or `None` when unavailable.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put_snapshot(&self, source: &str, html: &[u8]) -> Option<String>;
}

/// Where a snapshot landed. `reused` is set when the file already existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub source: String,
    pub day: NaiveDate,
    pub digest: String,
    pub key: String,
    pub path: PathBuf,
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base_url: None,
        }
    }

    /// Serve snapshot URLs from `base_url` instead of `file://` paths.
    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Slash-separated key of a snapshot, relative to the store root.
    pub fn key(source: &str, day: NaiveDate, html: &[u8]) -> String {
        format!("{}/{day}/{}.html", source_dir(source), digest(html))
    }

    pub fn url(&self, snapshot: &StoredSnapshot) -> String {
        match &self.public_base_url {
            Some(base) => format!("{base}/{}", snapshot.key),
            None => format!("file://{}", snapshot.path.display()),
        }
    }

    /// Snapshots kept for `source`, oldest day first.
    pub async fn list(&self, source: &str) -> anyhow::Result<Vec<String>> {
        let dir = self.root.join(source_dir(source));
        let mut days = match fs::read_dir(&dir).await {
            Ok(days) => days,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
        };

        let mut keys = Vec::new();
        while let Some(day) = days.next_entry().await? {
            let Some(day_name) = day.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let mut files = fs::read_dir(day.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.ends_with(".html") && !name.starts_with('.') {
                    keys.push(format!("{}/{day_name}/{name}", source_dir(source)));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Write `html` under its source/day key. The bytes go to a private staging file first
    /// and are published with a hard link, which fails rather than clobbering an existing
    /// snapshot, so readers never observe a partial file.
    pub async fn save(
        &self,
        source: &str,
        captured_at: DateTime<Utc>,
        html: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let day = captured_at.date_naive();
        let key = Self::key(source, day, html);
        let path = self.root.join(&key);
        let dir = self.root.join(source_dir(source)).join(day.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let snapshot = StoredSnapshot {
            source: source_dir(source),
            day,
            digest: digest(html),
            key,
            path,
            reused: false,
        };

        let staging = dir.join(format!(".staging-{}", Uuid::new_v4().simple()));
        fs::write(&staging, html)
            .await
            .with_context(|| format!("staging snapshot {}", staging.display()))?;
        let published = fs::hard_link(&staging, &snapshot.path).await;
        if let Err(err) = fs::remove_file(&staging).await {
            debug!(path = %staging.display(), error = %err, "staging file left behind");
        }

        match published {
            Ok(()) => Ok(snapshot),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(StoredSnapshot {
                reused: true,
                ..snapshot
            }),
            Err(err) => Err(err)
                .with_context(|| format!("publishing snapshot {}", snapshot.path.display())),
        }
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn put_snapshot(&self, source: &str, html: &[u8]) -> Option<String> {
        match self.save(source, Utc::now(), html).await {
            Ok(snapshot) => Some(self.url(&snapshot)),
            Err(err) => {
                warn!(source, error = %err, "snapshot write failed");
                None
            }
        }
    }
}

fn digest(html: &[u8]) -> String {
    hex::encode(Sha256::digest(html))
}

/// Source names become a single lowercase path segment.
fn source_dir(source: &str) -> String {
    let segment: String = source
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect();
    if segment.is_empty() {
        "unknown".to_string()
    } else {
        segment
    }
}
