//! Deduplication store backends + HTTP fetch utilities for the tracker.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mrt_core::{DeduplicationRecord, Fingerprint};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod http;
pub mod postgres;

pub use http::{HttpClient, HttpClientConfig, HttpError, RetryPolicy};
pub use postgres::PgDedupStore;

pub const CRATE_NAME: &str = "mrt-storage";

#[derive(Debug, Error)]
#[error("fingerprint {fingerprint} already recorded for {company}")]
pub struct DuplicateError {
    pub company: String,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store migration: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Duplicate(#[from] DuplicateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cross-run record of fingerprints that were already turned into release events.
///
/// `record` is an atomic check-and-insert per `(company, fingerprint)`: of two
/// concurrent calls for the same key exactly one succeeds, the other gets
/// [`DuplicateError`]. Independent keys never contend on a shared lock.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn has_seen(&self, company: &str, fingerprint: &Fingerprint) -> Result<bool, StoreError>;

    async fn record(
        &self,
        company: &str,
        fingerprint: &Fingerprint,
        seen_at: DateTime<Utc>,
    ) -> Result<(), RecordError>;

    /// Maintenance only. Removes records first seen strictly before `older_than`.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

type DedupKey = (String, Fingerprint);

/// Process-local store. The `DashMap` entry API locks only the key's shard.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    records: DashMap<DedupKey, DateTime<Utc>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(company: &str, fingerprint: &Fingerprint) -> DedupKey {
        (company.to_string(), fingerprint.clone())
    }

    pub fn contains(&self, company: &str, fingerprint: &Fingerprint) -> bool {
        self.records.contains_key(&Self::key(company, fingerprint))
    }

    pub fn try_insert(
        &self,
        company: &str,
        fingerprint: &Fingerprint,
        seen_at: DateTime<Utc>,
    ) -> Result<(), DuplicateError> {
        match self.records.entry(Self::key(company, fingerprint)) {
            Entry::Occupied(_) => Err(DuplicateError {
                company: company.to_string(),
                fingerprint: fingerprint.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(seen_at);
                Ok(())
            }
        }
    }

    fn release(&self, company: &str, fingerprint: &Fingerprint) {
        self.records.remove(&Self::key(company, fingerprint));
    }

    pub fn remove_older_than(&self, older_than: DateTime<Utc>) -> usize {
        let mut removed = 0usize;
        self.records.retain(|_, first_seen| {
            let keep = *first_seen >= older_than;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot sorted by first-seen, then company and fingerprint.
    pub fn snapshot(&self) -> Vec<DeduplicationRecord> {
        let mut out = self
            .records
            .iter()
            .map(|entry| DeduplicationRecord {
                company: entry.key().0.clone(),
                fingerprint: entry.key().1.clone(),
                first_seen: *entry.value(),
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.company.cmp(&b.company))
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        out
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn has_seen(&self, company: &str, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.contains(company, fingerprint))
    }

    async fn record(
        &self,
        company: &str,
        fingerprint: &Fingerprint,
        seen_at: DateTime<Utc>,
    ) -> Result<(), RecordError> {
        self.try_insert(company, fingerprint, seen_at)?;
        Ok(())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(self.remove_older_than(older_than))
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.len())
    }
}

/// Append-only JSON-lines log backed by an in-memory index.
///
/// A key is reserved in the index before its line is appended; a failed append
/// releases the reservation so the item is retried on the next run.
#[derive(Debug)]
pub struct FileDedupStore {
    path: PathBuf,
    index: MemoryDedupStore,
    log: Mutex<()>,
}

impl FileDedupStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let index = MemoryDedupStore::new();
        if fs::try_exists(&path).await? {
            let text = fs::read_to_string(&path).await?;
            for (line_no, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<DeduplicationRecord>(line) {
                    Ok(rec) => {
                        // Repeated lines can appear after a prune raced an append.
                        let _ = index.try_insert(&rec.company, &rec.fingerprint, rec.first_seen);
                    }
                    Err(err) => {
                        warn!(path = %path.display(), line = line_no + 1, error = %err, "skipping unreadable dedup record");
                    }
                }
            }
        }
        debug!(path = %path.display(), records = index.len(), "dedup log loaded");

        Ok(Self {
            path,
            index,
            log: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &DeduplicationRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.log.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Rewrite the whole log through a temp file + atomic rename.
    async fn rewrite(&self, records: &[DeduplicationRecord]) -> Result<(), StoreError> {
        let mut body = String::new();
        for rec in records {
            body.push_str(&serde_json::to_string(rec)?);
            body.push('\n');
        }
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.dedup.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl DedupStore for FileDedupStore {
    async fn has_seen(&self, company: &str, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.index.contains(company, fingerprint))
    }

    async fn record(
        &self,
        company: &str,
        fingerprint: &Fingerprint,
        seen_at: DateTime<Utc>,
    ) -> Result<(), RecordError> {
        self.index.try_insert(company, fingerprint, seen_at)?;
        let record = DeduplicationRecord {
            company: company.to_string(),
            fingerprint: fingerprint.clone(),
            first_seen: seen_at,
        };
        if let Err(err) = self.append(&record).await {
            self.index.release(company, fingerprint);
            return Err(err.into());
        }
        Ok(())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let _guard = self.log.lock().await;
        let removed = self.index.remove_older_than(older_than);
        if removed > 0 {
            self.rewrite(&self.index.snapshot()).await?;
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.index.len())
    }
}
