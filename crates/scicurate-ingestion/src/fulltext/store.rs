//! Shared, content-addressed full-text store.
//!
//! Layout: `<root>/<h[0..2]>/<h[2..4]>/<h>.json` where `h` is the SHA-256 hex
//! digest of the record identifier. Entries are never deleted; an entry is
//! only ever created, extended with new attempts, or upgraded from
//! abstract-only to full text.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::fulltext::SourceAttempt;
use crate::models::FulltextStatus;

/// Attempts kept per entry; older ones are dropped first.
const MAX_ATTEMPTS_KEPT: usize = 32;
const LOCK_STRIPES: usize = 64;

/// One stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulltextRecord {
    /// External record identifier.
    pub id: String,
    pub doi: Option<String>,
    pub pmcid: Option<String>,
    pub abstract_text: String,
    pub full_text: Option<String>,
    pub status: FulltextStatus,
    pub structurally_complete: bool,
    /// Source that produced `full_text`.
    pub source: Option<String>,
    pub attempts: Vec<SourceAttempt>,
    /// Number of resolution passes that touched this entry.
    pub resolution_passes: u32,
    pub first_attempted_at: DateTime<Utc>,
    pub last_attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// No entry existed.
    Created,
    /// An abstract-only entry now has full text.
    Upgraded,
    /// An abstract-only entry recorded another unsuccessful pass.
    Updated,
    /// The entry already had full text; nothing was written.
    Unchanged,
}

/// Narrow interface over the shared store: read one key, upsert one key.
#[async_trait]
pub trait FulltextStore: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Option<FulltextRecord>>;

    /// Create if absent, upgrade or extend if abstract-only, never touch an
    /// entry that already has full text.
    async fn upsert(&self, record: FulltextRecord) -> anyhow::Result<UpsertOutcome>;

    /// Store key for an identifier.
    fn key_for(&self, id: &str) -> String {
        shard_key(id)
    }
}

/// SHA-256 hex digest of the identifier.
pub fn shard_key(id: &str) -> String {
    hex::encode(Sha256::digest(id.trim().as_bytes()))
}

/// Merges `incoming` into `existing` following the upsert rules.
pub fn merge(existing: Option<FulltextRecord>, incoming: FulltextRecord) -> (FulltextRecord, UpsertOutcome) {
    let Some(mut current) = existing else {
        return (incoming, UpsertOutcome::Created);
    };

    if current.status == FulltextStatus::FulltextWithBody {
        return (current, UpsertOutcome::Unchanged);
    }

    current.attempts.extend(incoming.attempts);
    if current.attempts.len() > MAX_ATTEMPTS_KEPT {
        let excess = current.attempts.len() - MAX_ATTEMPTS_KEPT;
        current.attempts.drain(..excess);
    }
    current.resolution_passes += incoming.resolution_passes.max(1);
    current.last_attempted_at = incoming.last_attempted_at;
    current.doi = current.doi.or(incoming.doi);
    current.pmcid = current.pmcid.or(incoming.pmcid);
    if !incoming.abstract_text.is_empty() {
        current.abstract_text = incoming.abstract_text;
    }

    if incoming.status == FulltextStatus::FulltextWithBody {
        current.full_text = incoming.full_text;
        current.status = FulltextStatus::FulltextWithBody;
        current.structurally_complete = incoming.structurally_complete;
        current.source = incoming.source;
        (current, UpsertOutcome::Upgraded)
    } else {
        (current, UpsertOutcome::Updated)
    }
}

/// Filesystem implementation with two-level fan-out.
pub struct ShardedFileStore {
    root: PathBuf,
    locks: Vec<Mutex<()>>,
}

impl ShardedFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for_key(&self, key: &str) -> PathBuf {
        self.root.join(&key[0..2]).join(&key[2..4]).join(format!("{key}.json"))
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let idx = u8::from_str_radix(&key[0..2], 16).unwrap_or(0) as usize % LOCK_STRIPES;
        &self.locks[idx]
    }

    async fn read(&self, path: &Path) -> anyhow::Result<Option<FulltextRecord>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let rec = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt store entry {}", path.display()))?;
                Ok(Some(rec))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a sibling temp file, then rename over the target.
    async fn write_atomic(&self, path: &Path, record: &FulltextRecord) -> anyhow::Result<()> {
        let dir = path.parent().context("store path has no parent")?;
        tokio::fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl FulltextStore for ShardedFileStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<FulltextRecord>> {
        self.read(&self.path_for_key(&shard_key(id))).await
    }

    async fn upsert(&self, record: FulltextRecord) -> anyhow::Result<UpsertOutcome> {
        let key = shard_key(&record.id);
        let path = self.path_for_key(&key);
        let _guard = self.stripe(&key).lock().await;

        let existing = self.read(&path).await?;
        let (merged, outcome) = merge(existing, record);
        if outcome != UpsertOutcome::Unchanged {
            self.write_atomic(&path, &merged).await?;
        }
        debug!(id = %merged.id, ?outcome, "Full-text store upsert");
        Ok(outcome)
    }
}
