//! Append-only JSONL journal of completed harvest leaves.
//!
//! One line per leaf: `{"topic": .., "range": {..}, "ids": [..]}`. A restarted
//! run that opens the same journal skips every leaf already recorded. A torn
//! final line (crash mid-write) is ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::DateRange;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub topic: String,
    pub range: DateRange,
    pub ids: Vec<String>,
}

pub struct HarvestJournal {
    path: PathBuf,
    completed: HashMap<(String, DateRange), Vec<String>>,
    /// Held while appending. True while the file ends in a torn line.
    writer: Mutex<bool>,
}

impl HarvestJournal {
    /// Opens (or starts) the journal at `path`, loading any completed leaves.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut completed = HashMap::new();
        let mut torn_tail = false;

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for (n, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JournalEntry>(line) {
                        Ok(e) => {
                            completed.insert((e.topic, e.range), e.ids);
                        }
                        Err(e) => warn!(line = n + 1, error = %e, "Skipping unreadable journal line"),
                    }
                }
                torn_tail = !content.is_empty() && !content.ends_with('\n');
                debug!(path = %path.display(), leaves = completed.len(), torn_tail, "Harvest journal loaded");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("reading journal {}", path.display())),
        }

        Ok(Self { path, completed, writer: Mutex::new(torn_tail) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifiers of a leaf completed by an earlier attempt of this run.
    pub fn completed(&self, topic: &str, range: &DateRange) -> Option<&[String]> {
        self.completed.get(&(topic.to_string(), *range)).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Appends one completed leaf.
    pub async fn record(&self, topic: &str, range: &DateRange, ids: &[String]) -> anyhow::Result<()> {
        let entry = JournalEntry { topic: topic.to_string(), range: *range, ids: ids.to_vec() };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut torn_tail = self.writer.lock().await;
        if *torn_tail {
            line.insert(0, b'\n');
        }
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening journal {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        *torn_tail = false;
        Ok(())
    }
}
