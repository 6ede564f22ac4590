//! Corpus snapshot: one JSON record per line, full-text pointer included.

use std::path::Path;

use anyhow::Context;
use scicurate_ingestion::Record;

use super::write_atomic;

/// Serialises `records` and atomically replaces the snapshot at `path`.
pub async fn write(path: &Path, records: &[Record]) -> anyhow::Result<()> {
    let mut buf = Vec::with_capacity(records.len() * 1024);
    for r in records {
        serde_json::to_writer(&mut buf, r)?;
        buf.push(b'\n');
    }
    write_atomic(path, &buf).await
}

/// Reads a snapshot; a missing file is an empty corpus.
pub async fn read(path: &Path) -> anyhow::Result<Vec<Record>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("{}:{}: invalid snapshot line", path.display(), i + 1))
        })
        .collect()
}
