//! Seed bootstrap for a fresh deployment.
//!
//! On first startup with an empty collection, a JSONL file of
//! `{id, vector, payload}` records populates the index so the server can
//! answer questions before any ingestion happens.

use std::path::Path;

use serde::Deserialize;

use crate::db::index::{ChunkPayload, IndexPoint, VectorIndex};
use crate::types::{AppError, Result};

#[derive(Deserialize)]
struct SeedRecord {
    id: String,
    vector: Vec<f32>,
    payload: ChunkPayload,
}

/// Load seed points into `collection` if (and only if) it is empty.
///
/// Returns the number of points inserted; 0 when the collection already
/// holds data or the file contains no records.
pub async fn bootstrap_from_file(
    index: &dyn VectorIndex,
    collection: &str,
    path: &Path,
) -> Result<usize> {
    if index.count(collection).await? > 0 {
        tracing::debug!(collection, "collection already populated, skipping seed");
        return Ok(0);
    }

    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::Configuration(format!("failed to read seed file: {}", e)))?;

    let mut points = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: SeedRecord = serde_json::from_str(line).map_err(|e| {
            AppError::Configuration(format!("bad seed record on line {}: {}", line_no + 1, e))
        })?;
        points.push(IndexPoint {
            id: record.id,
            vector: record.vector,
            payload: record.payload,
        });
    }

    let count = points.len();
    if count > 0 {
        index.upsert(collection, points).await?;
        tracing::info!(collection, count, "seeded collection from bootstrap file");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::index::MemoryIndex;
    use std::io::Write;

    fn seed_line(id: &str, v: f32) -> String {
        format!(
            r#"{{"id": "{}", "vector": [{}, 0.0], "payload": {{"text": "t", "source": "seed"}}}}"#,
            id, v
        )
    }

    #[tokio::test]
    async fn test_bootstrap_populates_empty_collection() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 2).await.unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", seed_line("s1", 1.0)).unwrap();
        writeln!(file, "{}", seed_line("s2", 0.5)).unwrap();

        let loaded = bootstrap_from_file(&index, "docs", file.path())
            .await
            .unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(index.count("docs").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_skips_populated_collection() {
        let index = MemoryIndex::new();
        index.ensure_collection("docs", 2).await.unwrap();
        index
            .upsert(
                "docs",
                vec![IndexPoint {
                    id: "existing".into(),
                    vector: vec![1.0, 0.0],
                    payload: ChunkPayload::default(),
                }],
            )
            .await
            .unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", seed_line("s1", 1.0)).unwrap();

        let loaded = bootstrap_from_file(&index, "docs", file.path())
            .await
            .unwrap();
        assert_eq!(loaded, 0);
        assert_eq!(index.count("docs").await.unwrap(), 1);
    }
}
