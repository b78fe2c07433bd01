//! Embedded, file-backed semantic collection.
//!
//! This is a narrow façade — `upsert`/`query_top_k`/`list_all_ids`/`delete` —
//! over a persisted `id -> (document, embedding)` map, with real embeddings
//! generated through `embed_anything` exactly as the teacher's
//! `knowledge_graph::embedding::EmbeddingManager` does. The teacher's version
//! backs a relational tool schema in SurrealDB; this crate has no such
//! schema to join against, so the store here is a flat, serde-serialized
//! file rather than a database table.

use anyhow::{Context, Result};
use embed_anything::{
    config::TextEmbedConfig,
    embed_query,
    embeddings::embed::{Embedder, EmbedderBuilder},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const COLLECTION_NAME: &str = "nacos_mcp_router-collection";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Entry {
    document: String,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Collection {
    entries: HashMap<String, Entry>,
}

pub struct VectorIndex {
    path: PathBuf,
    embedder: Embedder,
    text_config: TextEmbedConfig,
    collection: Mutex<Collection>,
}

impl VectorIndex {
    /// Open (or create) the collection at the default persisted location,
    /// `~/.nacos_mcp_router/chroma_db`, matching the original implementation's
    /// path. Telemetry is never wired up here, so there's nothing to disable.
    pub async fn open_default() -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Self::open(home.join(".nacos_mcp_router").join("chroma_db")).await
    }

    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating vector index directory {dir:?}"))?;

        let file = dir.join(format!("{COLLECTION_NAME}.json"));
        let collection = load_collection(&file).await?;

        let embedder = EmbedderBuilder::new()
            .model_architecture("jina")
            .model_id(Some("jinaai/jina-embeddings-v2-small-en"))
            .from_pretrained_hf()?;

        Ok(Self {
            path: file,
            embedder,
            text_config: TextEmbedConfig::default(),
            collection: Mutex::new(collection),
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let queries = vec![text];
        let results = embed_query(&queries, &self.embedder, Some(&self.text_config)).await?;
        let embedding = results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embed_anything returned no embeddings for query"))?;
        Ok(embedding.embedding.to_dense()?)
    }

    async fn persist(&self, collection: &Collection) -> Result<()> {
        persist_collection(&self.path, collection).await
    }

    /// Overwrite-or-insert each id with its document and a freshly computed
    /// embedding.
    pub async fn upsert(&self, ids: &[String], documents: &[String]) -> Result<()> {
        if ids.len() != documents.len() {
            anyhow::bail!("upsert: ids and documents must be the same length");
        }

        let mut collection = self.collection.lock().await;
        for (id, document) in ids.iter().zip(documents.iter()) {
            let embedding = self.embed(document).await?;
            collection.entries.insert(
                id.clone(),
                Entry {
                    document: document.clone(),
                    embedding,
                },
            );
        }
        self.persist(&collection).await
    }

    /// Rank every stored id by cosine similarity to `query_text`, most to
    /// least similar, and return at most `k` ids.
    pub async fn query_top_k(&self, query_text: &str, k: usize) -> Result<Vec<String>> {
        let query_vector = self.embed(query_text).await?;
        let collection = self.collection.lock().await;

        let mut scored: Vec<(String, f32)> = collection
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), cosine_similarity(&query_vector, &entry.embedding)))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }

    pub async fn list_all_ids(&self) -> Vec<String> {
        self.collection
            .lock()
            .await
            .entries
            .keys()
            .cloned()
            .collect()
    }

    pub async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut collection = self.collection.lock().await;
        for id in ids {
            collection.entries.remove(id);
        }
        self.persist(&collection).await
    }
}

/// Read the persisted collection file, defaulting to empty if it doesn't
/// exist yet or has been corrupted. Kept free of the embedder so the
/// load/persist round trip can be unit-tested without a model download.
async fn load_collection(file: &Path) -> Result<Collection> {
    if !file.exists() {
        return Ok(Collection::default());
    }
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading vector index file {file:?}"))?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

async fn persist_collection(file: &Path, collection: &Collection) -> Result<()> {
    let raw = serde_json::to_string(collection)?;
    tokio::fs::write(file, raw)
        .await
        .with_context(|| format!("writing vector index file {file:?}"))
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_handles_zero_vector() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[tokio::test]
    async fn load_collection_defaults_when_file_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("missing.json");
        let collection = load_collection(&file).await.unwrap();
        assert!(collection.entries.is_empty());
    }

    #[tokio::test]
    async fn persist_then_load_round_trips_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("collection.json");

        let mut collection = Collection::default();
        collection.entries.insert(
            "weather".to_string(),
            Entry {
                document: "weather forecasts".to_string(),
                embedding: vec![0.1, 0.2, 0.3],
            },
        );

        persist_collection(&file, &collection).await.unwrap();
        let reloaded = load_collection(&file).await.unwrap();

        assert_eq!(reloaded.entries.len(), 1);
        assert_eq!(reloaded.entries["weather"].document, "weather forecasts");
        assert_eq!(reloaded.entries["weather"].embedding, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn load_collection_defaults_on_corrupted_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("corrupt.json");
        tokio::fs::write(&file, b"not json").await.unwrap();

        let collection = load_collection(&file).await.unwrap();
        assert!(collection.entries.is_empty());
    }
}
