use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Result, StoreError};

/// A registered collection: one tenant's isolated document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Collection {
    pub id: i64,
    /// Unique human label.
    pub name: String,
    /// Unique sanitized identifier all physical structures are named from.
    /// Never changes after creation, so the collection can be renamed
    /// without a storage migration.
    pub storage_key: String,
    /// Whether the ANN index has been trained for this collection.
    pub ann_indexed: bool,
    pub created_at: NaiveDateTime,
}

/// Caller-supplied chunk record for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChunk {
    pub url: String,
    pub chunk_number: i64,
    pub title: String,
    pub summary: String,
    pub content: String,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
    pub embedding: Vec<f32>,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NewChunk {
    /// Synchronous write-time validation. Non-emptiness of title/summary/
    /// content is a caller contract; the chunk key and embedding shape are
    /// not.
    #[inline]
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if self.url.is_empty() {
            return Err(StoreError::Validation(
                "chunk url must not be empty".to_string(),
            ));
        }
        if self.chunk_number < 0 {
            return Err(StoreError::Validation(format!(
                "chunk_number must not be negative: {}",
                self.chunk_number
            )));
        }
        if !self.metadata.is_object() {
            return Err(StoreError::Validation(
                "metadata must be a JSON object".to_string(),
            ));
        }
        if self.embedding.len() != dimension {
            return Err(StoreError::DimensionMismatch {
                expected: dimension,
                actual: self.embedding.len(),
            });
        }
        Ok(())
    }
}

/// A stored chunk as returned by reads and search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: i64,
    pub url: String,
    pub chunk_number: i64,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub embedding: Vec<f32>,
    pub created_at: NaiveDateTime,
}

/// Raw chunk row before the metadata document and embedding blob are
/// decoded.
#[derive(Debug, FromRow)]
pub(crate) struct ChunkRow {
    pub id: i64,
    pub url: String,
    pub chunk_number: i64,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub metadata: String,
    pub embedding: Vec<u8>,
    pub created_at: NaiveDateTime,
}

impl TryFrom<ChunkRow> for Chunk {
    type Error = StoreError;

    #[inline]
    fn try_from(row: ChunkRow) -> Result<Self> {
        let metadata = serde_json::from_str(&row.metadata)
            .map_err(|e| StoreError::Storage(format!("corrupt metadata document: {e}")))?;
        let embedding = decode_embedding(&row.embedding)?;
        Ok(Chunk {
            id: row.id,
            url: row.url,
            chunk_number: row.chunk_number,
            title: row.title,
            summary: row.summary,
            content: row.content,
            metadata,
            embedding,
            created_at: row.created_at,
        })
    }
}

/// Encode an embedding as little-endian f32 bytes for BLOB storage.
#[inline]
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian f32 BLOB back into an embedding.
#[inline]
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Storage(format!(
            "invalid embedding byte length: {}",
            blob.len()
        )));
    }
    let mut out = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}
