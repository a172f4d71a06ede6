use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use super::models::{Chunk, ChunkRow, Collection, NewChunk, encode_embedding};
use crate::{Result, StoreError};

/// Longest accepted storage key. Keeps derived physical names comfortably
/// inside SQLite and filesystem identifier limits.
pub const MAX_STORAGE_KEY_LEN: usize = 64;

/// Reject any storage key that is not lowercase alphanumeric/underscore.
/// Every physical structure name is formatted from the key, so this
/// allow-list runs before any DDL string is built.
#[inline]
pub fn validate_storage_key(storage_key: &str) -> Result<()> {
    if storage_key.is_empty() || storage_key.len() > MAX_STORAGE_KEY_LEN {
        return Err(StoreError::Validation(format!(
            "storage key must be 1-{MAX_STORAGE_KEY_LEN} characters: {storage_key:?}"
        )));
    }
    if !storage_key
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(StoreError::Validation(format!(
            "storage key may only contain [a-z0-9_]: {storage_key:?}"
        )));
    }
    Ok(())
}

/// Derive a storage key from a collection name: lowercase, with every
/// non-alphanumeric run collapsed to a single underscore.
#[inline]
pub fn derive_storage_key(name: &str) -> Result<String> {
    let mut key = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            key.push('_');
            last_was_sep = true;
        }
    }
    let key = key.trim_end_matches('_').to_string();
    validate_storage_key(&key)?;
    Ok(key)
}

/// Name of the chunk table for a collection.
#[inline]
pub fn chunk_table(storage_key: &str) -> String {
    format!("chunks_{storage_key}")
}

/// Name of the metadata inverted-index table for a collection.
#[inline]
pub fn meta_table(storage_key: &str) -> String {
    format!("chunks_{storage_key}_meta")
}

pub struct CollectionQueries;

impl CollectionQueries {
    /// Register a collection. The UNIQUE constraints on `name` and
    /// `storage_key` make registration atomic under concurrent races; a
    /// violation surfaces as `DuplicateName`, never a partial entry.
    #[inline]
    pub async fn register(pool: &SqlitePool, name: &str, storage_key: &str) -> Result<Collection> {
        let now = Utc::now().naive_utc();
        let id = sqlx::query(
            "INSERT INTO collections (name, storage_key, created_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(storage_key)
        .bind(now)
        .execute(pool)
        .await
        .map_err(|e| {
            if StoreError::is_unique_violation(&e) {
                StoreError::DuplicateName(name.to_string())
            } else {
                e.into()
            }
        })?
        .last_insert_rowid();

        Self::get_by_id(pool, id)
            .await?
            .ok_or_else(|| StoreError::Storage("failed to read back registered collection".to_string()))
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Collection>> {
        let collection = sqlx::query_as::<_, Collection>(
            "SELECT id, name, storage_key, ann_indexed, created_at FROM collections WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(collection)
    }

    #[inline]
    pub async fn get_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Collection>> {
        let collection = sqlx::query_as::<_, Collection>(
            "SELECT id, name, storage_key, ann_indexed, created_at FROM collections WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(pool)
        .await?;
        Ok(collection)
    }

    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Collection>> {
        let collections = sqlx::query_as::<_, Collection>(
            "SELECT id, name, storage_key, ann_indexed, created_at FROM collections ORDER BY name",
        )
        .fetch_all(pool)
        .await?;
        Ok(collections)
    }

    #[inline]
    pub async fn remove(pool: &SqlitePool, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[inline]
    pub async fn mark_ann_indexed(pool: &SqlitePool, id: i64, indexed: bool) -> Result<()> {
        sqlx::query("UPDATE collections SET ann_indexed = ? WHERE id = ?")
            .bind(indexed)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

pub struct ChunkQueries;

impl ChunkQueries {
    /// Create the chunk table and metadata index for a collection.
    /// Idempotent; all statements run in one transaction so a failure
    /// leaves no partial schema visible.
    #[inline]
    pub async fn create_schema(pool: &SqlitePool, storage_key: &str) -> Result<()> {
        validate_storage_key(storage_key)?;
        let chunks = chunk_table(storage_key);
        let meta = meta_table(storage_key);

        let mut tx = pool.begin().await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {chunks} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                chunk_number INTEGER NOT NULL,
                title TEXT NOT NULL,
                summary TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{{}}',
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (url, chunk_number)
            )"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {meta} (
                chunk_id INTEGER NOT NULL REFERENCES {chunks}(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                value TEXT NOT NULL
            )"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {meta}_idx ON {meta} (path, value, chunk_id)"
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("Provisioned chunk schema for storage key {}", storage_key);
        Ok(())
    }

    #[inline]
    pub async fn drop_schema(pool: &SqlitePool, storage_key: &str) -> Result<()> {
        validate_storage_key(storage_key)?;
        let chunks = chunk_table(storage_key);
        let meta = meta_table(storage_key);

        let mut tx = pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {meta}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {chunks}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[inline]
    pub async fn schema_exists(pool: &SqlitePool, storage_key: &str) -> Result<bool> {
        validate_storage_key(storage_key)?;
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(chunk_table(storage_key))
        .fetch_one(pool)
        .await?;
        Ok(count > 0)
    }

    /// Insert or replace the chunk matching `(url, chunk_number)`. The
    /// UNIQUE constraint is the conflict-resolution point: concurrent
    /// upserts of the same key serialize to a single winner. `id` and
    /// `created_at` survive the upsert; every caller-supplied field is
    /// replaced. The metadata inverted-index rows are refreshed in the
    /// same transaction.
    #[inline]
    pub async fn upsert(
        pool: &SqlitePool,
        storage_key: &str,
        chunk: &NewChunk,
        meta_pairs: &[(String, String)],
    ) -> Result<i64> {
        validate_storage_key(storage_key)?;
        let chunks = chunk_table(storage_key);
        let meta = meta_table(storage_key);

        let metadata = serde_json::to_string(&chunk.metadata)
            .map_err(|e| StoreError::Storage(format!("failed to serialize metadata: {e}")))?;
        let embedding = encode_embedding(&chunk.embedding);
        let now = Utc::now().naive_utc();

        let mut tx = pool.begin().await?;
        let id = sqlx::query_scalar::<_, i64>(&format!(
            "INSERT INTO {chunks}
                (url, chunk_number, title, summary, content, metadata, embedding, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (url, chunk_number) DO UPDATE SET
                title = excluded.title,
                summary = excluded.summary,
                content = excluded.content,
                metadata = excluded.metadata,
                embedding = excluded.embedding
             RETURNING id"
        ))
        .bind(&chunk.url)
        .bind(chunk.chunk_number)
        .bind(&chunk.title)
        .bind(&chunk.summary)
        .bind(&chunk.content)
        .bind(&metadata)
        .bind(&embedding)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(&format!("DELETE FROM {meta} WHERE chunk_id = ?"))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for (path, value) in meta_pairs {
            sqlx::query(&format!(
                "INSERT INTO {meta} (chunk_id, path, value) VALUES (?, ?, ?)"
            ))
            .bind(id)
            .bind(path)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(id)
    }

    #[inline]
    pub async fn get_by_key(
        pool: &SqlitePool,
        storage_key: &str,
        url: &str,
        chunk_number: i64,
    ) -> Result<Option<Chunk>> {
        validate_storage_key(storage_key)?;
        let row = sqlx::query_as::<_, ChunkRow>(&format!(
            "SELECT id, url, chunk_number, title, summary, content, metadata, embedding, created_at
             FROM {} WHERE url = ? AND chunk_number = ?",
            chunk_table(storage_key)
        ))
        .bind(url)
        .bind(chunk_number)
        .fetch_optional(pool)
        .await?;
        row.map(Chunk::try_from).transpose()
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, storage_key: &str, id: i64) -> Result<Option<Chunk>> {
        validate_storage_key(storage_key)?;
        let row = sqlx::query_as::<_, ChunkRow>(&format!(
            "SELECT id, url, chunk_number, title, summary, content, metadata, embedding, created_at
             FROM {} WHERE id = ?",
            chunk_table(storage_key)
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        row.map(Chunk::try_from).transpose()
    }

    /// Delete by chunk key, returning the removed chunk's id.
    #[inline]
    pub async fn delete_by_key(
        pool: &SqlitePool,
        storage_key: &str,
        url: &str,
        chunk_number: i64,
    ) -> Result<Option<i64>> {
        validate_storage_key(storage_key)?;
        let id = sqlx::query_scalar::<_, i64>(&format!(
            "DELETE FROM {} WHERE url = ? AND chunk_number = ? RETURNING id",
            chunk_table(storage_key)
        ))
        .bind(url)
        .bind(chunk_number)
        .fetch_optional(pool)
        .await?;
        Ok(id)
    }

    #[inline]
    pub async fn delete_by_id(pool: &SqlitePool, storage_key: &str, id: i64) -> Result<bool> {
        validate_storage_key(storage_key)?;
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ?",
            chunk_table(storage_key)
        ))
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[inline]
    pub async fn count(pool: &SqlitePool, storage_key: &str) -> Result<i64> {
        validate_storage_key(storage_key)?;
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {}",
            chunk_table(storage_key)
        ))
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Load every chunk of a collection, in id order. The exact-scan search
    /// path for small collections.
    #[inline]
    pub async fn scan(pool: &SqlitePool, storage_key: &str) -> Result<Vec<Chunk>> {
        validate_storage_key(storage_key)?;
        let rows = sqlx::query_as::<_, ChunkRow>(&format!(
            "SELECT id, url, chunk_number, title, summary, content, metadata, embedding, created_at
             FROM {} ORDER BY id",
            chunk_table(storage_key)
        ))
        .fetch_all(pool)
        .await?;
        rows.into_iter().map(Chunk::try_from).collect()
    }

    /// Load the chunks with the given ids (missing ids are skipped).
    #[inline]
    pub async fn get_many(pool: &SqlitePool, storage_key: &str, ids: &[i64]) -> Result<Vec<Chunk>> {
        validate_storage_key(storage_key)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, url, chunk_number, title, summary, content, metadata, embedding, created_at
             FROM {} WHERE id IN ({placeholders})",
            chunk_table(storage_key)
        );
        let mut query = sqlx::query_as::<_, ChunkRow>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(pool).await?;
        rows.into_iter().map(Chunk::try_from).collect()
    }

    /// Candidate ids whose metadata contains every given flattened
    /// path/value pair, via the inverted index. Over-approximates for
    /// array-of-object filters; the in-process containment check stays
    /// authoritative.
    #[inline]
    pub async fn prefilter_ids(
        pool: &SqlitePool,
        storage_key: &str,
        pairs: &[(String, String)],
    ) -> Result<Vec<i64>> {
        validate_storage_key(storage_key)?;
        if pairs.is_empty() {
            return Err(StoreError::Validation(
                "metadata prefilter requires at least one pair".to_string(),
            ));
        }
        let meta = meta_table(storage_key);
        let sql = vec![format!("SELECT chunk_id FROM {meta} WHERE path = ? AND value = ?"); pairs.len()]
            .join(" INTERSECT ");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for (path, value) in pairs {
            query = query.bind(path).bind(value);
        }
        let ids = query.fetch_all(pool).await?;
        Ok(ids)
    }

    /// Stream every (id, embedding) pair, used to re-sync the ANN index.
    #[inline]
    pub async fn scan_embeddings(
        pool: &SqlitePool,
        storage_key: &str,
    ) -> Result<Vec<(i64, Vec<f32>)>> {
        validate_storage_key(storage_key)?;
        let rows = sqlx::query_as::<_, (i64, Vec<u8>)>(&format!(
            "SELECT id, embedding FROM {} ORDER BY id",
            chunk_table(storage_key)
        ))
        .fetch_all(pool)
        .await?;
        rows.into_iter()
            .map(|(id, blob)| Ok((id, super::models::decode_embedding(&blob)?)))
            .collect()
    }
}
