use super::*;
use crate::StoreError;
use crate::database::sqlite::queries::{chunk_table, derive_storage_key, meta_table, validate_storage_key};
use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;

async fn create_test_database() -> Result<(TempDir, Database)> {
    let temp_dir = TempDir::new()?;
    let database = Database::new(temp_dir.path().join("registry.db"), 5000).await?;
    Ok((temp_dir, database))
}

fn sample_chunk(url: &str, chunk_number: i64, embedding: Vec<f32>) -> NewChunk {
    NewChunk {
        url: url.to_string(),
        chunk_number,
        title: "Title".to_string(),
        summary: "Summary".to_string(),
        content: "Content".to_string(),
        metadata: json!({"source": "docs"}),
        embedding,
    }
}

#[tokio::test]
async fn migration_creates_registry_table() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%'",
    )
    .fetch_all(database.pool())
    .await?;

    assert!(tables.contains(&"collections".to_string()));
    Ok(())
}

#[tokio::test]
async fn register_and_resolve_collection() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let collection = CollectionQueries::register(database.pool(), "Docs", "docs").await?;
    assert_eq!(collection.name, "Docs");
    assert_eq!(collection.storage_key, "docs");
    assert!(!collection.ann_indexed);

    let resolved = CollectionQueries::get_by_name(database.pool(), "Docs").await?;
    assert_eq!(resolved.as_ref(), Some(&collection));

    assert!(CollectionQueries::get_by_name(database.pool(), "Other").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn duplicate_name_is_rejected_atomically() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    CollectionQueries::register(database.pool(), "docs", "docs").await?;

    let same_name = CollectionQueries::register(database.pool(), "docs", "docs_2").await;
    assert!(matches!(same_name, Err(StoreError::DuplicateName(_))));

    let same_key = CollectionQueries::register(database.pool(), "docs 2", "docs").await;
    assert!(matches!(same_key, Err(StoreError::DuplicateName(_))));

    // The failed registrations must not leave partial entries behind.
    let all = CollectionQueries::list_all(database.pool()).await?;
    assert_eq!(all.len(), 1);
    Ok(())
}

#[tokio::test]
async fn remove_collection_entry() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    CollectionQueries::register(database.pool(), "docs", "docs").await?;
    assert!(CollectionQueries::remove(database.pool(), "docs").await?);
    assert!(!CollectionQueries::remove(database.pool(), "docs").await?);
    assert!(CollectionQueries::get_by_name(database.pool(), "docs").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn mark_ann_indexed_round_trip() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    let collection = CollectionQueries::register(database.pool(), "docs", "docs").await?;
    CollectionQueries::mark_ann_indexed(database.pool(), collection.id, true).await?;

    let reloaded = CollectionQueries::get_by_id(database.pool(), collection.id)
        .await?
        .expect("collection should exist");
    assert!(reloaded.ann_indexed);
    Ok(())
}

#[test]
fn storage_key_validation() {
    assert!(validate_storage_key("docs").is_ok());
    assert!(validate_storage_key("my_docs_2").is_ok());
    assert!(validate_storage_key("").is_err());
    assert!(validate_storage_key("Docs").is_err());
    assert!(validate_storage_key("docs-site").is_err());
    assert!(validate_storage_key("docs; DROP TABLE collections").is_err());
    assert!(validate_storage_key(&"a".repeat(65)).is_err());
}

#[test]
fn storage_key_derivation() {
    assert_eq!(derive_storage_key("My Docs Site!").expect("should derive"), "my_docs_site");
    assert_eq!(derive_storage_key("docs").expect("should derive"), "docs");
    assert_eq!(derive_storage_key("a--b__c").expect("should derive"), "a_b_c");
    assert!(derive_storage_key("!!!").is_err());
}

#[test]
fn physical_names_derive_from_storage_key() {
    assert_eq!(chunk_table("docs"), "chunks_docs");
    assert_eq!(meta_table("docs"), "chunks_docs_meta");
}

#[tokio::test]
async fn create_schema_is_idempotent() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;

    assert!(!ChunkQueries::schema_exists(database.pool(), "docs").await?);
    ChunkQueries::create_schema(database.pool(), "docs").await?;
    ChunkQueries::create_schema(database.pool(), "docs").await?;
    assert!(ChunkQueries::schema_exists(database.pool(), "docs").await?);
    Ok(())
}

#[tokio::test]
async fn upsert_preserves_id_and_created_at() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    ChunkQueries::create_schema(database.pool(), "docs").await?;

    let first = sample_chunk("https://example.com/a", 0, vec![1.0, 0.0]);
    let id = ChunkQueries::upsert(database.pool(), "docs", &first, &[]).await?;
    let stored = ChunkQueries::get_by_id(database.pool(), "docs", id)
        .await?
        .expect("chunk should exist");

    let mut second = sample_chunk("https://example.com/a", 0, vec![0.0, 1.0]);
    second.content = "Replaced".to_string();
    second.metadata = json!({"source": "blog"});
    let second_id = ChunkQueries::upsert(database.pool(), "docs", &second, &[]).await?;

    assert_eq!(second_id, id);
    assert_eq!(ChunkQueries::count(database.pool(), "docs").await?, 1);

    let replaced = ChunkQueries::get_by_id(database.pool(), "docs", id)
        .await?
        .expect("chunk should exist");
    assert_eq!(replaced.content, "Replaced");
    assert_eq!(replaced.metadata, json!({"source": "blog"}));
    assert_eq!(replaced.embedding, vec![0.0, 1.0]);
    assert_eq!(replaced.created_at, stored.created_at);
    Ok(())
}

#[tokio::test]
async fn distinct_keys_create_distinct_rows() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    ChunkQueries::create_schema(database.pool(), "docs").await?;

    let a0 = ChunkQueries::upsert(
        database.pool(),
        "docs",
        &sample_chunk("https://example.com/a", 0, vec![1.0, 0.0]),
        &[],
    )
    .await?;
    let a1 = ChunkQueries::upsert(
        database.pool(),
        "docs",
        &sample_chunk("https://example.com/a", 1, vec![1.0, 0.0]),
        &[],
    )
    .await?;
    let b0 = ChunkQueries::upsert(
        database.pool(),
        "docs",
        &sample_chunk("https://example.com/b", 0, vec![1.0, 0.0]),
        &[],
    )
    .await?;

    // Ids are monotonically increasing in insertion order.
    assert!(a0 < a1 && a1 < b0);
    assert_eq!(ChunkQueries::count(database.pool(), "docs").await?, 3);
    Ok(())
}

#[tokio::test]
async fn meta_pairs_refresh_on_upsert() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    ChunkQueries::create_schema(database.pool(), "docs").await?;

    let chunk = sample_chunk("https://example.com/a", 0, vec![1.0, 0.0]);
    let docs_pair = ("source".to_string(), "\"docs\"".to_string());
    let blog_pair = ("source".to_string(), "\"blog\"".to_string());

    let id = ChunkQueries::upsert(database.pool(), "docs", &chunk, std::slice::from_ref(&docs_pair)).await?;
    assert_eq!(
        ChunkQueries::prefilter_ids(database.pool(), "docs", std::slice::from_ref(&docs_pair)).await?,
        vec![id]
    );

    ChunkQueries::upsert(database.pool(), "docs", &chunk, std::slice::from_ref(&blog_pair)).await?;
    assert!(
        ChunkQueries::prefilter_ids(database.pool(), "docs", std::slice::from_ref(&docs_pair))
            .await?
            .is_empty()
    );
    assert_eq!(
        ChunkQueries::prefilter_ids(database.pool(), "docs", std::slice::from_ref(&blog_pair)).await?,
        vec![id]
    );
    Ok(())
}

#[tokio::test]
async fn prefilter_intersects_pairs() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    ChunkQueries::create_schema(database.pool(), "docs").await?;

    let pair_docs = ("source".to_string(), "\"docs\"".to_string());
    let pair_en = ("lang".to_string(), "\"en\"".to_string());

    let both = ChunkQueries::upsert(
        database.pool(),
        "docs",
        &sample_chunk("https://example.com/a", 0, vec![1.0, 0.0]),
        &[pair_docs.clone(), pair_en.clone()],
    )
    .await?;
    ChunkQueries::upsert(
        database.pool(),
        "docs",
        &sample_chunk("https://example.com/b", 0, vec![1.0, 0.0]),
        std::slice::from_ref(&pair_docs),
    )
    .await?;

    let ids =
        ChunkQueries::prefilter_ids(database.pool(), "docs", &[pair_docs, pair_en]).await?;
    assert_eq!(ids, vec![both]);
    Ok(())
}

#[tokio::test]
async fn delete_cascades_meta_rows() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    ChunkQueries::create_schema(database.pool(), "docs").await?;

    let pair = ("source".to_string(), "\"docs\"".to_string());
    let chunk = sample_chunk("https://example.com/a", 0, vec![1.0, 0.0]);
    let id = ChunkQueries::upsert(database.pool(), "docs", &chunk, std::slice::from_ref(&pair)).await?;

    let deleted = ChunkQueries::delete_by_key(database.pool(), "docs", "https://example.com/a", 0).await?;
    assert_eq!(deleted, Some(id));

    let meta_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks_docs_meta")
        .fetch_one(database.pool())
        .await?;
    assert_eq!(meta_rows, 0);

    assert_eq!(
        ChunkQueries::delete_by_key(database.pool(), "docs", "https://example.com/a", 0).await?,
        None
    );
    Ok(())
}

#[tokio::test]
async fn scan_and_get_many_decode_rows() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    ChunkQueries::create_schema(database.pool(), "docs").await?;

    let a = ChunkQueries::upsert(
        database.pool(),
        "docs",
        &sample_chunk("https://example.com/a", 0, vec![1.0, 0.0]),
        &[],
    )
    .await?;
    let b = ChunkQueries::upsert(
        database.pool(),
        "docs",
        &sample_chunk("https://example.com/b", 0, vec![0.5, 0.5]),
        &[],
    )
    .await?;

    let all = ChunkQueries::scan(database.pool(), "docs").await?;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, a);
    assert_eq!(all[0].embedding, vec![1.0, 0.0]);

    let subset = ChunkQueries::get_many(database.pool(), "docs", &[b]).await?;
    assert_eq!(subset.len(), 1);
    assert_eq!(subset[0].url, "https://example.com/b");

    assert!(ChunkQueries::get_many(database.pool(), "docs", &[]).await?.is_empty());

    let embeddings = ChunkQueries::scan_embeddings(database.pool(), "docs").await?;
    assert_eq!(embeddings, vec![(a, vec![1.0, 0.0]), (b, vec![0.5, 0.5])]);
    Ok(())
}

#[tokio::test]
async fn drop_schema_removes_tables() -> Result<()> {
    let (_temp_dir, database) = create_test_database().await?;
    ChunkQueries::create_schema(database.pool(), "docs").await?;
    ChunkQueries::drop_schema(database.pool(), "docs").await?;

    assert!(!ChunkQueries::schema_exists(database.pool(), "docs").await?);

    // Operations against the vanished table surface as NotFound.
    let result = ChunkQueries::count(database.pool(), "docs").await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
    Ok(())
}

#[test]
fn embedding_blob_round_trip() {
    let vector = vec![1.0f32, -0.5, 0.25, 0.0];
    let blob = models::encode_embedding(&vector);
    assert_eq!(blob.len(), 16);
    assert_eq!(models::decode_embedding(&blob).expect("should decode"), vector);

    assert!(models::decode_embedding(&[0u8, 1, 2]).is_err());
}

#[test]
fn new_chunk_validation() {
    let chunk = sample_chunk("https://example.com/a", 0, vec![1.0, 0.0]);
    assert!(chunk.validate(2).is_ok());

    let mut empty_url = chunk.clone();
    empty_url.url = String::new();
    assert!(matches!(empty_url.validate(2), Err(StoreError::Validation(_))));

    let mut negative = chunk.clone();
    negative.chunk_number = -1;
    assert!(matches!(negative.validate(2), Err(StoreError::Validation(_))));

    let mut scalar_metadata = chunk.clone();
    scalar_metadata.metadata = json!("docs");
    assert!(matches!(scalar_metadata.validate(2), Err(StoreError::Validation(_))));

    assert!(matches!(
        chunk.validate(3),
        Err(StoreError::DimensionMismatch {
            expected: 3,
            actual: 2
        })
    ));
}

#[test]
fn chunk_records_deserialize_with_default_metadata() {
    let record: NewChunk = serde_json::from_str(
        r#"{
            "url": "https://example.com/a",
            "chunk_number": 0,
            "title": "T",
            "summary": "S",
            "content": "C",
            "embedding": [1.0, 0.0]
        }"#,
    )
    .expect("should deserialize");
    assert_eq!(record.metadata, json!({}));

    // A record missing a required field is a validation failure at the
    // ingestion surface.
    let missing: std::result::Result<NewChunk, _> =
        serde_json::from_str(r#"{"url": "https://example.com/a", "chunk_number": 0}"#);
    assert!(missing.is_err());
}
