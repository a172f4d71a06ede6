use anyhow::{Context, Result, bail};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tracing::info;

use crate::config::Config;
use crate::database::sqlite::NewChunk;
use crate::store::{CollectionStore, SearchParams};

async fn open_store(base_dir: &Path) -> Result<CollectionStore> {
    let config = Config::load(base_dir)?;
    let store = CollectionStore::open(config)
        .await
        .context("Failed to open store")?;
    Ok(store)
}

/// Create (or idempotently re-create) a collection.
#[inline]
pub async fn create_collection(base_dir: &Path, name: &str) -> Result<()> {
    let store = open_store(base_dir).await?;
    let collection = store.create_collection(name).await?;

    println!(
        "Collection ready: {} (storage key: {})",
        collection.name, collection.storage_key
    );
    Ok(())
}

/// List all collections with their chunk counts.
#[inline]
pub async fn list_collections(base_dir: &Path) -> Result<()> {
    let store = open_store(base_dir).await?;
    let collections = store.list_collections().await?;

    if collections.is_empty() {
        println!("No collections have been created yet.");
        println!("Use 'chunkstore create <name>' to create one.");
        return Ok(());
    }

    println!("Collections ({} total):", collections.len());
    println!();
    for collection in &collections {
        let status = store.collection_status(&collection.name).await?;
        println!("{} ({} chunks)", collection.name, status.chunk_count);
        println!("   Storage key: {}", collection.storage_key);
        println!("   Created: {}", collection.created_at);
        println!(
            "   ANN index: {}",
            if collection.ann_indexed { "trained" } else { "exact scan" }
        );
        println!();
    }
    Ok(())
}

/// Ingest a JSON file containing an array of chunk records. Each chunk
/// upserts independently; a failure reports how many made it in.
#[inline]
pub async fn ingest_file(base_dir: &Path, collection: &str, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read chunk file: {}", file.display()))?;
    let chunks: Vec<NewChunk> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid chunk records in {}", file.display()))?;

    if chunks.is_empty() {
        println!("No chunks to ingest.");
        return Ok(());
    }

    let store = open_store(base_dir).await?;
    info!("Ingesting {} chunks into {}", chunks.len(), collection);

    let bar = if console::user_attended_stderr() {
        ProgressBar::new(chunks.len() as u64).with_style(
            ProgressStyle::with_template("{bar:40} [{pos}/{len}] {msg}")
                .expect("style template is valid"),
        )
    } else {
        ProgressBar::hidden()
    };

    let total = chunks.len();
    let mut ingested = 0usize;
    for chunk in chunks {
        bar.set_message(format!("{}#{}", chunk.url, chunk.chunk_number));
        match store.upsert_chunk(collection, chunk).await {
            Ok(_) => {
                ingested += 1;
                bar.inc(1);
            }
            Err(e) => {
                bar.abandon();
                bail!("Ingestion failed after {ingested}/{total} chunks: {e}");
            }
        }
    }
    bar.finish_with_message("done");

    println!("Ingested {ingested} chunks into {collection}.");
    Ok(())
}

/// Run a similarity search and print the ranked results as JSON.
#[inline]
pub async fn search(
    base_dir: &Path,
    collection: &str,
    embedding: Option<String>,
    embedding_file: Option<&Path>,
    limit: usize,
    threshold: f32,
    filter: &str,
) -> Result<()> {
    let raw = match (embedding, embedding_file) {
        (Some(inline), None) => inline,
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read embedding file: {}", path.display()))?,
        _ => bail!("Provide exactly one of --embedding or --embedding-file"),
    };
    let query: Vec<f32> =
        serde_json::from_str(&raw).context("Embedding must be a JSON array of numbers")?;
    let filter: serde_json::Value =
        serde_json::from_str(filter).context("Filter must be a JSON object")?;

    let store = open_store(base_dir).await?;
    let params = SearchParams {
        match_count: limit,
        similarity_threshold: threshold,
        filter,
        ..SearchParams::new(query)
    };
    let results = store.search(collection, &params).await?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

/// Delete a single chunk by its `(url, chunk_number)` key.
#[inline]
pub async fn delete_chunk(
    base_dir: &Path,
    collection: &str,
    url: &str,
    chunk_number: i64,
) -> Result<()> {
    let store = open_store(base_dir).await?;
    store.delete_chunk(collection, url, chunk_number).await?;

    println!("Deleted chunk {url}#{chunk_number} from {collection}.");
    Ok(())
}

/// Drop a collection and all of its data, with confirmation.
#[inline]
pub async fn drop_collection(base_dir: &Path, name: &str, force: bool) -> Result<()> {
    let store = open_store(base_dir).await?;
    let status = store.collection_status(name).await?;

    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Drop collection '{}' and its {} chunks? This cannot be undone.",
                name, status.chunk_count
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    store.drop_collection(name).await?;
    println!("Dropped collection {name}.");
    Ok(())
}

/// Run the maintenance pass for a collection.
#[inline]
pub async fn optimize(base_dir: &Path, name: &str) -> Result<()> {
    let store = open_store(base_dir).await?;
    store.optimize(name).await?;

    println!("Optimized collection {name}.");
    Ok(())
}
