//! Store facade tying the registry, chunk tables, and ANN indexes into the
//! public contract: collection lifecycle, ingestion, and similarity search.


pub mod metadata;
pub mod search;

pub use search::{SearchParams, SearchResult};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::database::lancedb::VectorIndex;
use crate::database::sqlite::queries::derive_storage_key;
use crate::database::sqlite::{
    Chunk, ChunkQueries, Collection, CollectionQueries, Database, NewChunk,
};
use crate::{Result, StoreError};

/// A collection plus its current chunk count, for discovery surfaces.
#[derive(Debug, Clone)]
pub struct CollectionStatus {
    pub collection: Collection,
    pub chunk_count: i64,
}

/// Handle to the whole store. Cheap to clone; every operation takes
/// `&self`, so independent callers ingest and search concurrently.
#[derive(Clone)]
pub struct CollectionStore {
    database: Database,
    vectors: VectorIndex,
    config: Config,
}

impl CollectionStore {
    /// Open (and if necessary initialize) the store under the configured
    /// base directory.
    #[inline]
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.base_dir)?;

        let database =
            Database::new(config.registry_path(), config.storage.busy_timeout_ms).await?;
        let vectors =
            VectorIndex::new(&config.vectors_path(), config.storage.embedding_dimension).await?;

        Ok(Self {
            database,
            vectors,
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register and provision a collection. Re-invocation with an existing
    /// name is a no-op success returning the existing collection.
    #[inline]
    pub async fn create_collection(&self, name: &str) -> Result<Collection> {
        if name.trim().is_empty() {
            return Err(StoreError::Validation(
                "collection name must not be empty".to_string(),
            ));
        }
        let pool = self.database.pool();

        if let Some(existing) = CollectionQueries::get_by_name(pool, name).await? {
            // Provisioning is idempotent; re-running it here repairs a
            // create that was interrupted between registration and schema
            // creation.
            self.provision(&existing.storage_key).await?;
            return Ok(existing);
        }

        let storage_key = derive_storage_key(name)?;
        let (collection, registered_here) =
            match CollectionQueries::register(pool, name, &storage_key).await {
                Ok(collection) => (collection, true),
                Err(StoreError::DuplicateName(_)) => {
                    // Lost a registration race for this name, or the derived
                    // key collides with a differently-named collection.
                    let Some(existing) = CollectionQueries::get_by_name(pool, name).await? else {
                        return Err(StoreError::DuplicateName(storage_key));
                    };
                    (existing, false)
                }
                Err(e) => return Err(e),
            };

        if let Err(e) = self.provision(&collection.storage_key).await {
            if registered_here {
                warn!("Unregistering {} after failed provisioning: {}", name, e);
                let _ = CollectionQueries::remove(pool, name).await;
            }
            return Err(e);
        }

        info!(
            "Collection {} ready (storage key {})",
            collection.name, collection.storage_key
        );
        Ok(collection)
    }

    /// Create the physical structures for a storage key. Idempotent; if the
    /// vector table fails on a fresh provision, the SQLite half is rolled
    /// back so no partial schema stays visible.
    async fn provision(&self, storage_key: &str) -> Result<()> {
        let pool = self.database.pool();
        let existed = ChunkQueries::schema_exists(pool, storage_key).await?;
        ChunkQueries::create_schema(pool, storage_key).await?;
        if let Err(e) = self.vectors.ensure_table(storage_key).await {
            if !existed {
                let _ = ChunkQueries::drop_schema(pool, storage_key).await;
            }
            return Err(e);
        }
        Ok(())
    }

    #[inline]
    pub async fn list_collections(&self) -> Result<Vec<Collection>> {
        CollectionQueries::list_all(self.database.pool()).await
    }

    #[inline]
    pub async fn resolve(&self, name: &str) -> Result<Collection> {
        CollectionQueries::get_by_name(self.database.pool(), name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("collection {name}")))
    }

    #[inline]
    pub async fn collection_status(&self, name: &str) -> Result<CollectionStatus> {
        let collection = self.resolve(name).await?;
        let chunk_count =
            ChunkQueries::count(self.database.pool(), &collection.storage_key).await?;
        Ok(CollectionStatus {
            collection,
            chunk_count,
        })
    }

    /// Insert or replace one chunk; returns its store-assigned id.
    #[inline]
    pub async fn upsert_chunk(&self, collection_name: &str, chunk: NewChunk) -> Result<i64> {
        let collection = self.resolve(collection_name).await?;
        let id = self.upsert_resolved(&collection, chunk).await?;
        self.maybe_train_ann(&collection).await;
        Ok(id)
    }

    /// Upsert a batch. Each chunk upserts independently: a failure stops
    /// the batch but leaves previously upserted chunks in place.
    #[inline]
    pub async fn upsert_chunks(
        &self,
        collection_name: &str,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<i64>> {
        let collection = self.resolve(collection_name).await?;
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            ids.push(self.upsert_resolved(&collection, chunk).await?);
        }
        self.maybe_train_ann(&collection).await;
        Ok(ids)
    }

    async fn upsert_resolved(&self, collection: &Collection, chunk: NewChunk) -> Result<i64> {
        chunk.validate(self.config.storage.embedding_dimension)?;
        let meta_pairs = metadata::flatten_pairs(&chunk.metadata);
        let id = ChunkQueries::upsert(
            self.database.pool(),
            &collection.storage_key,
            &chunk,
            &meta_pairs,
        )
        .await?;
        self.vectors
            .upsert_vectors(&collection.storage_key, &[(id, chunk.embedding)])
            .await?;
        debug!(
            "Upserted chunk {} ({}#{}) into {}",
            id, chunk.url, chunk.chunk_number, collection.name
        );
        Ok(id)
    }

    /// Train the ANN index once the collection crosses the configured row
    /// threshold. Best-effort: training failure is logged, never surfaced —
    /// unindexed rows are scanned exactly, so only latency is affected.
    async fn maybe_train_ann(&self, collection: &Collection) {
        if collection.ann_indexed {
            return;
        }
        let result: Result<()> = async {
            let total = ChunkQueries::count(self.database.pool(), &collection.storage_key).await?;
            let total = usize::try_from(total).unwrap_or_default();
            if total < self.config.ann.train_threshold {
                return Ok(());
            }
            self.vectors
                .train_ann_index(&collection.storage_key, total)
                .await?;
            CollectionQueries::mark_ann_indexed(self.database.pool(), collection.id, true).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!("ANN training deferred for {}: {}", collection.name, e);
        }
    }

    #[inline]
    pub async fn get_chunk(
        &self,
        collection_name: &str,
        url: &str,
        chunk_number: i64,
    ) -> Result<Option<Chunk>> {
        let collection = self.resolve(collection_name).await?;
        ChunkQueries::get_by_key(self.database.pool(), &collection.storage_key, url, chunk_number)
            .await
    }

    /// Remove a chunk by its `(url, chunk_number)` key.
    #[inline]
    pub async fn delete_chunk(
        &self,
        collection_name: &str,
        url: &str,
        chunk_number: i64,
    ) -> Result<()> {
        let collection = self.resolve(collection_name).await?;
        let id = ChunkQueries::delete_by_key(
            self.database.pool(),
            &collection.storage_key,
            url,
            chunk_number,
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("chunk {url}#{chunk_number}")))?;
        self.remove_vector(&collection.storage_key, id).await;
        Ok(())
    }

    /// Remove a chunk by its store-assigned id.
    #[inline]
    pub async fn delete_chunk_by_id(&self, collection_name: &str, id: i64) -> Result<()> {
        let collection = self.resolve(collection_name).await?;
        let removed =
            ChunkQueries::delete_by_id(self.database.pool(), &collection.storage_key, id).await?;
        if !removed {
            return Err(StoreError::NotFound(format!("chunk id {id}")));
        }
        self.remove_vector(&collection.storage_key, id).await;
        Ok(())
    }

    async fn remove_vector(&self, storage_key: &str, id: i64) {
        // A missing vector row (or a concurrently dropped table) is fine:
        // the chunk row is already gone, and an orphaned vector only wastes
        // a candidate slot — hydration skips ids with no chunk row.
        match self.vectors.delete_vector(storage_key, id).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => warn!("Failed to delete vector {} from {}: {}", id, storage_key, e),
        }
    }

    /// Top-K similarity search. Scores use the unclamped
    /// `1 - cosine_distance` formula, so values outside `[0, 1]` are
    /// possible for non-unit embeddings; results score strictly above the
    /// threshold and are ordered by score descending, ties by ascending id.
    /// An empty result means zero matches, never a failed lookup.
    #[inline]
    pub async fn search(
        &self,
        collection_name: &str,
        params: &SearchParams,
    ) -> Result<Vec<SearchResult>> {
        let collection = self.resolve(collection_name).await?;
        let expected = self.config.storage.embedding_dimension;
        if params.embedding.len() != expected {
            return Err(StoreError::DimensionMismatch {
                expected,
                actual: params.embedding.len(),
            });
        }
        if !params.filter.is_object() {
            return Err(StoreError::Validation(
                "filter must be a JSON object".to_string(),
            ));
        }

        let pool = self.database.pool();
        let key = &collection.storage_key;
        let total = ChunkQueries::count(pool, key).await?;

        let exact = total <= i64::try_from(self.config.search.exact_scan_limit).unwrap_or(i64::MAX);
        let candidates = if exact {
            let filter_pairs = metadata::flatten_pairs(&params.filter);
            if filter_pairs.is_empty() {
                ChunkQueries::scan(pool, key).await?
            } else {
                // The inverted index narrows the scan; containment is
                // re-checked in rank() since the index over-approximates.
                let ids = ChunkQueries::prefilter_ids(pool, key, &filter_pairs).await?;
                ChunkQueries::get_many(pool, key, &ids).await?
            }
        } else {
            let limit = params
                .match_count
                .saturating_mul(self.config.search.oversample)
                .max(self.config.search.min_candidates);
            let ids = self.vectors.candidate_ids(key, &params.embedding, limit).await?;
            ChunkQueries::get_many(pool, key, &ids).await?
        };

        debug!(
            "Search over {} considered {} candidates ({} path)",
            collection.name,
            candidates.len(),
            if exact { "exact" } else { "ann" }
        );
        Ok(search::rank(candidates, params))
    }

    /// Remove a collection and all of its physical structures.
    /// Irreversible. Operations racing this call either complete against
    /// the collection as it existed or fail with `NotFound`.
    #[inline]
    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        let collection = self.resolve(name).await?;
        let pool = self.database.pool();

        // Registry first: once the entry is gone, new operations resolve to
        // NotFound and never observe half-dropped structures.
        CollectionQueries::remove(pool, name).await?;
        ChunkQueries::drop_schema(pool, &collection.storage_key).await?;
        self.vectors.drop_table(&collection.storage_key).await?;

        info!("Dropped collection {}", collection.name);
        Ok(())
    }

    /// Maintenance pass: registry VACUUM/ANALYZE, re-sync of every stored
    /// embedding into the vector table (healing drift from interrupted
    /// writes), LanceDB compaction, and ANN (re)training when the
    /// collection is large enough.
    #[inline]
    pub async fn optimize(&self, name: &str) -> Result<()> {
        let collection = self.resolve(name).await?;
        let pool = self.database.pool();
        let key = &collection.storage_key;

        self.database.optimize().await?;

        let rows = ChunkQueries::scan_embeddings(pool, key).await?;
        self.vectors.ensure_table(key).await?;
        self.vectors.upsert_vectors(key, &rows).await?;

        if rows.len() >= self.config.ann.train_threshold {
            self.vectors.train_ann_index(key, rows.len()).await?;
            CollectionQueries::mark_ann_indexed(pool, collection.id, true).await?;
        }
        self.vectors.optimize(key).await?;

        info!(
            "Optimized collection {} ({} chunks re-synced)",
            collection.name,
            rows.len()
        );
        Ok(())
    }
}
