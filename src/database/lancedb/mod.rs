// LanceDB vector index module
// One table per collection holding (id, vector); acts as the collection's
// ANN index. The chunk table in SQLite stays the source of truth, so the
// index can always be rebuilt from it.


use arrow::array::{Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatchIterator};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use lancedb::index::Index;
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{Result, StoreError};

/// Per-collection ANN index store backed by LanceDB.
#[derive(Clone)]
pub struct VectorIndex {
    connection: Connection,
    dimension: usize,
}

impl VectorIndex {
    #[inline]
    pub async fn new(db_path: &Path, dimension: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Storage(format!("failed to create vector database directory: {e}"))
            })?;
        }

        let uri = format!("file://{}", db_path.display());
        debug!("Connecting to LanceDB at {}", uri);
        let connection = lancedb::connect(&uri).execute().await?;

        Ok(Self {
            connection,
            dimension,
        })
    }

    fn table_name(storage_key: &str) -> String {
        format!("chunks_{storage_key}")
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    self.dimension as i32,
                ),
                false,
            ),
        ]))
    }

    #[inline]
    pub async fn table_exists(&self, storage_key: &str) -> Result<bool> {
        let names = self.connection.table_names().execute().await?;
        Ok(names.contains(&Self::table_name(storage_key)))
    }

    /// Create the vector table for a collection if it does not exist.
    #[inline]
    pub async fn ensure_table(&self, storage_key: &str) -> Result<()> {
        if self.table_exists(storage_key).await? {
            return Ok(());
        }
        self.connection
            .create_empty_table(&Self::table_name(storage_key), self.schema())
            .execute()
            .await?;
        debug!("Created vector table for storage key {}", storage_key);
        Ok(())
    }

    fn build_batch(&self, rows: &[(i64, Vec<f32>)]) -> Result<RecordBatch> {
        let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();

        let mut flat_values = Vec::with_capacity(rows.len() * self.dimension);
        for (_, vector) in rows {
            flat_values.extend_from_slice(vector);
        }
        let values = Float32Array::from(flat_values);
        let item_field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array =
            FixedSizeListArray::try_new(item_field, self.dimension as i32, Arc::new(values), None)
                .map_err(|e| StoreError::Storage(format!("failed to build vector array: {e}")))?;

        RecordBatch::try_new(
            self.schema(),
            vec![Arc::new(Int64Array::from(ids)), Arc::new(vector_array)],
        )
        .map_err(|e| StoreError::Storage(format!("failed to build record batch: {e}")))
    }

    /// Insert or replace vectors keyed by chunk id. Incremental: rows
    /// written after index training are scanned exactly by LanceDB until
    /// the next training pass, so results stay correct.
    #[inline]
    pub async fn upsert_vectors(&self, storage_key: &str, rows: &[(i64, Vec<f32>)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let batch = self.build_batch(rows)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);

        let table = self
            .connection
            .open_table(&Self::table_name(storage_key))
            .execute()
            .await?;
        let mut merge = table.merge_insert(&["id"]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();
        let _ = merge.execute(Box::new(reader)).await?;

        Ok(())
    }

    #[inline]
    pub async fn delete_vector(&self, storage_key: &str, id: i64) -> Result<()> {
        let table = self
            .connection
            .open_table(&Self::table_name(storage_key))
            .execute()
            .await?;
        table.delete(&format!("id = {id}")).await?;
        Ok(())
    }

    /// ANN candidate ids for a query vector, nearest first by cosine
    /// distance. The caller recomputes exact scores over this superset, so
    /// the index never decides final ranking.
    #[inline]
    pub async fn candidate_ids(
        &self,
        storage_key: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<i64>> {
        let table = self
            .connection
            .open_table(&Self::table_name(storage_key))
            .execute()
            .await?;

        let mut results = table
            .vector_search(query)?
            .distance_type(DistanceType::Cosine)
            .column("vector")
            .limit(limit)
            .select(Select::columns(&["id"]))
            .execute()
            .await?;

        let mut ids = Vec::with_capacity(limit);
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| StoreError::Storage(format!("failed to read result stream: {e}")))?
        {
            let id_column = batch
                .column_by_name("id")
                .ok_or_else(|| StoreError::Storage("missing id column".to_string()))?
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| StoreError::Storage("invalid id column type".to_string()))?;
            for row in 0..batch.num_rows() {
                if !id_column.is_null(row) {
                    ids.push(id_column.value(row));
                }
            }
        }

        debug!("ANN search returned {} candidate ids", ids.len());
        Ok(ids)
    }

    /// Train the IVF_PQ index. Partition and sub-vector counts are derived
    /// from the row count and dimension, clamped for small datasets.
    #[inline]
    pub async fn train_ann_index(&self, storage_key: &str, row_count: usize) -> Result<()> {
        let table = self
            .connection
            .open_table(&Self::table_name(storage_key))
            .execute()
            .await?;

        let partitions = ivf_partitions(row_count);
        let sub_vectors = pq_sub_vectors(self.dimension);
        info!(
            "Training IVF_PQ index for {} ({} rows, {} partitions, {} sub-vectors)",
            storage_key, row_count, partitions, sub_vectors
        );

        table
            .create_index(
                &["vector"],
                Index::IvfPq(
                    IvfPqIndexBuilder::default()
                        .distance_type(DistanceType::Cosine)
                        .num_partitions(partitions)
                        .num_sub_vectors(sub_vectors),
                ),
            )
            .execute()
            .await?;
        Ok(())
    }

    /// Compact fragments and merge index deltas.
    #[inline]
    pub async fn optimize(&self, storage_key: &str) -> Result<()> {
        let table = self
            .connection
            .open_table(&Self::table_name(storage_key))
            .execute()
            .await?;
        table.optimize(lancedb::table::OptimizeAction::All).await?;
        Ok(())
    }

    /// Drop the vector table for a collection, ignoring a missing table.
    #[inline]
    pub async fn drop_table(&self, storage_key: &str) -> Result<()> {
        if !self.table_exists(storage_key).await? {
            return Ok(());
        }
        self.connection
            .drop_table(&Self::table_name(storage_key))
            .await?;
        info!("Dropped vector table for storage key {}", storage_key);
        Ok(())
    }
}

/// IVF partition count: grows with the square root of the row count,
/// clamped so tiny datasets still train.
fn ivf_partitions(row_count: usize) -> u32 {
    let sqrt_n = (row_count as f64).sqrt() as u32;
    sqrt_n.clamp(1, 1024)
}

/// Largest power-of-two sub-vector count (up to 16) that divides the
/// dimension; PQ requires the dimension to split evenly.
fn pq_sub_vectors(dimension: usize) -> u32 {
    for candidate in [16u32, 8, 4, 2] {
        if dimension % candidate as usize == 0 {
            return candidate;
        }
    }
    1
}
