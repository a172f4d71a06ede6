// Database module
// Dual storage engine: SQLite holds the collection registry, the chunk
// tables, and the metadata containment index; LanceDB holds one vector
// table per collection acting as its ANN index.

pub mod lancedb;
pub mod sqlite;
