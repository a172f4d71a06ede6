use anyhow::Result;
use chunkstore::commands::{
    create_collection, delete_chunk, drop_collection, ingest_file, list_collections, optimize,
    search,
};
use chunkstore::config::Config;
use chunkstore::store::search::{DEFAULT_MATCH_COUNT, DEFAULT_SIMILARITY_THRESHOLD};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chunkstore")]
#[command(about = "Multi-tenant vector document store with filtered similarity search")]
#[command(version)]
struct Cli {
    /// Base directory for the store's data and configuration
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a collection (a no-op if it already exists)
    Create {
        /// Unique collection name
        name: String,
    },
    /// List all collections
    List,
    /// Ingest chunk records from a JSON file into a collection
    Ingest {
        /// Collection name
        collection: String,
        /// Path to a JSON array of chunk records
        file: PathBuf,
    },
    /// Run a similarity search against a collection
    Search {
        /// Collection name
        collection: String,
        /// Query embedding as an inline JSON array
        #[arg(long)]
        embedding: Option<String>,
        /// Path to a JSON file containing the query embedding
        #[arg(long)]
        embedding_file: Option<PathBuf>,
        /// Maximum number of results
        #[arg(long, default_value_t = DEFAULT_MATCH_COUNT)]
        limit: usize,
        /// Results must score strictly above this similarity
        #[arg(long, default_value_t = DEFAULT_SIMILARITY_THRESHOLD)]
        threshold: f32,
        /// Metadata containment filter as a JSON object
        #[arg(long, default_value = "{}")]
        filter: String,
    },
    /// Delete a single chunk by its (url, chunk number) key
    DeleteChunk {
        /// Collection name
        collection: String,
        /// Chunk source URL
        #[arg(long)]
        url: String,
        /// Chunk number within the source document
        #[arg(long)]
        chunk_number: i64,
    },
    /// Drop a collection and all of its data
    Drop {
        /// Collection name
        collection: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Re-sync and compact a collection's indexes
    Optimize {
        /// Collection name
        collection: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let base_dir = match cli.base_dir {
        Some(dir) => dir,
        None => Config::default_base_dir()?,
    };

    match cli.command {
        Commands::Create { name } => {
            create_collection(&base_dir, &name).await?;
        }
        Commands::List => {
            list_collections(&base_dir).await?;
        }
        Commands::Ingest { collection, file } => {
            ingest_file(&base_dir, &collection, &file).await?;
        }
        Commands::Search {
            collection,
            embedding,
            embedding_file,
            limit,
            threshold,
            filter,
        } => {
            search(
                &base_dir,
                &collection,
                embedding,
                embedding_file.as_deref(),
                limit,
                threshold,
                &filter,
            )
            .await?;
        }
        Commands::DeleteChunk {
            collection,
            url,
            chunk_number,
        } => {
            delete_chunk(&base_dir, &collection, &url, chunk_number).await?;
        }
        Commands::Drop { collection, force } => {
            drop_collection(&base_dir, &collection, force).await?;
        }
        Commands::Optimize { collection } => {
            optimize(&base_dir, &collection).await?;
        }
    }

    Ok(())
}
