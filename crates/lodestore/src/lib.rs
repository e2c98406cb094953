//! Lodestore: a schema-flexible document database with integrated
//! full-text search.
//!
//! Documents are arbitrary keyed maps stored in named collections. Each
//! collection lazily infers a typed schema from the documents it sees,
//! maintains an inverted index over their contents, and answers ranked,
//! paginated, sortable queries. Payloads live in a shared RocksDB engine;
//! the KV row is the source of truth, the index follows it.
//!
//! ```no_run
//! use lodestore::{Config, Database, Document, SearchCriteria};
//!
//! # async fn demo() -> Result<(), lodestore::DbError> {
//! let db = Database::open(Config::new("/var/lib/lodestore")).await?;
//! let books = db.collection("books")?;
//!
//! let doc = Document::from_json(&serde_json::json!({
//!     "title": "The Left Hand of Darkness",
//!     "published": 1969,
//! })).unwrap();
//! books.insert(doc).await?;
//!
//! let results = books.search(&SearchCriteria::with_query("title:darkness")).await?;
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod collection;
pub mod database;
pub mod storage;

pub use collection::Collection;
pub use database::Database;
pub use storage::{StorageEngine, StorageError, SCHEMA_NAMESPACE};

pub use lodestore_searcher::schema::{CollectionSchema, DataType, SchemaField};
pub use lodestore_searcher::SearchError;
pub use shared::config::Config;
pub use shared::document::{Document, Value};
pub use shared::request::SearchCriteria;
pub use shared::response::SearchResults;

use lodestore_searcher::projection::ProjectionError;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("the document has no _id")]
    MissingId,
    #[error("{0} was not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("search engine error: {0}")]
    Search(SearchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SearchError> for DbError {
    fn from(err: SearchError) -> Self {
        match err {
            // A query the parser rejects is the caller's mistake, not an
            // engine failure.
            SearchError::InvalidQuery { query, reason } => {
                DbError::InvalidArgument(format!("query '{query}': {reason}"))
            }
            other => DbError::Search(other),
        }
    }
}

impl From<ProjectionError> for DbError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::MissingId => DbError::MissingId,
        }
    }
}
