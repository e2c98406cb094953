//! The database: named collections over one shared KV engine.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use lodestore_searcher::schema::CollectionSchema;
use shared::config::Config;

use crate::collection::Collection;
use crate::storage::{StorageEngine, SCHEMA_NAMESPACE};
use crate::DbError;

/// Upper bound on waiting for a collection's schema lock during one
/// persistence tick; contended collections are skipped, not queued.
const SCHEMA_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Owns the KV engine, the collection registry, and the schema
/// persistence tick. Collections come into being on first reference and
/// are reloaded from their persisted schemas at open.
pub struct Database {
    config: Config,
    storage: StorageEngine,
    collections: Arc<DashMap<String, Arc<Collection>>>,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Opens (or creates) the data directory layout, loads every persisted
    /// schema, and starts the schema persistence tick.
    pub async fn open(config: Config) -> Result<Self, DbError> {
        fs::create_dir_all(config.index_dir())?;
        let storage = StorageEngine::open(&config.data_dir())?;

        let collections: Arc<DashMap<String, Arc<Collection>>> = Arc::new(DashMap::new());
        let schemas: Vec<CollectionSchema> = storage.get_all(SCHEMA_NAMESPACE).await?;
        let mut last_saved = HashMap::new();
        for schema in schemas {
            let name = schema.name.clone();
            last_saved.insert(name.clone(), schema.clone());
            let collection =
                Collection::open(&name, storage.clone(), &config.index_dir(), schema)?;
            collections.insert(name, collection);
        }
        log::info!(
            "database open at {:?} with {} collection(s)",
            config.data_root,
            collections.len()
        );

        let persist_task = Mutex::new(Some(tokio::spawn(schema_persist_task(
            collections.clone(),
            storage.clone(),
            config.schema_persist_interval(),
            last_saved,
        ))));

        Ok(Database {
            config,
            storage,
            collections,
            persist_task,
        })
    }

    /// Returns the named collection, creating it with a default schema on
    /// first reference.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>, DbError> {
        validate_collection_name(name)?;
        match self.collections.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(slot) => {
                let collection = Collection::open(
                    name,
                    self.storage.clone(),
                    &self.config.index_dir(),
                    CollectionSchema::with_defaults(name),
                )?;
                slot.insert(collection.clone());
                Ok(collection)
            }
        }
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.iter().map(|e| e.key().clone()).collect()
    }

    /// Removes the collection from the registry, tears it down, and
    /// deletes its schema row. The registry removal stands even when the
    /// teardown fails, leaving the system consistent.
    pub async fn drop_collection(&self, name: &str) -> Result<(), DbError> {
        let (_, collection) = self
            .collections
            .remove(name)
            .ok_or_else(|| DbError::NotFound(format!("collection '{name}'")))?;
        collection.destroy().await?;
        self.storage.delete(SCHEMA_NAMESPACE, name).await?;
        Ok(())
    }

    /// Writes every live schema to the schema namespace now.
    pub async fn flush_schemas(&self) -> Result<(), DbError> {
        let collections = snapshot_collections(&self.collections);
        for collection in collections {
            let schema = collection.schema_snapshot().await;
            self.storage
                .insert(SCHEMA_NAMESPACE, &schema.name, &schema)
                .await?;
        }
        Ok(())
    }

    /// Stops the persistence tick, flushes schemas once, and closes every
    /// collection index.
    pub async fn shutdown(&self) -> Result<(), DbError> {
        if let Ok(mut guard) = self.persist_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        self.flush_schemas().await?;
        for collection in snapshot_collections(&self.collections) {
            collection.close()?;
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.persist_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

fn validate_collection_name(name: &str) -> Result<(), DbError> {
    if name.trim().is_empty() {
        return Err(DbError::InvalidArgument(
            "collection name must not be blank".into(),
        ));
    }
    if name == SCHEMA_NAMESPACE || (name.starts_with("__") && name.ends_with("__")) {
        return Err(DbError::InvalidArgument(format!(
            "collection name '{name}' is reserved"
        )));
    }
    Ok(())
}

/// Clones the registry contents so no map lock is held across awaits.
fn snapshot_collections(
    collections: &DashMap<String, Arc<Collection>>,
) -> Vec<Arc<Collection>> {
    collections.iter().map(|e| e.value().clone()).collect()
}

/// Periodically snapshots each live schema and writes it back, inserting
/// on first sight and updating only on change. Never propagates errors.
#[tracing::instrument(skip_all)]
async fn schema_persist_task(
    collections: Arc<DashMap<String, Arc<Collection>>>,
    storage: StorageEngine,
    period: Duration,
    mut last_saved: HashMap<String, CollectionSchema>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        persist_pass(&collections, &storage, &mut last_saved).await;
    }
}

async fn persist_pass(
    collections: &DashMap<String, Arc<Collection>>,
    storage: &StorageEngine,
    last_saved: &mut HashMap<String, CollectionSchema>,
) {
    for collection in snapshot_collections(collections) {
        let handle = collection.schema_handle();
        let snapshot = match tokio::time::timeout(SCHEMA_LOCK_TIMEOUT, handle.read()).await {
            Ok(guard) => guard.clone(),
            Err(_) => {
                log::debug!(
                    "schema lock of '{}' contended, skipping this tick",
                    collection.name()
                );
                continue;
            }
        };

        if last_saved.get(&snapshot.name) == Some(&snapshot) {
            continue;
        }
        match storage
            .insert(SCHEMA_NAMESPACE, &snapshot.name, &snapshot)
            .await
        {
            Ok(()) => {
                last_saved.insert(snapshot.name.clone(), snapshot);
            }
            Err(err) => {
                log::warn!("unable to persist schema of '{}': {err}", snapshot.name)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use shared::document::Document;
    use shared::request::SearchCriteria;

    fn doc(payload: serde_json::Value) -> Document {
        Document::from_json(&payload).unwrap()
    }

    async fn database(dir: &tempfile::TempDir) -> Database {
        Database::open(Config::new(dir.path())).await.unwrap()
    }

    #[tokio::test]
    async fn open_creates_directory_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = database(&dir).await;
        assert!(db.config.data_dir().is_dir());
        assert!(db.config.index_dir().is_dir());
    }

    #[tokio::test]
    async fn collections_are_created_on_first_reference() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = database(&dir).await;

        let books = db.collection("books").unwrap();
        let same = db.collection("books").unwrap();
        assert!(Arc::ptr_eq(&books, &same));
        assert_eq!(db.collection_names(), vec!["books".to_string()]);
    }

    #[tokio::test]
    async fn reserved_and_blank_names_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = database(&dir).await;

        for bad in ["", "  ", "__schema__", "__anything__"] {
            assert!(matches!(
                db.collection(bad),
                Err(DbError::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn pagination_window_and_counts() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = database(&dir).await;
        let books = db.collection("books").unwrap();

        for n in 0..25 {
            books
                .insert(doc(json!({ "title": format!("book {n}") })))
                .await
                .unwrap();
        }
        books.refresh().unwrap();

        let results = books
            .search(&SearchCriteria::with_query("*:*").page(3, 10))
            .await
            .unwrap();
        assert_eq!(results.hit_count, 5);
        assert_eq!(results.total_hit_count, 25);
        assert_eq!(results.page_count, 3);
        assert_eq!(results.items.len(), 5);

        // Pages past the end are empty but well-formed.
        let results = books
            .search(&SearchCriteria::with_query("*:*").page(4, 10))
            .await
            .unwrap();
        assert_eq!(results.hit_count, 0);
        assert_eq!(results.page_count, 3);
    }

    #[tokio::test]
    async fn drop_then_recreate_yields_an_empty_collection() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = database(&dir).await;

        let books = db.collection("books").unwrap();
        books.insert(doc(json!({ "title": "x" }))).await.unwrap();
        books.refresh().unwrap();

        db.drop_collection("books").await.unwrap();

        // The old handle is dead.
        assert!(matches!(
            books.search(&SearchCriteria::default()).await,
            Err(DbError::NotFound(_))
        ));
        // Dropping twice reports NotFound.
        assert!(matches!(
            db.drop_collection("books").await,
            Err(DbError::NotFound(_))
        ));

        // A fresh reference starts from scratch.
        let books = db.collection("books").unwrap();
        books.refresh().unwrap();
        let results = books.search(&SearchCriteria::default()).await.unwrap();
        assert_eq!(results.total_hit_count, 0);
        let schema = books.schema_snapshot().await;
        assert!(schema.field("title").is_none());
    }

    #[tokio::test]
    async fn schemas_and_documents_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let id = {
            let db = database(&dir).await;
            let books = db.collection("books").unwrap();
            let id = books
                .insert(doc(json!({ "title": "Persistent", "count": 3 })))
                .await
                .unwrap();
            db.shutdown().await.unwrap();
            id
        };

        let db = database(&dir).await;
        assert_eq!(db.collection_names(), vec!["books".to_string()]);

        let books = db.collection("books").unwrap();
        let schema = books.schema_snapshot().await;
        assert_eq!(
            schema.field("count").unwrap().data_type,
            lodestore_searcher::schema::DataType::Number
        );

        books.refresh().unwrap();
        let results = books
            .search(&SearchCriteria::with_query("title:Persistent"))
            .await
            .unwrap();
        assert_eq!(results.total_hit_count, 1);
        assert_eq!(results.items[0].id(), Some(id));
    }

    #[tokio::test]
    async fn persistence_tick_writes_changed_schemas() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::new(dir.path());
        config.schema_persist_interval_secs = 0.05;
        let db = Database::open(config).await.unwrap();

        let books = db.collection("books").unwrap();
        books.insert(doc(json!({ "title": "x" }))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;

        let saved: Vec<CollectionSchema> =
            db.storage.get_all(SCHEMA_NAMESPACE).await.unwrap();
        let books_schema = saved.iter().find(|s| s.name == "books").unwrap();
        assert!(books_schema.field("title").is_some());
    }

    #[tokio::test]
    async fn unchanged_schema_persist_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = database(&dir).await;
        let books = db.collection("books").unwrap();
        books.insert(doc(json!({ "title": "x" }))).await.unwrap();

        db.flush_schemas().await.unwrap();
        let first: Vec<CollectionSchema> = db.storage.get_all(SCHEMA_NAMESPACE).await.unwrap();

        db.flush_schemas().await.unwrap();
        let second: Vec<CollectionSchema> = db.storage.get_all(SCHEMA_NAMESPACE).await.unwrap();

        // Rewriting an unchanged schema moves no timestamps.
        assert_eq!(first, second);
    }
}
