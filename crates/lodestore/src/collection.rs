//! A named collection: one schema, one KV namespace, one search index.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use lodestore_searcher::projection::project;
use lodestore_searcher::query::parse_sort;
use lodestore_searcher::schema::{CollectionSchema, DataType};
use lodestore_searcher::{IndexPath, SearchIndex};
use shared::document::Document;
use shared::request::SearchCriteria;
use shared::response::SearchResults;

use crate::storage::StorageEngine;
use crate::DbError;

/// A set of documents sharing a schema and an index. Handles stay valid
/// across concurrent use; once dropped, every operation fails `NotFound`.
pub struct Collection {
    name: String,
    storage: StorageEngine,
    index: SearchIndex,
    index_path: PathBuf,
    schema: Arc<RwLock<CollectionSchema>>,
    is_dropped: AtomicBool,
    is_disposed: AtomicBool,
}

impl Collection {
    /// Opens the collection's namespace and index, creating both when
    /// absent.
    pub(crate) fn open(
        name: &str,
        storage: StorageEngine,
        index_root: &Path,
        schema: CollectionSchema,
    ) -> Result<Arc<Self>, DbError> {
        storage.initialize_namespace(name)?;
        let index_path = index_root.join(name);
        let index = SearchIndex::with_index(&IndexPath::LocalPath(index_path.clone()))?;

        Ok(Arc::new(Collection {
            name: name.to_string(),
            storage,
            index,
            index_path,
            schema: Arc::new(RwLock::new(schema)),
            is_dropped: AtomicBool::new(false),
            is_disposed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_usable(&self) -> Result<(), DbError> {
        if self.is_dropped.load(Ordering::SeqCst) {
            return Err(DbError::NotFound(format!("collection '{}'", self.name)));
        }
        Ok(())
    }

    /// Persists and indexes a document, assigning an id when absent.
    /// Returns the document id.
    pub async fn insert(&self, mut doc: Document) -> Result<Uuid, DbError> {
        self.ensure_usable()?;

        let id = doc.ensure_id();
        let now = Utc::now();
        doc.set_created_at(now);
        doc.set_modified_at(now);

        // The KV row is the source of truth and lands first.
        self.storage.insert(&self.name, &id.to_string(), &doc).await?;

        let projected = {
            let mut schema = self.schema.write().await;
            project(&doc, &mut schema)?
        };
        self.index.add_document(&projected)?;
        self.index.commit()?;
        Ok(id)
    }

    /// Replaces a stored document. The insert timestamp survives, the
    /// modification timestamp moves.
    pub async fn update(&self, mut doc: Document) -> Result<(), DbError> {
        self.ensure_usable()?;

        let id = doc.id().ok_or(DbError::MissingId)?;
        let key = id.to_string();
        let existing: Document = self
            .storage
            .get(&self.name, &key)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("document {id}")))?;

        if let Some(created) = existing.created_at() {
            doc.set_created_at(created);
        }
        doc.set_modified_at(Utc::now());

        if self.storage.update(&self.name, &key, &doc).await? == 0 {
            return Err(DbError::NotFound(format!("document {id}")));
        }

        let projected = {
            let mut schema = self.schema.write().await;
            project(&doc, &mut schema)?
        };
        self.index.update_document(&projected)?;
        self.index.commit()?;
        Ok(())
    }

    /// Removes a document from storage and from the index.
    pub async fn delete(&self, id: Uuid) -> Result<(), DbError> {
        self.ensure_usable()?;

        let key = id.to_string();
        if self.storage.delete(&self.name, &key).await? == 0 {
            return Err(DbError::NotFound(format!("document {id}")));
        }
        self.index.delete_document(&key)?;
        self.index.commit()?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Document>, DbError> {
        self.ensure_usable()?;
        Ok(self.storage.get(&self.name, &id.to_string()).await?)
    }

    /// Runs a ranked, optionally sorted, paginated query and resolves the
    /// page's hits back to full documents.
    pub async fn search(&self, criteria: &SearchCriteria) -> Result<SearchResults, DbError> {
        self.ensure_usable()?;
        if criteria.top_n == 0 {
            return Err(DbError::InvalidArgument("top_n must be positive".into()));
        }
        if criteria.items_per_page == 0 {
            return Err(DbError::InvalidArgument(
                "items_per_page must be positive".into(),
            ));
        }
        if criteria.page_number == 0 {
            return Err(DbError::InvalidArgument(
                "page_number must be positive".into(),
            ));
        }

        let sort = parse_sort(criteria.sort_by.as_deref());
        let hits = {
            let schema = self.schema.read().await;
            self.index
                .execute(&schema, &criteria.query, criteria.top_n, sort.as_ref())?
        };

        let start = (criteria.page_number - 1) * criteria.items_per_page;
        let mut items = Vec::new();
        for doc_id in hits.doc_ids.iter().skip(start).take(criteria.items_per_page) {
            match self.storage.get::<Document>(&self.name, doc_id).await? {
                Some(doc) => items.push(doc),
                // Crash window between index and KV; the row wins.
                None => log::warn!("document {doc_id} is indexed but missing from storage"),
            }
        }

        Ok(SearchResults::new(criteria, hits.total, items))
    }

    /// Flags a field for hierarchical facet projection.
    pub async fn declare_facet(&self, field_name: &str) -> Result<(), DbError> {
        self.ensure_usable()?;
        let mut schema = self.schema.write().await;
        {
            let field = schema
                .add_or_get(field_name, DataType::Null, false)
                .expect("a null observation never conflicts");
            field.is_facet = true;
        }
        schema.touch();
        Ok(())
    }

    /// Live document count as of the last refresh.
    pub fn count(&self) -> u64 {
        self.index.num_docs()
    }

    /// Makes every commit visible to the next search immediately instead
    /// of waiting for the refresh tick.
    pub fn refresh(&self) -> Result<(), DbError> {
        self.index.refresh()?;
        Ok(())
    }

    pub async fn schema_snapshot(&self) -> CollectionSchema {
        self.schema.read().await.clone()
    }

    pub(crate) fn schema_handle(&self) -> Arc<RwLock<CollectionSchema>> {
        self.schema.clone()
    }

    pub fn is_dropped(&self) -> bool {
        self.is_dropped.load(Ordering::SeqCst)
    }

    /// Tears the collection down: closes the index, deletes its segments,
    /// and removes every persisted payload.
    pub(crate) async fn destroy(&self) -> Result<(), DbError> {
        if self.is_dropped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.index.close()?;
        if self.index_path.exists() {
            std::fs::remove_dir_all(&self.index_path)?;
        }
        self.storage.drop_namespace(&self.name)?;
        self.is_disposed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stops background work and flushes the index without destroying
    /// data. Used on database shutdown.
    pub(crate) fn close(&self) -> Result<(), DbError> {
        self.index.close()?;
        Ok(())
    }
}
