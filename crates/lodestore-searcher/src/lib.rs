//! Tantivy-backed search index for lodestore collections.
//!
//! Each collection owns one [`SearchIndex`]: a single internally
//! synchronized writer, a refreshable near-real-time reader, and a
//! periodic tick that keeps readers at most one refresh interval behind
//! the last commit. Mutations commit synchronously; commits are the
//! durability boundary.

use std::fmt::{Debug, Error, Formatter};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, Query, QueryParser};
use tantivy::schema::Value as _;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use thiserror::Error as ThisError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use shared::document::{FIELD_FULL_TEXT, FIELD_ID};

pub mod analyzer;
pub mod projection;
pub mod query;
pub mod schema;

use analyzer::register_tokenizer;
use projection::ProjectedDocument;
use query::{order_hits, SortKey, SortSpec};
use schema::{CollectionSchema, IndexFields, FIELD_EXACT, FIELD_FACETS, FIELD_GROUP_KEYS, FIELD_SORT_KEYS, FIELD_TEXT};

/// Heap handed to the tantivy writer.
const WRITER_HEAP_SIZE: usize = 50_000_000;

/// Period of the reader refresh tick.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

pub enum IndexPath {
    // Directory
    LocalPath(PathBuf),
    // In memory index for testing purposes.
    Memory,
}

#[derive(ThisError, Debug)]
pub enum SearchError {
    #[error("Unable to perform action on index: {0}")]
    Index(#[from] tantivy::TantivyError),
    #[error("Unable to parse query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },
    #[error("Index writer is deadlocked")]
    WriterLocked,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type SearcherResult<T> = Result<T, SearchError>;

/// Ordered ids of the top hits plus the index-wide match count.
#[derive(Clone, Debug, Default)]
pub struct SearchHits {
    pub total: usize,
    pub doc_ids: Vec<String>,
}

/// The writer/searcher pair over one collection's index directory.
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    writer: Arc<Mutex<IndexWriter>>,
    fields: IndexFields,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for SearchIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        f.debug_struct("SearchIndex")
            .field("index", &self.index)
            .finish()
    }
}

impl SearchIndex {
    /// Opens or creates the index at `index_path` and starts the refresh
    /// tick when a tokio runtime is present.
    pub fn with_index(index_path: &IndexPath) -> SearcherResult<Self> {
        let index = match index_path {
            IndexPath::LocalPath(path) => {
                fs::create_dir_all(path).map_err(anyhow::Error::new)?;
                let dir = MmapDirectory::open(path)
                    .map_err(|err| SearchError::Index(err.into()))?;
                Index::open_or_create(dir, IndexFields::as_schema())?
            }
            IndexPath::Memory => Index::create_in_ram(IndexFields::as_schema()),
        };
        register_tokenizer(&index);

        // One writer for the lifetime of the index; tantivy serializes
        // operations internally.
        let writer = Arc::new(Mutex::new(index.writer(WRITER_HEAP_SIZE)?));

        // Readers reload on the tick, not on commit, so ingestion never
        // stalls on segment reopen.
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        let refresh_task = Mutex::new(spawn_refresh(&reader));
        let fields = IndexFields::from_schema(&index.schema());

        Ok(SearchIndex {
            index,
            reader,
            writer,
            fields,
            refresh_task,
        })
    }

    pub fn in_memory() -> SearcherResult<Self> {
        Self::with_index(&IndexPath::Memory)
    }

    fn lock_writer(&self) -> SearcherResult<MutexGuard<'_, IndexWriter>> {
        self.writer.lock().map_err(|_| SearchError::WriterLocked)
    }

    /// Stages a projected document; visible after [`commit`](Self::commit)
    /// and the next refresh.
    pub fn add_document(&self, projected: &ProjectedDocument) -> SearcherResult<()> {
        let doc = self.to_index_document(projected)?;
        let writer = self.lock_writer()?;
        writer.add_document(doc)?;
        Ok(())
    }

    /// Replaces the index entry carrying the projected document's id.
    pub fn update_document(&self, projected: &ProjectedDocument) -> SearcherResult<()> {
        let doc = self.to_index_document(projected)?;
        let writer = self.lock_writer()?;
        writer.delete_term(Term::from_field_text(self.fields.id, &projected.id));
        writer.add_document(doc)?;
        Ok(())
    }

    /// Deletes all index entries for a document id.
    pub fn delete_document(&self, doc_id: &str) -> SearcherResult<()> {
        let writer = self.lock_writer()?;
        writer.delete_term(Term::from_field_text(self.fields.id, doc_id));
        Ok(())
    }

    /// Durably flushes pending mutations. Blocks on fsync.
    pub fn commit(&self) -> SearcherResult<()> {
        let mut writer = self.lock_writer()?;
        writer.commit()?;
        Ok(())
    }

    /// Immediately reloads the reader instead of waiting for the tick.
    pub fn refresh(&self) -> SearcherResult<()> {
        self.reader.reload()?;
        Ok(())
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Runs one query against one acquired searcher snapshot and returns
    /// the ordered ids of the top `top_n` hits.
    pub fn execute(
        &self,
        schema: &CollectionSchema,
        raw_query: &str,
        top_n: usize,
        sort: Option<&SortSpec>,
    ) -> SearcherResult<SearchHits> {
        let parsed = self.build_query(schema, raw_query)?;

        // The snapshot lives for exactly this query.
        let searcher = self.reader.searcher();
        let collector = (TopDocs::with_limit(top_n.max(1)), Count);
        let (top_docs, total) = searcher.search(&parsed, &collector)?;

        let mut hits: Vec<(Option<SortKey>, String)> = Vec::with_capacity(top_docs.len());
        for (_score, address) in top_docs {
            let stored: TantivyDocument = searcher.doc(address)?;
            let Some(doc_id) = stored
                .get_first(self.fields.id)
                .and_then(|value| value.as_str())
                .map(str::to_string)
            else {
                continue;
            };
            let key = sort
                .and_then(|spec| extract_sort_key(&stored, &self.fields, &spec.field));
            hits.push((key, doc_id));
        }

        if let Some(spec) = sort {
            order_hits(&mut hits, spec.descending);
        }

        Ok(SearchHits {
            total,
            doc_ids: hits.into_iter().map(|(_, doc_id)| doc_id).collect(),
        })
    }

    /// Rewrites a raw query onto the physical fields and parses it, with
    /// `_full_text` as the default field. Empty queries match everything.
    fn build_query(
        &self,
        schema: &CollectionSchema,
        raw_query: &str,
    ) -> SearcherResult<Box<dyn Query>> {
        let trimmed = raw_query.trim();
        if trimmed.is_empty() || trimmed == "*:*" || trimmed == "*" {
            return Ok(Box::new(AllQuery));
        }

        let rewritten = query::rewrite_query(schema, trimmed);
        let parser = QueryParser::for_index(&self.index, vec![self.fields.full_text]);
        parser
            .parse_query(&rewritten)
            .map_err(|err| SearchError::InvalidQuery {
                query: raw_query.to_string(),
                reason: err.to_string(),
            })
    }

    /// Materializes a projection as a tantivy document.
    fn to_index_document(&self, projected: &ProjectedDocument) -> SearcherResult<TantivyDocument> {
        let mut root = serde_json::Map::new();
        root.insert(FIELD_ID.to_string(), serde_json::json!(projected.id));
        if !projected.text.is_empty() {
            root.insert(
                FIELD_TEXT.to_string(),
                serde_json::Value::Object(projected.text.clone()),
            );
        }
        if !projected.exact.is_empty() {
            root.insert(
                FIELD_EXACT.to_string(),
                serde_json::Value::Object(projected.exact.clone()),
            );
        }
        if !projected.full_text.is_empty() {
            root.insert(
                FIELD_FULL_TEXT.to_string(),
                serde_json::json!(projected.full_text),
            );
        }
        if !projected.sort_keys.is_empty() {
            let blob = serde_json::to_string(&projected.sort_keys).map_err(anyhow::Error::new)?;
            root.insert(FIELD_SORT_KEYS.to_string(), serde_json::json!(blob));
        }
        if !projected.group_keys.is_empty() {
            let blob = serde_json::to_string(&projected.group_keys).map_err(anyhow::Error::new)?;
            root.insert(FIELD_GROUP_KEYS.to_string(), serde_json::json!(blob));
        }
        if !projected.facets.is_empty() {
            root.insert(FIELD_FACETS.to_string(), serde_json::json!(projected.facets));
        }

        let payload =
            serde_json::to_string(&serde_json::Value::Object(root)).map_err(anyhow::Error::new)?;
        TantivyDocument::parse_json(&self.index.schema(), &payload)
            .map_err(|err| SearchError::Other(anyhow!("unable to build index document: {err}")))
    }

    /// Stops the refresh tick and flushes pending mutations.
    pub fn close(&self) -> SearcherResult<()> {
        if let Ok(mut guard) = self.refresh_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        self.commit()
    }
}

impl Drop for SearchIndex {
    fn drop(&mut self) {
        // The tick must not outlive its index.
        if let Ok(mut guard) = self.refresh_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// Starts the periodic reader reload. Outside a tokio runtime (plain unit
/// tests) callers fall back on explicit [`SearchIndex::refresh`].
fn spawn_refresh(reader: &IndexReader) -> Option<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let reader = reader.clone();
    Some(handle.spawn(refresh_loop(reader)))
}

#[tracing::instrument(skip_all)]
async fn refresh_loop(reader: IndexReader) {
    let mut tick = tokio::time::interval(REFRESH_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        if let Err(err) = reader.reload() {
            log::warn!("index refresh failed: {err}");
        }
    }
}

fn extract_sort_key(
    stored: &TantivyDocument,
    fields: &IndexFields,
    name: &str,
) -> Option<SortKey> {
    let blob = stored.get_first(fields.sort_keys)?.as_str()?;
    let keys: serde_json::Map<String, serde_json::Value> = serde_json::from_str(blob).ok()?;
    keys.get(name).and_then(SortKey::from_json)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::projection::project;
    use serde_json::json;
    use shared::document::Document;
    use uuid::Uuid;

    fn insert(
        index: &SearchIndex,
        schema: &mut CollectionSchema,
        payload: serde_json::Value,
    ) -> String {
        let mut doc = Document::from_json(&payload).expect("test document");
        doc.ensure_id();
        doc.set_created_at(chrono::Utc::now());
        doc.set_modified_at(chrono::Utc::now());
        let projected = project(&doc, schema).expect("projection");
        index.add_document(&projected).expect("add");
        projected.id
    }

    fn commit_and_refresh(index: &SearchIndex) {
        index.commit().expect("commit");
        index.refresh().expect("refresh");
    }

    #[tokio::test]
    async fn match_all_counts_every_document() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        for n in 0..3 {
            insert(&index, &mut schema, json!({ "title": format!("Book {n}") }));
        }
        commit_and_refresh(&index);

        let hits = index.execute(&schema, "*:*", 100, None).unwrap();
        assert_eq!(hits.total, 3);
        assert_eq!(hits.doc_ids.len(), 3);
        assert_eq!(index.num_docs(), 3);
    }

    #[tokio::test]
    async fn tokenized_field_search() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let id = insert(&index, &mut schema, json!({ "title": "Hello", "count": 3 }));
        insert(&index, &mut schema, json!({ "title": "Other", "count": 4 }));
        commit_and_refresh(&index);

        let hits = index.execute(&schema, "title:Hello", 100, None).unwrap();
        assert_eq!(hits.total, 1);
        assert_eq!(hits.doc_ids, vec![id]);
    }

    #[tokio::test]
    async fn numeric_field_term_lookup() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let id = insert(&index, &mut schema, json!({ "title": "a", "count": 3 }));
        insert(&index, &mut schema, json!({ "title": "b", "count": 4 }));
        commit_and_refresh(&index);

        let hits = index.execute(&schema, "count:3", 100, None).unwrap();
        assert_eq!(hits.doc_ids, vec![id]);
    }

    #[tokio::test]
    async fn full_text_carries_bare_terms() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let id = insert(
            &index,
            &mut schema,
            json!({ "title": "Relativity", "summary": "space and time" }),
        );
        commit_and_refresh(&index);

        let hits = index.execute(&schema, "relativity", 100, None).unwrap();
        assert_eq!(hits.doc_ids, vec![id.clone()]);
        let hits = index.execute(&schema, "space", 100, None).unwrap();
        assert_eq!(hits.doc_ids, vec![id]);
    }

    #[tokio::test]
    async fn nested_field_search_uses_dotted_paths() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let id = insert(
            &index,
            &mut schema,
            json!({ "author": { "name": "Ada", "age": 36 } }),
        );
        insert(
            &index,
            &mut schema,
            json!({ "author": { "name": "Brian", "age": 50 } }),
        );
        commit_and_refresh(&index);

        let hits = index
            .execute(&schema, "author.name:Ada", 100, None)
            .unwrap();
        assert_eq!(hits.doc_ids, vec![id]);
    }

    #[tokio::test]
    async fn id_term_lookup() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let id = insert(&index, &mut schema, json!({ "title": "Target" }));
        insert(&index, &mut schema, json!({ "title": "Noise" }));
        commit_and_refresh(&index);

        let hits = index
            .execute(&schema, &format!("_id:{id}"), 100, None)
            .unwrap();
        assert_eq!(hits.doc_ids, vec![id]);
    }

    #[tokio::test]
    async fn array_elements_match_individually() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let first = insert(&index, &mut schema, json!({ "tags": ["a", "b", "c"] }));
        let second = insert(&index, &mut schema, json!({ "tags": ["a", 1, "c"] }));
        commit_and_refresh(&index);

        let hits = index.execute(&schema, "tags:a", 100, None).unwrap();
        let mut ids = hits.doc_ids.clone();
        ids.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn delete_removes_from_results() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let id = insert(&index, &mut schema, json!({ "title": "Doomed" }));
        commit_and_refresh(&index);
        assert_eq!(index.execute(&schema, "*:*", 100, None).unwrap().total, 1);

        index.delete_document(&id).unwrap();
        commit_and_refresh(&index);
        assert_eq!(index.execute(&schema, "*:*", 100, None).unwrap().total, 0);
    }

    #[tokio::test]
    async fn update_replaces_the_entry() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let id = insert(&index, &mut schema, json!({ "title": "Before" }));
        commit_and_refresh(&index);

        let mut doc = Document::from_json(&json!({ "title": "After" })).unwrap();
        doc.set_id(Uuid::parse_str(&id).unwrap());
        let projected = project(&doc, &mut schema).unwrap();
        index.update_document(&projected).unwrap();
        commit_and_refresh(&index);

        assert_eq!(index.execute(&schema, "title:Before", 100, None).unwrap().total, 0);
        let hits = index.execute(&schema, "title:After", 100, None).unwrap();
        assert_eq!(hits.doc_ids, vec![id]);
    }

    #[tokio::test]
    async fn sorting_by_numeric_field() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let low = insert(&index, &mut schema, json!({ "title": "a", "count": 1 }));
        let high = insert(&index, &mut schema, json!({ "title": "b", "count": 9 }));
        let mid = insert(&index, &mut schema, json!({ "title": "c", "count": 5 }));
        commit_and_refresh(&index);

        let ascending = SortSpec {
            field: "count".into(),
            descending: false,
        };
        let hits = index.execute(&schema, "", 100, Some(&ascending)).unwrap();
        assert_eq!(hits.doc_ids, vec![low.clone(), mid.clone(), high.clone()]);

        let descending = SortSpec {
            field: "count".into(),
            descending: true,
        };
        let hits = index.execute(&schema, "", 100, Some(&descending)).unwrap();
        assert_eq!(hits.doc_ids, vec![high, mid, low]);
    }

    #[tokio::test]
    async fn sorting_by_text_field_is_case_insensitive() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let b = insert(&index, &mut schema, json!({ "title": "banana" }));
        let a = insert(&index, &mut schema, json!({ "title": "Apple" }));
        commit_and_refresh(&index);

        let spec = SortSpec {
            field: "title".into(),
            descending: false,
        };
        let hits = index.execute(&schema, "", 100, Some(&spec)).unwrap();
        assert_eq!(hits.doc_ids, vec![a, b]);
    }

    #[tokio::test]
    async fn null_marker_is_queryable() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        let id = insert(&index, &mut schema, json!({ "title": "x", "subtitle": null }));
        insert(&index, &mut schema, json!({ "title": "y", "subtitle": "present" }));
        commit_and_refresh(&index);

        let hits = index
            .execute(&schema, "__subtitle_null__:1", 100, None)
            .unwrap();
        assert_eq!(hits.doc_ids, vec![id]);
    }

    #[tokio::test]
    async fn index_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("idx");
        let mut schema = CollectionSchema::with_defaults("books");
        {
            let index = SearchIndex::with_index(&IndexPath::LocalPath(path.clone())).unwrap();
            insert(&index, &mut schema, json!({ "title": "Durable" }));
            index.commit().unwrap();
            index.close().unwrap();
        }

        let index = SearchIndex::with_index(&IndexPath::LocalPath(path)).unwrap();
        index.refresh().unwrap();
        let hits = index.execute(&schema, "title:Durable", 100, None).unwrap();
        assert_eq!(hits.total, 1);
    }

    #[tokio::test]
    async fn refresh_tick_makes_commits_visible() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        insert(&index, &mut schema, json!({ "title": "Eventually" }));
        index.commit().expect("commit");

        // No manual refresh; the 500 ms tick picks the commit up.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let hits = index.execute(&schema, "title:Eventually", 100, None).unwrap();
        assert_eq!(hits.total, 1);
    }

    #[tokio::test]
    async fn malformed_query_is_rejected() {
        let index = SearchIndex::in_memory().unwrap();
        let schema = CollectionSchema::with_defaults("books");
        let result = index.execute(&schema, "(((", 100, None);
        assert!(matches!(result, Err(SearchError::InvalidQuery { .. })));
    }

    #[tokio::test]
    async fn top_n_bounds_returned_ids_but_not_total() {
        let index = SearchIndex::in_memory().unwrap();
        let mut schema = CollectionSchema::with_defaults("books");
        for n in 0..10 {
            insert(&index, &mut schema, json!({ "title": format!("doc {n}") }));
        }
        commit_and_refresh(&index);

        let hits = index.execute(&schema, "*:*", 4, None).unwrap();
        assert_eq!(hits.total, 10);
        assert_eq!(hits.doc_ids.len(), 4);
    }
}
