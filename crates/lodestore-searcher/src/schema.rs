//! Collection schemas and the physical index schema.
//!
//! A [`CollectionSchema`] is the live, lazily grown description of the
//! fields a collection has seen. It is the authority the projector, the
//! query rewriter, and the analyzer routing consult. The physical tantivy
//! schema underneath it is fixed: dynamic document fields land on two JSON
//! fields (tokenized and verbatim) so the index never needs rebuilding as
//! the collection schema grows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tantivy::schema::{
    Field, IndexRecordOption, JsonObjectOptions, Schema, TextFieldIndexing, TextOptions,
    FacetOptions, FAST, STORED, STRING,
};
use thiserror::Error;
use uuid::Uuid;

use shared::document::{Value, FIELD_CREATED, FIELD_FULL_TEXT, FIELD_ID, FIELD_MODIFIED};

use crate::analyzer::TOKENIZER_NAME;

/// Physical field carrying tokenized search entries.
pub const FIELD_TEXT: &str = "text";
/// Physical field carrying verbatim search entries, numerics, and null
/// markers.
pub const FIELD_EXACT: &str = "exact";
/// Stored-only blob of per-field sort keys.
pub const FIELD_SORT_KEYS: &str = "sortkeys";
/// Stored-only blob of per-field group values.
pub const FIELD_GROUP_KEYS: &str = "groups";
/// Hierarchical facet entries of caller-declared facet fields.
pub const FIELD_FACETS: &str = "facets";

/// The type a field settles into once a non-null value has been observed.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    Null,
    Bool,
    Number,
    Text,
    Timestamp,
    Guid,
    Array,
    Object,
}

impl DataType {
    pub fn of(value: &Value) -> DataType {
        match value {
            Value::Null => DataType::Null,
            Value::Bool(_) => DataType::Bool,
            Value::Number(_) => DataType::Number,
            Value::Text(_) => DataType::Text,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Guid(_) => DataType::Guid,
            Value::Array(_) => DataType::Array,
            Value::Object(_) => DataType::Object,
        }
    }

    /// Scalar types that can carry a sort key.
    pub fn is_leaf(self) -> bool {
        !matches!(self, DataType::Array | DataType::Object)
    }
}

/// A value's type disagrees with the type the schema has already latched.
#[derive(Debug, Error)]
#[error("field '{field}' is {expected} but the document holds {actual}")]
pub struct SchemaConflict {
    pub field: String,
    pub expected: DataType,
    pub actual: DataType,
}

/// One observed field. `name` is the key within its owning schema: local
/// for top-level fields, dotted for fields of nested object schemas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub is_tokenized: bool,
    #[serde(default)]
    pub is_sortable: bool,
    #[serde(default)]
    pub is_facet: bool,
    #[serde(default)]
    pub array_element_type: Option<DataType>,
    #[serde(default)]
    pub object_schema: Option<Box<CollectionSchema>>,
}

impl SchemaField {
    fn new(name: &str) -> Self {
        SchemaField {
            name: name.to_string(),
            data_type: DataType::Null,
            is_tokenized: false,
            is_sortable: false,
            is_facet: false,
            array_element_type: None,
            object_schema: None,
        }
    }

    fn adopt(&mut self, data_type: DataType, sortable: bool) {
        self.data_type = data_type;
        self.is_tokenized = data_type == DataType::Text;
        self.is_sortable = sortable && data_type.is_leaf();
        if data_type == DataType::Array && self.array_element_type.is_none() {
            self.array_element_type = Some(DataType::Null);
        }
    }

    /// The type driving analyzer routing: the element type for arrays, the
    /// field type otherwise.
    pub fn effective_type(&self) -> DataType {
        match self.data_type {
            DataType::Array => self.array_element_type.unwrap_or(DataType::Null),
            other => other,
        }
    }
}

/// The set of field descriptors a collection has accumulated. Nested object
/// schemas hang off their parent field and name their fields with the
/// parent's dotted prefix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub fields: BTreeMap<String, SchemaField>,
}

impl CollectionSchema {
    /// An empty schema carrying only the reserved metadata fields.
    pub fn with_defaults(name: &str) -> Self {
        let mut schema = Self::empty(name);
        let id = schema
            .fields
            .entry(FIELD_ID.to_string())
            .or_insert_with(|| SchemaField::new(FIELD_ID));
        id.adopt(DataType::Guid, true);
        for meta in [FIELD_CREATED, FIELD_MODIFIED] {
            let field = schema
                .fields
                .entry(meta.to_string())
                .or_insert_with(|| SchemaField::new(meta));
            field.adopt(DataType::Timestamp, true);
        }
        schema
    }

    /// A child schema for a nested object field; `name` is the dotted path
    /// of the parent field.
    pub fn child(name: &str) -> Self {
        Self::empty(name)
    }

    fn empty(name: &str) -> Self {
        let now = Utc::now();
        CollectionSchema {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: now,
            modified_at: now,
            fields: BTreeMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.get(name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut SchemaField> {
        self.fields.get_mut(name)
    }

    /// Registers a field or type-checks it against what is already there.
    ///
    /// A stored `Null` adopts the incoming type; identical or incoming-null
    /// types pass; anything else is a [`SchemaConflict`] and the caller is
    /// expected to skip the value. `sortable` only applies on adoption and
    /// is ignored for arrays and objects.
    pub fn add_or_get(
        &mut self,
        name: &str,
        incoming: DataType,
        sortable: bool,
    ) -> Result<&mut SchemaField, SchemaConflict> {
        if !self.fields.contains_key(name) {
            let mut field = SchemaField::new(name);
            if incoming != DataType::Null {
                field.adopt(incoming, sortable);
            }
            self.fields.insert(name.to_string(), field);
            self.modified_at = Utc::now();
            return Ok(self.fields.get_mut(name).unwrap());
        }

        let current = self.fields.get(name).unwrap().data_type;
        if current == DataType::Null && incoming != DataType::Null {
            self.modified_at = Utc::now();
            let field = self.fields.get_mut(name).unwrap();
            field.adopt(incoming, sortable);
            Ok(field)
        } else if incoming == DataType::Null || incoming == current {
            Ok(self.fields.get_mut(name).unwrap())
        } else {
            Err(SchemaConflict {
                field: name.to_string(),
                expected: current,
                actual: incoming,
            })
        }
    }

    /// Walks a dotted path through nested object schemas.
    pub fn resolve(&self, path: &str) -> Option<&SchemaField> {
        let mut segments = path.split('.');
        let mut key = segments.next()?.to_string();
        let mut schema = self;
        let mut field = schema.fields.get(&key)?;
        for segment in segments {
            schema = field.object_schema.as_deref()?;
            key = format!("{key}.{segment}");
            field = schema.fields.get(&key)?;
        }
        Some(field)
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// Handles to the fixed physical fields of a collection index.
#[derive(Clone)]
pub struct IndexFields {
    pub id: Field,
    pub text: Field,
    pub exact: Field,
    pub full_text: Field,
    pub sort_keys: Field,
    pub group_keys: Field,
    pub facets: Field,
}

impl IndexFields {
    pub fn as_schema() -> Schema {
        let tokenized_indexing = TextFieldIndexing::default()
            .set_tokenizer(TOKENIZER_NAME)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions);
        let verbatim_indexing = TextFieldIndexing::default()
            .set_tokenizer("raw")
            .set_index_option(IndexRecordOption::Basic);

        let mut builder = Schema::builder();
        // The id is the only stored search entry; FAST backs dedup and
        // future aggregation paths.
        builder.add_text_field(FIELD_ID, STRING | STORED | FAST);
        builder.add_json_field(
            FIELD_TEXT,
            JsonObjectOptions::default()
                .set_indexing_options(tokenized_indexing.clone())
                .set_expand_dots_enabled(),
        );
        builder.add_json_field(
            FIELD_EXACT,
            JsonObjectOptions::default()
                .set_indexing_options(verbatim_indexing)
                .set_expand_dots_enabled(),
        );
        builder.add_text_field(
            FIELD_FULL_TEXT,
            TextOptions::default().set_indexing_options(tokenized_indexing),
        );
        // Sort and group blobs are row storage only, never searched.
        builder.add_text_field(FIELD_SORT_KEYS, TextOptions::default().set_stored());
        builder.add_text_field(FIELD_GROUP_KEYS, TextOptions::default().set_stored());
        builder.add_facet_field(FIELD_FACETS, FacetOptions::default());
        builder.build()
    }

    pub fn from_schema(schema: &Schema) -> Self {
        IndexFields {
            id: schema.get_field(FIELD_ID).expect("No _id in schema"),
            text: schema.get_field(FIELD_TEXT).expect("No text in schema"),
            exact: schema.get_field(FIELD_EXACT).expect("No exact in schema"),
            full_text: schema
                .get_field(FIELD_FULL_TEXT)
                .expect("No full text in schema"),
            sort_keys: schema
                .get_field(FIELD_SORT_KEYS)
                .expect("No sort keys in schema"),
            group_keys: schema
                .get_field(FIELD_GROUP_KEYS)
                .expect("No group keys in schema"),
            facets: schema.get_field(FIELD_FACETS).expect("No facets in schema"),
        }
    }
}
