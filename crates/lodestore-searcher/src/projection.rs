//! Document-to-index projection.
//!
//! Projection is the deterministic mapping from one dynamic document to
//! the entries its collection index receives, and it is the only code
//! path that grows a collection schema. Per leaf value it produces up to
//! three kinds of entries — a search entry on the tokenized or verbatim
//! JSON field, a sort key, and a group value — plus a null marker for
//! absent values and the synthetic `_full_text` catch-all.
//!
//! Type conflicts, illegal field names, nested arrays, and facet failures
//! are recovered locally: the offending value is skipped with a warning
//! and the rest of the document is indexed. Only a missing `_id` aborts
//! projection.

use std::collections::BTreeMap;

use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;

use shared::document::{
    canonical_number, is_metadata_field_name, is_reserved_field_name, number_to_json,
    timestamp_ticks, Document, Value, FIELD_ID,
};

use crate::schema::{CollectionSchema, DataType};

/// Sort and group values of text fields keep at most this many characters.
const DOCVALUE_TEXT_LIMIT: usize = 256;

/// Characters that make a field name illegal for indexing. The dot is
/// reserved for the projector's own nested-path names.
const ILLEGAL_NAME_CHARS: &[char] = &[
    '+', '&', '|', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~', '*', '?', ':', '\\', '/', '.',
];

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("cannot index a document without the _id field")]
    MissingId,
}

#[derive(Debug, Error)]
#[error("field '{field}' holds a value with no facet representation")]
pub struct FacetError {
    pub field: String,
}

/// The index entries of one projected document.
#[derive(Clone, Debug, Default)]
pub struct ProjectedDocument {
    /// Canonical lower-case document id, emitted first.
    pub id: String,
    /// Search entries routed to the tokenized JSON field.
    pub text: JsonMap<String, JsonValue>,
    /// Search entries routed to the verbatim JSON field, including null
    /// markers.
    pub exact: JsonMap<String, JsonValue>,
    /// Per-field sort keys: order-preserving integers for numerics,
    /// lower-cased truncated strings for text.
    pub sort_keys: JsonMap<String, JsonValue>,
    /// Per-field group values: the sortable integer for numerics,
    /// case-preserved truncated strings for text.
    pub group_keys: JsonMap<String, JsonValue>,
    /// Line-separated string forms of every non-metadata field.
    pub full_text: String,
    /// Hierarchical facet paths of declared facet fields.
    pub facets: Vec<String>,
}

/// Projects a document against the live schema, growing the schema as a
/// side effect. Fails only when `_id` is missing.
pub fn project(
    doc: &Document,
    schema: &mut CollectionSchema,
) -> Result<ProjectedDocument, ProjectionError> {
    let id = doc.id().ok_or(ProjectionError::MissingId)?;
    let id_text = id.to_string();

    let mut out = ProjectedDocument {
        id: id_text.clone(),
        ..Default::default()
    };
    // The id is sortable and groupable like any other GUID field; its
    // search entry lives on the dedicated stored field.
    out.sort_keys.insert(FIELD_ID.to_string(), json!(id_text));
    out.group_keys.insert(FIELD_ID.to_string(), json!(id_text));

    let mut changed = false;
    project_map(&mut out, schema, None, doc.as_map(), true, &mut changed);
    if changed {
        schema.touch();
    }

    out.full_text = build_full_text(doc);

    match build_facet_entries(schema, doc) {
        Ok(facets) => out.facets = facets,
        Err(err) => {
            log::warn!(
                "unable to build facets for document {id_text}, indexing without them: {err}"
            );
            out.facets.clear();
        }
    }

    Ok(out)
}

fn is_legal_field_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains(ILLEGAL_NAME_CHARS)
        && !name.chars().any(char::is_whitespace)
}

fn null_marker(name: &str) -> String {
    format!("__{name}_null__")
}

/// Inserts an entry, promoting repeated names (array elements) to a
/// multi-valued JSON array.
fn emit(map: &mut JsonMap<String, JsonValue>, key: &str, value: JsonValue) {
    match map.get_mut(key) {
        Some(JsonValue::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = JsonValue::Array(vec![first, value]);
        }
        None => {
            map.insert(key.to_string(), value);
        }
    }
}

fn project_map(
    out: &mut ProjectedDocument,
    schema: &mut CollectionSchema,
    prefix: Option<&str>,
    fields: &BTreeMap<String, Value>,
    top: bool,
    changed: &mut bool,
) {
    for (local, value) in fields {
        if top && local == FIELD_ID {
            continue;
        }
        let is_meta = top && is_metadata_field_name(local);
        if !is_meta {
            if is_reserved_field_name(local) {
                log::warn!("field name '{local}' is reserved, skipping");
                continue;
            }
            if !is_legal_field_name(local) {
                log::warn!("field name '{local}' is illegal for indexing, skipping");
                continue;
            }
        }
        let key = match prefix {
            Some(parent) => format!("{parent}.{local}"),
            None => local.clone(),
        };
        project_value(out, schema, &key, value, top, changed);
    }
}

fn project_value(
    out: &mut ProjectedDocument,
    schema: &mut CollectionSchema,
    key: &str,
    value: &Value,
    top: bool,
    changed: &mut bool,
) {
    match value {
        Value::Null => {
            let before = schema.modified_at;
            // Register the field so later documents can still adopt a type.
            let registered = schema.add_or_get(key, DataType::Null, top).is_ok();
            if registered && schema.modified_at > before {
                *changed = true;
            }
            emit(&mut out.exact, &null_marker(key), json!(1));
        }
        Value::Array(items) => project_array(out, schema, key, items, top, changed),
        Value::Object(map) => project_object(out, schema, key, map, top, changed),
        scalar => project_scalar(out, schema, key, scalar, top, changed),
    }
}

fn project_scalar(
    out: &mut ProjectedDocument,
    schema: &mut CollectionSchema,
    key: &str,
    value: &Value,
    top: bool,
    changed: &mut bool,
) {
    let before = schema.modified_at;
    let (tokenized, sortable) = match schema.add_or_get(key, DataType::of(value), top) {
        Ok(field) => (field.is_tokenized, field.is_sortable),
        Err(conflict) => {
            log::warn!("skipping value of '{key}': {conflict}");
            return;
        }
    };
    if schema.modified_at > before {
        *changed = true;
    }
    emit_scalar(out, key, value, tokenized, sortable);
}

fn emit_scalar(
    out: &mut ProjectedDocument,
    key: &str,
    value: &Value,
    tokenized: bool,
    sortable: bool,
) {
    match value {
        Value::Number(number) => {
            // Integral doubles index as integer terms so `count:3` style
            // lookups match the literal the caller wrote.
            emit(&mut out.exact, key, number_to_json(*number));
            if sortable {
                out.sort_keys
                    .insert(key.to_string(), json!(f64_sort_key(*number)));
            }
            emit(&mut out.group_keys, key, json!(f64_sort_key(*number)));
        }
        Value::Bool(flag) => {
            let bit = u64::from(*flag);
            emit(&mut out.exact, key, json!(bit));
            if sortable {
                out.sort_keys.insert(key.to_string(), json!(bit));
            }
            emit(&mut out.group_keys, key, json!(bit));
        }
        Value::Text(text) => {
            if tokenized {
                emit(&mut out.text, key, json!(text));
            } else {
                emit(&mut out.exact, key, json!(text));
            }
            let clipped = truncate_for_docvalues(text);
            if sortable {
                out.sort_keys
                    .insert(key.to_string(), json!(clipped.to_lowercase()));
            }
            emit(&mut out.group_keys, key, json!(clipped));
        }
        Value::Timestamp(instant) => {
            let ticks = timestamp_ticks(instant);
            emit(&mut out.exact, key, json!(ticks));
            if sortable {
                out.sort_keys
                    .insert(key.to_string(), json!(i64_sort_key(ticks)));
            }
            emit(&mut out.group_keys, key, json!(ticks));
        }
        Value::Guid(guid) => {
            let canonical = guid.to_string();
            emit(&mut out.exact, key, json!(canonical));
            if sortable {
                out.sort_keys.insert(key.to_string(), json!(canonical));
            }
            emit(&mut out.group_keys, key, json!(canonical));
        }
        // Handled by project_value.
        Value::Null | Value::Array(_) | Value::Object(_) => {}
    }
}

fn project_array(
    out: &mut ProjectedDocument,
    schema: &mut CollectionSchema,
    key: &str,
    items: &[Value],
    top: bool,
    changed: &mut bool,
) {
    let before = schema.modified_at;
    if let Err(conflict) = schema.add_or_get(key, DataType::Array, top) {
        log::warn!("skipping value of '{key}': {conflict}");
        return;
    }
    if schema.modified_at > before {
        *changed = true;
    }

    for item in items {
        let elem_type = DataType::of(item);
        if elem_type == DataType::Null {
            continue;
        }
        if elem_type == DataType::Array {
            log::warn!("nested arrays are unsupported, skipping an element of '{key}'");
            continue;
        }

        // Latch the element type on first sight, skip mismatches after.
        let mut skip = false;
        {
            let field = schema.field_mut(key).expect("array field just added");
            match field.array_element_type.unwrap_or(DataType::Null) {
                DataType::Null => {
                    field.array_element_type = Some(elem_type);
                    field.is_tokenized = elem_type == DataType::Text;
                    *changed = true;
                }
                latched if latched != elem_type => {
                    log::warn!(
                        "skipping a {elem_type} element of '{key}', elements are {latched}"
                    );
                    skip = true;
                }
                _ => {}
            }
        }
        if skip {
            continue;
        }
        if *changed {
            schema.touch();
        }

        match item {
            Value::Object(map) => project_into_child(out, schema, key, map, changed),
            scalar => {
                let tokenized = schema
                    .field(key)
                    .map(|field| field.is_tokenized)
                    .unwrap_or_default();
                emit_scalar(out, key, scalar, tokenized, false);
            }
        }
    }
}

fn project_object(
    out: &mut ProjectedDocument,
    schema: &mut CollectionSchema,
    key: &str,
    map: &BTreeMap<String, Value>,
    top: bool,
    changed: &mut bool,
) {
    let before = schema.modified_at;
    if let Err(conflict) = schema.add_or_get(key, DataType::Object, top) {
        log::warn!("skipping value of '{key}': {conflict}");
        return;
    }
    if schema.modified_at > before {
        *changed = true;
    }
    project_into_child(out, schema, key, map, changed);
}

/// Descends into the nested schema of an object field, synthesizing it on
/// first sight.
fn project_into_child(
    out: &mut ProjectedDocument,
    schema: &mut CollectionSchema,
    parent_key: &str,
    map: &BTreeMap<String, Value>,
    changed: &mut bool,
) {
    {
        let field = schema.field_mut(parent_key).expect("object field just added");
        if field.object_schema.is_none() {
            field.object_schema = Some(Box::new(CollectionSchema::child(parent_key)));
            *changed = true;
        }
    }
    let field = schema.field_mut(parent_key).expect("object field just added");
    let child = field
        .object_schema
        .as_mut()
        .expect("child schema just synthesized");
    project_map(out, child, Some(parent_key), map, false, changed);
}

/// Line-separated string forms of every non-metadata field, with arrays
/// and objects flattened recursively.
fn build_full_text(doc: &Document) -> String {
    let mut lines = Vec::new();
    for (name, value) in doc.iter() {
        if is_metadata_field_name(name) {
            continue;
        }
        append_string_form(&mut lines, value);
    }
    lines.join("\n")
}

fn append_string_form(lines: &mut Vec<String>, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(flag) => lines.push(flag.to_string()),
        Value::Number(number) => lines.push(canonical_number(*number)),
        Value::Text(text) => lines.push(text.clone()),
        Value::Timestamp(instant) => lines.push(instant.format("%Y-%m-%d").to_string()),
        Value::Guid(guid) => lines.push(guid.to_string()),
        Value::Array(items) => {
            for item in items {
                append_string_form(lines, item);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                append_string_form(lines, item);
            }
        }
    }
}

/// Builds hierarchical facet paths for every declared facet field present
/// on the document.
fn build_facet_entries(
    schema: &CollectionSchema,
    doc: &Document,
) -> Result<Vec<String>, FacetError> {
    let mut entries = Vec::new();
    for (name, field) in &schema.fields {
        if !field.is_facet {
            continue;
        }
        let Some(value) = doc.get(name) else { continue };
        match value {
            Value::Array(items) => {
                for item in items {
                    if let Some(text) = facet_text(item) {
                        push_facet(&mut entries, name, &text)?;
                    }
                }
            }
            other => {
                if let Some(text) = facet_text(other) {
                    push_facet(&mut entries, name, &text)?;
                }
            }
        }
    }
    Ok(entries)
}

fn push_facet(entries: &mut Vec<String>, name: &str, text: &str) -> Result<(), FacetError> {
    if text.is_empty() {
        return Err(FacetError {
            field: name.to_string(),
        });
    }
    entries.push(format!("/{name}/{text}"));
    Ok(())
}

fn facet_text(value: &Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text.clone()),
        Value::Number(number) => Some(canonical_number(*number)),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Guid(guid) => Some(guid.to_string()),
        Value::Timestamp(instant) => Some(instant.format("%Y-%m-%d").to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn truncate_for_docvalues(text: &str) -> String {
    text.chars()
        .take(DOCVALUE_TEXT_LIMIT)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Order-preserving mapping from a double onto an unsigned long. Positive
/// values get the sign bit set, negative values are bit-inverted.
pub fn f64_sort_key(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits >> 63 == 0 {
        bits | 0x8000_0000_0000_0000
    } else {
        !bits
    }
}

/// Order-preserving mapping from a signed long onto an unsigned long.
pub fn i64_sort_key(value: i64) -> u64 {
    (value as u64) ^ 0x8000_0000_0000_0000
}
