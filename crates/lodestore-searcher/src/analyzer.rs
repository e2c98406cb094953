//! Text analysis and per-field routing.
//!
//! Two analyzers cover every field: the custom tokenizer chain for free
//! text and tantivy's built-in `raw` analyzer for identifier-like values.
//! Which one applies to a field is decided against the live collection
//! schema; routing materializes as the choice between the tokenized and
//! verbatim JSON fields of the physical schema.

use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, TextAnalyzer,
};
use tantivy::Index;

use shared::document::{FIELD_FULL_TEXT, FIELD_ID};

use crate::schema::{CollectionSchema, DataType, FIELD_EXACT, FIELD_TEXT};

/// Name of the tokenizer registered with every collection index.
pub const TOKENIZER_NAME: &str = "lodestore_tokenizer_en";

/// Tokens longer than this are dropped by the analysis pipeline.
const MAX_TOKEN_LENGTH: usize = 40;

/// Builds the full-text analyzer: simple tokenization, lower-casing,
/// long-token removal, English stemming.
pub fn build_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(RemoveLongFilter::limit(MAX_TOKEN_LENGTH))
        .filter(Stemmer::new(Language::English))
        .build()
}

/// Registers the custom tokenizer on an index.
pub fn register_tokenizer(index: &Index) {
    index.tokenizers().register(TOKENIZER_NAME, build_analyzer());
}

/// How a field's values are analyzed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldRoute {
    /// Free text, run through the tokenizer chain.
    Tokenized,
    /// Identifier-like, indexed verbatim.
    Verbatim,
}

impl FieldRoute {
    /// The physical JSON field carrying search entries for this route.
    pub fn physical_field(self) -> &'static str {
        match self {
            FieldRoute::Tokenized => FIELD_TEXT,
            FieldRoute::Verbatim => FIELD_EXACT,
        }
    }
}

/// Chooses the analyzer route for a (possibly dotted) field name against
/// the live schema. Unknown names default to the tokenizer.
pub fn route_for(schema: &CollectionSchema, name: &str) -> FieldRoute {
    match schema.resolve(name) {
        Some(field) => match field.effective_type() {
            DataType::Text if field.is_tokenized => FieldRoute::Tokenized,
            DataType::Null => FieldRoute::Tokenized,
            _ => FieldRoute::Verbatim,
        },
        None => FieldRoute::Tokenized,
    }
}

/// Maps a query-level field name onto the physical field path it is
/// indexed under.
pub fn physical_path(schema: &CollectionSchema, name: &str) -> String {
    // Reserved names address physical fields directly.
    if name == FIELD_ID || name == FIELD_FULL_TEXT {
        return name.to_string();
    }
    // Null markers always live on the verbatim field.
    if name.starts_with("__") && name.ends_with("_null__") {
        return format!("{FIELD_EXACT}.{name}");
    }
    format!("{}.{name}", route_for(schema, name).physical_field())
}
