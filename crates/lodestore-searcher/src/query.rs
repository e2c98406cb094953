//! Query rewriting and sort handling.
//!
//! Callers address fields by their document names (`title`, `author.name`,
//! `count`). Physically those live under the tokenized or verbatim JSON
//! field, so before parsing, every `name:` prefix in the query string is
//! rewritten onto its physical path using the live schema. Bare terms fall
//! through to the `_full_text` catch-all.

use serde_json::Value as JsonValue;

use crate::analyzer::physical_path;
use crate::schema::CollectionSchema;

/// A requested result ordering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

/// Parses the `sort_by` criteria value: blank means relevance order, a
/// leading `-` flips to descending.
pub fn parse_sort(sort_by: Option<&str>) -> Option<SortSpec> {
    let raw = sort_by?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.strip_prefix('-') {
        Some(field) => Some(SortSpec {
            field: field.trim().to_string(),
            descending: true,
        }),
        None => Some(SortSpec {
            field: raw.to_string(),
            descending: false,
        }),
    }
}

fn is_field_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Rewrites `name:` prefixes onto their physical field paths. Quoted
/// sections pass through untouched, as does everything that is not a
/// field prefix.
pub fn rewrite_query(schema: &CollectionSchema, raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 16);
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    let mut in_quotes = false;
    // A field prefix can only start at the beginning of a term.
    let mut at_term_start = true;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            in_quotes = !in_quotes;
            out.push(c);
            i += 1;
            at_term_start = false;
            continue;
        }
        if in_quotes {
            out.push(c);
            i += 1;
            continue;
        }
        if at_term_start && is_field_name_char(c) {
            // Scan a candidate field name and check for the ':' suffix.
            let mut j = i;
            while j < chars.len() && is_field_name_char(chars[j]) {
                j += 1;
            }
            if j < chars.len() && chars[j] == ':' {
                let name: String = chars[i..j].iter().collect();
                out.push_str(&physical_path(schema, &name));
                out.push(':');
                i = j + 1;
                at_term_start = false;
                continue;
            }
            // Plain term, copy it through.
            for &term_char in &chars[i..j] {
                out.push(term_char);
            }
            i = j;
            at_term_start = false;
            continue;
        }

        at_term_start = c.is_whitespace() || matches!(c, '(' | '+' | '-' | '!');
        out.push(c);
        i += 1;
    }
    out
}

/// A materialized sort key read back from a hit's stored blob. Fields are
/// homogeneous by schema, so keys of one search compare within a single
/// variant; the `None` case (document missing the field) orders last.
#[derive(Clone, Debug, PartialEq)]
pub enum SortKey {
    Number(u64),
    Text(String),
}

impl SortKey {
    pub fn from_json(value: &JsonValue) -> Option<SortKey> {
        match value {
            JsonValue::Number(number) => number.as_u64().map(SortKey::Number),
            JsonValue::String(text) => Some(SortKey::Text(text.clone())),
            _ => None,
        }
    }
}

/// Orders hits by their optional sort key. Documents missing the field
/// sort last in both directions; only the key comparison itself flips on
/// descending. Ties keep encounter order.
pub fn order_hits<T>(hits: &mut [(Option<SortKey>, T)], descending: bool) {
    use std::cmp::Ordering;
    hits.sort_by(|(a, _), (b, _)| match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => {
            let ordering = compare_keys(x, y);
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
    });
}

fn compare_keys(a: &SortKey, b: &SortKey) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (SortKey::Number(x), SortKey::Number(y)) => x.cmp(y),
        (SortKey::Text(x), SortKey::Text(y)) => x.cmp(y),
        // Mixed kinds only happen on schema-skipped values; keep numbers first.
        (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
        (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::DataType;

    fn schema() -> CollectionSchema {
        let mut schema = CollectionSchema::with_defaults("books");
        schema.add_or_get("title", DataType::Text, true).unwrap();
        schema.add_or_get("count", DataType::Number, true).unwrap();
        schema
    }

    #[test]
    fn rewrites_known_fields_by_type() {
        let schema = schema();
        assert_eq!(rewrite_query(&schema, "title:Hello"), "text.title:Hello");
        assert_eq!(rewrite_query(&schema, "count:3"), "exact.count:3");
        assert_eq!(
            rewrite_query(&schema, "title:Hello count:3"),
            "text.title:Hello exact.count:3"
        );
    }

    #[test]
    fn unknown_fields_default_to_the_tokenizer() {
        let schema = schema();
        assert_eq!(rewrite_query(&schema, "unseen:x"), "text.unseen:x");
    }

    #[test]
    fn reserved_fields_pass_through() {
        let schema = schema();
        assert_eq!(
            rewrite_query(&schema, "_id:0f8fad5b-d9cb-469f-a165-70867728950e"),
            "_id:0f8fad5b-d9cb-469f-a165-70867728950e"
        );
        assert_eq!(rewrite_query(&schema, "_full_text:hello"), "_full_text:hello");
        assert_eq!(
            rewrite_query(&schema, "__count_null__:1"),
            "exact.__count_null__:1"
        );
    }

    #[test]
    fn bare_terms_are_untouched() {
        let schema = schema();
        assert_eq!(rewrite_query(&schema, "hello world"), "hello world");
    }

    #[test]
    fn quoted_sections_are_untouched() {
        let schema = schema();
        assert_eq!(
            rewrite_query(&schema, "title:\"a:b c:d\""),
            "text.title:\"a:b c:d\""
        );
        assert_eq!(rewrite_query(&schema, "\"count:3\""), "\"count:3\"");
    }

    #[test]
    fn negation_and_grouping_keep_field_prefixes() {
        let schema = schema();
        assert_eq!(rewrite_query(&schema, "-title:x"), "-text.title:x");
        assert_eq!(
            rewrite_query(&schema, "(title:x) AND count:3"),
            "(text.title:x) AND exact.count:3"
        );
    }

    #[test]
    fn range_values_survive() {
        let schema = schema();
        assert_eq!(
            rewrite_query(&schema, "count:[1 TO 5]"),
            "exact.count:[1 TO 5]"
        );
    }

    #[test]
    fn dotted_field_names_route_through_nested_schemas() {
        let mut schema = schema();
        let parent = schema.add_or_get("author", DataType::Object, true).unwrap();
        let mut child = CollectionSchema::child("author");
        child
            .add_or_get("author.name", DataType::Text, false)
            .unwrap();
        parent.object_schema = Some(Box::new(child));

        assert_eq!(
            rewrite_query(&schema, "author.name:Ada"),
            "text.author.name:Ada"
        );
    }

    #[test]
    fn sort_spec_parsing() {
        assert_eq!(parse_sort(None), None);
        assert_eq!(parse_sort(Some("  ")), None);
        assert_eq!(
            parse_sort(Some("count")),
            Some(SortSpec {
                field: "count".into(),
                descending: false
            })
        );
        assert_eq!(
            parse_sort(Some("-count")),
            Some(SortSpec {
                field: "count".into(),
                descending: true
            })
        );
    }

    #[test]
    fn ordering_puts_missing_keys_last_in_both_directions() {
        let mut hits = vec![
            (Some(SortKey::Number(5)), "b"),
            (None, "d"),
            (Some(SortKey::Number(1)), "a"),
            (Some(SortKey::Number(9)), "c"),
        ];
        order_hits(&mut hits, false);
        let order: Vec<&str> = hits.iter().map(|(_, id)| *id).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);

        order_hits(&mut hits, true);
        let order: Vec<&str> = hits.iter().map(|(_, id)| *id).collect();
        assert_eq!(order, vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn text_keys_compare_lexicographically() {
        let mut hits = vec![
            (Some(SortKey::Text("pear".into())), 1),
            (Some(SortKey::Text("apple".into())), 2),
        ];
        order_hits(&mut hits, false);
        assert_eq!(hits[0].1, 2);
    }
}
