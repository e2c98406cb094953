use serde::Serialize;

use crate::document::Document;
use crate::request::SearchCriteria;

/// One page of search results, echoing the criteria that produced it.
#[derive(Clone, Debug, Serialize)]
pub struct SearchResults {
    pub query: String,
    pub sort_by: Option<String>,
    pub top_n: usize,
    pub items_per_page: usize,
    pub page_number: usize,
    /// Number of items on this page.
    pub hit_count: usize,
    /// Total matches reported by the index.
    pub total_hit_count: usize,
    pub page_count: usize,
    pub items: Vec<Document>,
}

impl SearchResults {
    pub fn new(criteria: &SearchCriteria, total_hit_count: usize, items: Vec<Document>) -> Self {
        let effective = total_hit_count.min(criteria.top_n);
        let page_count = effective.div_ceil(criteria.items_per_page);
        SearchResults {
            query: criteria.query.clone(),
            sort_by: criteria.sort_by.clone(),
            top_n: criteria.top_n,
            items_per_page: criteria.items_per_page,
            page_number: criteria.page_number,
            hit_count: items.len(),
            total_hit_count,
            page_count,
            items,
        }
    }
}
