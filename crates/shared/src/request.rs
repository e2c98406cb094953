use serde::{Deserialize, Serialize};

/// Number of index hits examined when not specified by the caller.
pub const DEFAULT_TOP_N: usize = 100_000;
pub const DEFAULT_ITEMS_PER_PAGE: usize = 10;
pub const DEFAULT_PAGE_NUMBER: usize = 1;

/// A search request against one collection.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SearchCriteria {
    /// Query string. Empty means match everything.
    #[serde(default)]
    pub query: String,
    /// Field to order by; a leading `-` flips to descending. `None` keeps
    /// relevance order.
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_items_per_page")]
    pub items_per_page: usize,
    #[serde(default = "default_page_number")]
    pub page_number: usize,
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

fn default_items_per_page() -> usize {
    DEFAULT_ITEMS_PER_PAGE
}

fn default_page_number() -> usize {
    DEFAULT_PAGE_NUMBER
}

impl Default for SearchCriteria {
    fn default() -> Self {
        SearchCriteria {
            query: String::new(),
            sort_by: None,
            top_n: DEFAULT_TOP_N,
            items_per_page: DEFAULT_ITEMS_PER_PAGE,
            page_number: DEFAULT_PAGE_NUMBER,
        }
    }
}

impl SearchCriteria {
    pub fn with_query(query: impl Into<String>) -> Self {
        SearchCriteria {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn sorted_by(mut self, field: impl Into<String>) -> Self {
        self.sort_by = Some(field.into());
        self
    }

    pub fn page(mut self, page_number: usize, items_per_page: usize) -> Self {
        self.page_number = page_number;
        self.items_per_page = items_per_page;
        self
    }
}
