//! Pagination and list query helpers for the SalonFlow API

use serde::{Deserialize, Serialize};

/// Default page size if not specified
pub const DEFAULT_PAGE_SIZE: i64 = 25;
/// Maximum allowed page size
pub const MAX_PAGE_SIZE: i64 = 100;
/// Default page number (1-indexed for API consumers)
pub const DEFAULT_PAGE: i64 = 1;

/// Sortable workflow columns
pub const WORKFLOW_SORT_FIELDS: &[&str] = &["title", "created_at", "modified_at", "execution_count"];

/// Standard pagination query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    /// Page number (1-indexed)
    #[serde(default = "default_page")]
    pub page: i64,
    /// Number of items per page
    #[serde(default = "default_per_page")]
    pub per_page: i64,
    pub sort_by: Option<String>,
    /// Sort direction (asc/desc)
    #[serde(default = "default_sort_order")]
    pub sort_order: String,
}

fn default_page() -> i64 {
    DEFAULT_PAGE
}

fn default_per_page() -> i64 {
    DEFAULT_PAGE_SIZE
}

fn default_sort_order() -> String {
    "desc".to_string()
}

impl PaginationParams {
    pub fn new(page: i64, per_page: i64) -> Self {
        Self {
            page,
            per_page,
            ..Default::default()
        }
    }

    /// Get SQL OFFSET value
    pub fn offset(&self) -> i64 {
        (self.page() - 1) * self.limit()
    }

    /// Get SQL LIMIT value
    pub fn limit(&self) -> i64 {
        self.per_page.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn page(&self) -> i64 {
        self.page.max(1)
    }

    pub fn is_ascending(&self) -> bool {
        self.sort_order.eq_ignore_ascii_case("asc")
    }

    /// Validate and sanitize sort field against allowed fields
    pub fn validated_sort_field(&self, allowed: &[&str], default: &str) -> String {
        self.sort_by
            .as_ref()
            .filter(|s| allowed.contains(&s.as_str()))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            per_page: DEFAULT_PAGE_SIZE,
            sort_by: None,
            sort_order: default_sort_order(),
        }
    }
}

/// Pagination metadata returned with list responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub total_pages: i64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(page: i64, per_page: i64, total: i64) -> Self {
        let total_pages = (total as f64 / per_page as f64).ceil() as i64;
        Self {
            page,
            per_page,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

/// Standard paginated response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub meta: PaginationMeta,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, params: &PaginationParams, total: i64) -> Self {
        Self {
            data,
            meta: PaginationMeta::new(params.page(), params.limit(), total),
        }
    }
}

/// Query string for `GET /workflows`.
///
/// Fields are inlined rather than flattened from [`PaginationParams`]:
/// `serde(flatten)` routes numbers through an untyped buffer, which breaks
/// `page=2` coming from a query string.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WorkflowListParams {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub per_page: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    /// Free-text search over title and description
    pub q: Option<String>,
    /// `active`, `inactive` or `all`
    pub status: Option<String>,
    pub trigger_category: Option<String>,
    pub trigger_type: Option<String>,
    pub action_type: Option<String>,
}

impl WorkflowListParams {
    pub fn pagination(&self) -> PaginationParams {
        PaginationParams {
            page: self.page.unwrap_or(DEFAULT_PAGE),
            per_page: self.per_page.unwrap_or(DEFAULT_PAGE_SIZE),
            sort_by: self.sort_by.clone(),
            sort_order: self.sort_order.clone().unwrap_or_else(default_sort_order),
        }
    }

    /// Trimmed free-text search term, if any
    pub fn search_term(&self) -> Option<String> {
        self.q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
    }
}

/// Query string for paged sub-collections such as execution history.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl PageQuery {
    pub fn pagination(&self) -> PaginationParams {
        PaginationParams::new(
            self.page.unwrap_or(DEFAULT_PAGE),
            self.per_page.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }
}
