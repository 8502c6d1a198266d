//! Paged listing request and response shapes shared by all backends.

use crate::models::object::ObjectAttrs;

/// One list-objects request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Only names starting with this string are returned.
    pub prefix: String,

    /// Include noncurrent generations (`true`) or only live objects (`false`).
    pub versions: bool,

    /// Continuation token from the previous page, `None` for the first page.
    pub page_token: Option<String>,

    /// Page size hint; the backend picks its own default when `None`.
    pub max_results: Option<u32>,
}

impl ListQuery {
    pub fn latest(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            versions: false,
            ..Self::default()
        }
    }

    pub fn all_versions(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            versions: true,
            ..Self::default()
        }
    }
}

/// One page of listing results.
#[derive(Debug, Default)]
pub struct ObjectsPage {
    pub items: Vec<ObjectAttrs>,
    /// `None` once the backend has nothing more to return.
    pub next_page_token: Option<String>,
}
