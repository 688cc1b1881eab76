use serde::{Deserialize, Serialize};

/// Page size used for searches when none (or a non-positive one) is given.
pub const DEFAULT_SEARCH_PER_PAGE: u32 = 3;
/// Page size used for local listings when none is given.
pub const DEFAULT_LIST_PER_PAGE: u32 = 10;
/// Largest page size accepted at the request boundary.
pub const MAX_PER_PAGE: u32 = 100;

/// Unit of work carried by the queue.
///
/// Wire format is the JSON object `{"query": .., "page": .., "per_page": ..}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTask {
    /// Search terms; empty means the newest photos.
    pub query: String,
    /// 1-based page.
    pub page: i32,
    /// Results per page.
    pub per_page: i32,
}

impl SearchTask {
    /// Build a task at the producer boundary: page falls back to 1 when not
    /// positive, per_page falls back to 3 when outside `(0, 100]`.
    pub fn new(query: impl Into<String>, page: i32, per_page: i32) -> Self {
        let page = if page <= 0 { 1 } else { page };
        let per_page = if per_page <= 0 || per_page > MAX_PER_PAGE as i32 {
            DEFAULT_SEARCH_PER_PAGE as i32
        } else {
            per_page
        };
        Self {
            query: query.into(),
            page,
            per_page,
        }
    }

    /// Lenient variant for raw query-string values; unparsable numbers are
    /// treated like missing ones.
    pub fn from_params(
        query: impl Into<String>,
        page: Option<&str>,
        per_page: Option<&str>,
    ) -> Self {
        Self::new(query, parse_or_zero(page), parse_or_zero(per_page))
    }

    /// Encode to the wire format.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from the wire format.
    pub fn from_json(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

/// Pagination handed to sources and stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based page.
    pub page: u32,
    /// Items per page.
    pub per_page: u32,
}

impl PageRequest {
    /// Engine-side normalization: non-positive values fall back to page 1
    /// and `DEFAULT_SEARCH_PER_PAGE`. No upper bound is applied here.
    pub fn for_search(page: i32, per_page: i32) -> Self {
        Self {
            page: u32::try_from(page).ok().filter(|p| *p > 0).unwrap_or(1),
            per_page: u32::try_from(per_page)
                .ok()
                .filter(|p| *p > 0)
                .unwrap_or(DEFAULT_SEARCH_PER_PAGE),
        }
    }

    /// Boundary clamp for listings: per_page outside `(0, 100]` becomes
    /// `default_per_page`.
    pub fn clamped(page: i64, per_page: i64, default_per_page: u32) -> Self {
        let page = u32::try_from(page).ok().filter(|p| *p > 0).unwrap_or(1);
        let per_page = u32::try_from(per_page)
            .ok()
            .filter(|p| *p > 0 && *p <= MAX_PER_PAGE)
            .unwrap_or(default_per_page);
        Self { page, per_page }
    }

    /// Same as [`PageRequest::clamped`] for raw query-string values.
    pub fn from_params(
        page: Option<&str>,
        per_page: Option<&str>,
        default_per_page: u32,
    ) -> Self {
        Self::clamped(
            i64::from(parse_or_zero(page)),
            i64::from(parse_or_zero(per_page)),
            default_per_page,
        )
    }

    /// Rows to skip for this page.
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.per_page)
    }

    /// Rows to return.
    pub fn limit(&self) -> i64 {
        i64::from(self.per_page)
    }
}

fn parse_or_zero(raw: Option<&str>) -> i32 {
    raw.and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_clamps_out_of_range_values() {
        assert_eq!(SearchTask::new("cats", 0, 0), SearchTask::new("cats", 1, 3));
        assert_eq!(SearchTask::new("cats", -4, 101).per_page, 3);
        assert_eq!(SearchTask::new("cats", 2, 100).per_page, 100);
        assert_eq!(SearchTask::new("cats", 7, 25).page, 7);
    }

    #[test]
    fn raw_params_fall_back_on_garbage() {
        let task = SearchTask::from_params("dogs", Some("two"), Some("1e3"));
        assert_eq!(task, SearchTask::new("dogs", 1, 3));

        let task = SearchTask::from_params("dogs", Some(" 4 "), None);
        assert_eq!((task.page, task.per_page), (4, 3));
    }

    #[test]
    fn wire_format_uses_snake_case_fields() {
        let task = SearchTask::new("mountain lake", 2, 10);
        let json: serde_json::Value =
            serde_json::from_slice(&task.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"query": "mountain lake", "page": 2, "per_page": 10})
        );
    }

    #[test]
    fn engine_normalization_has_no_upper_bound() {
        assert_eq!(
            PageRequest::for_search(0, 0),
            PageRequest { page: 1, per_page: 3 }
        );
        assert_eq!(PageRequest::for_search(3, 500).per_page, 500);
    }

    #[test]
    fn listing_clamp_and_offset() {
        let page = PageRequest::clamped(3, 0, DEFAULT_LIST_PER_PAGE);
        assert_eq!(page, PageRequest { page: 3, per_page: 10 });
        assert_eq!(page.offset(), 20);
        assert_eq!(PageRequest::clamped(1, 250, 10).per_page, 10);
    }
}
