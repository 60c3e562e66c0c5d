//! Pagination over duplicate groups
//!
//! Offset pagination is for read-only browsing only. Bulk loops re-query
//! page one on every iteration (see `crate::bulk`).

/// Default number of groups per page
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Pagination metadata calculated from total results
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Pagination {
    /// Current page number (1-indexed)
    pub page: usize,
    pub page_size: usize,
    /// Total number of pages
    pub total_pages: usize,
    /// Index of the first row on this page
    pub offset: usize,
}

/// Calculate pagination metadata from total results and requested page
///
/// Ensures page is within valid bounds [1, total_pages]. A zero page size
/// falls back to [`DEFAULT_PAGE_SIZE`].
///
/// # Examples
/// ```
/// use qbank_consolidate::detector::pagination::calculate_pagination;
///
/// // 250 groups = 3 pages (100 + 100 + 50)
/// let p = calculate_pagination(250, 2, 100);
/// assert_eq!(p.page, 2);
/// assert_eq!(p.total_pages, 3);
/// assert_eq!(p.offset, 100);
///
/// // Requesting out-of-bounds page gets clamped
/// let p = calculate_pagination(250, 99, 100);
/// assert_eq!(p.page, 3);
/// assert_eq!(p.offset, 200);
/// ```
pub fn calculate_pagination(total_results: usize, requested_page: usize, page_size: usize) -> Pagination {
    let page_size = if page_size == 0 { DEFAULT_PAGE_SIZE } else { page_size };
    let total_pages = total_results.div_ceil(page_size);
    let page = requested_page.max(1).min(total_pages.max(1));
    let offset = (page - 1) * page_size;

    Pagination {
        page,
        page_size,
        total_pages,
        offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_normal() {
        let p = calculate_pagination(250, 2, 100);
        assert_eq!(p.page, 2);
        assert_eq!(p.total_pages, 3);
        assert_eq!(p.offset, 100);
    }

    #[test]
    fn test_pagination_out_of_bounds_high() {
        let p = calculate_pagination(150, 99, 100);
        assert_eq!(p.page, 2); // Clamped to last page
        assert_eq!(p.offset, 100);
    }

    #[test]
    fn test_pagination_out_of_bounds_low() {
        let p = calculate_pagination(150, 0, 100);
        assert_eq!(p.page, 1);
        assert_eq!(p.offset, 0);
    }

    #[test]
    fn test_pagination_empty() {
        let p = calculate_pagination(0, 1, 100);
        assert_eq!(p.page, 1);
        assert_eq!(p.total_pages, 0);
        assert_eq!(p.offset, 0);
    }

    #[test]
    fn test_zero_page_size_uses_default() {
        let p = calculate_pagination(250, 1, 0);
        assert_eq!(p.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(p.total_pages, 3);
    }
}
