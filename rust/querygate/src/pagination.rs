//! Page/page-size handling for the paginated execute endpoint.

use crate::error::{Result, ServiceError};
use serde::Deserialize;

const DEFAULT_PAGE: i64 = 1;
const DEFAULT_PAGE_SIZE: i64 = 20;

/// Raw `?page=&pageSize=` query string values.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    DEFAULT_PAGE
}

fn default_page_size() -> i64 {
    DEFAULT_PAGE_SIZE
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Validated page window. The size never exceeds the configured row cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u64,
    size: u64,
}

impl PageRequest {
    pub fn new(params: PageParams, max_rows: usize) -> Result<Self> {
        if params.page < 1 {
            return Err(ServiceError::InvalidRequest(
                "page must be greater than or equal to 1".into(),
            ));
        }
        if params.page_size < 1 {
            return Err(ServiceError::InvalidRequest(
                "pageSize must be greater than or equal to 1".into(),
            ));
        }

        let cap = u64::try_from(max_rows).unwrap_or(u64::MAX).max(1);
        Ok(Self {
            page: params.page as u64,
            size: (params.page_size as u64).min(cap),
        })
    }

    pub fn page(&self) -> u64 {
        self.page
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.size)
    }

    pub fn total_pages(&self, total_count: u64) -> u64 {
        total_count.div_ceil(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(page: i64, page_size: i64) -> PageParams {
        PageParams { page, page_size }
    }

    #[test]
    fn offset_follows_page_and_size() {
        let request = PageRequest::new(params(3, 10), 1000).unwrap();
        assert_eq!(request.offset(), 20);
        assert_eq!(request.size(), 10);
    }

    #[test]
    fn size_is_clamped_to_row_cap() {
        let request = PageRequest::new(params(1, 5000), 1000).unwrap();
        assert_eq!(request.size(), 1000);
    }

    #[test]
    fn non_positive_values_are_rejected() {
        assert!(matches!(
            PageRequest::new(params(0, 10), 1000),
            Err(ServiceError::InvalidRequest(_))
        ));
        assert!(matches!(
            PageRequest::new(params(1, -1), 1000),
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn total_pages_rounds_up() {
        let request = PageRequest::new(params(1, 10), 1000).unwrap();
        assert_eq!(request.total_pages(25), 3);
        assert_eq!(request.total_pages(20), 2);
        assert_eq!(request.total_pages(0), 0);
    }

    #[test]
    fn query_string_defaults() {
        let parsed: PageParams = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.page, 1);
        assert_eq!(parsed.page_size, 20);
    }
}
