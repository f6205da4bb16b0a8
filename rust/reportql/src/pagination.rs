//! Page/offset arithmetic for row queries.

use crate::error::{Result, ServiceError};
use serde::Serialize;

/// Offset of the first row on `page` (1-based).
pub fn page_offset(page: u64, page_size: u64) -> Result<u64> {
    if page < 1 {
        return Err(ServiceError::InvalidRequest(
            "page must be greater than or equal to 1".into(),
        ));
    }
    Ok((page - 1).saturating_mul(page_size))
}

pub fn page_count(total: u64, page_size: u64) -> u64 {
    if page_size == 0 {
        0
    } else {
        total.div_ceil(page_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub pages: u64,
}

impl PageMeta {
    pub fn new(total: u64, page: u64, page_size: u64) -> Self {
        Self {
            total,
            page,
            page_size,
            pages: page_count(total, page_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_page_numbers() {
        assert_eq!(page_offset(1, 50).unwrap(), 0);
        assert_eq!(page_offset(3, 25).unwrap(), 50);
        assert!(page_offset(0, 50).is_err());
    }

    #[test]
    fn page_count_rounds_up() {
        assert_eq!(page_count(0, 50), 0);
        assert_eq!(page_count(50, 50), 1);
        assert_eq!(page_count(51, 50), 2);
    }
}
