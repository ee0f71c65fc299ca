//! Shared model types.

use serde::{Deserialize, Serialize};

/// One page of a filtered listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i32,
    pub page_size: i32,
}

impl<T> PagedResult<T> {
    pub fn new(items: Vec<T>, total: i64, page: i32, page_size: i32) -> Self {
        Self {
            items,
            total,
            page,
            page_size,
        }
    }
}
