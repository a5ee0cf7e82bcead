//! Hard bounds on client input.

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 1024;
pub const MAX_DATE_TEXT_LEN: usize = 64;

/// Children submitted in one reconciliation list.
pub const MAX_CHILDREN_PER_LIST: usize = 1000;

pub const MAX_PAGE_LIMIT: u32 = 10_000_000;
pub const DEFAULT_EVENT_PAGE_LIMIT: u32 = 10;
pub const DEFAULT_PLACE_PAGE_LIMIT: u32 = 10_000_000;

pub const MAX_SEARCH_LEN: usize = 256;

/// 1970-01-01 .. 9999-12-31, in ms.
pub const MIN_VALID_TIMESTAMP_MS: i64 = 0;
pub const MAX_VALID_TIMESTAMP_MS: i64 = 253_402_300_799_999;
