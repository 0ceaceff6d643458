use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_INTERVALS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_REASON_LEN: usize = 512;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;

/// Widest date range a single gap query may ask the feed for.
pub const MAX_FEED_DAYS: i64 = 731;

pub const MAX_HOURLY_RATE: i64 = 1_000_000;
