use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::gaps::{find_gaps, parse_days, AvailabilityGap};
use crate::limits::MAX_FEED_DAYS;
use crate::timestamp::parse_date;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("end date {end} is before start date {start}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("date range of {days} days exceeds the limit of {} days", MAX_FEED_DAYS)]
    RangeTooWide { days: i64 },
    #[error("feed unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("feed is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feed document must be an array or an object with a `days` array")]
    Shape,
}

/// Day-by-day availability from an outside system. Entries are raw and may
/// be malformed; callers run them through [`parse_days`].
#[async_trait]
pub trait AvailabilityFeed: Send + Sync {
    /// Entries for `start..=end`.
    async fn fetch_daily_availability(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Value>, FeedError>;
}

/// Feed backed by a JSON document held in memory.
#[derive(Debug, Default)]
pub struct JsonFeed {
    entries: Vec<Value>,
}

impl JsonFeed {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Accepts `[...]` or `{"days": [...]}`.
    pub fn from_value(doc: Value) -> Result<Self, FeedError> {
        let entries = match doc {
            Value::Array(entries) => entries,
            Value::Object(mut map) => match map.remove("days") {
                Some(Value::Array(entries)) => entries,
                _ => return Err(FeedError::Shape),
            },
            _ => return Err(FeedError::Shape),
        };
        Ok(Self { entries })
    }

    pub async fn from_path(path: &Path) -> Result<Self, FeedError> {
        let raw = tokio::fs::read(path).await?;
        let feed = Self::from_value(serde_json::from_slice(&raw)?)?;
        debug!(path = %path.display(), entries = feed.entries.len(), "loaded availability feed");
        Ok(feed)
    }
}

#[async_trait]
impl AvailabilityFeed for JsonFeed {
    async fn fetch_daily_availability(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Value>, FeedError> {
        let in_range = |entry: &&Value| {
            match entry.get("date").and_then(Value::as_str).and_then(parse_date) {
                Some(date) => start <= date && date <= end,
                // Left for the parser to reject.
                None => true,
            }
        };
        Ok(self.entries.iter().filter(in_range).cloned().collect())
    }
}

/// Fetch `start..=end` from the feed and reduce it to gaps of at least
/// `min_nights`.
pub async fn gaps_from_feed(
    feed: &dyn AvailabilityFeed,
    start: NaiveDate,
    end: NaiveDate,
    min_nights: u32,
) -> Result<Vec<AvailabilityGap>, FeedError> {
    if end < start {
        return Err(FeedError::InvalidRange { start, end });
    }
    let days = (end - start).num_days() + 1;
    if days > MAX_FEED_DAYS {
        return Err(FeedError::RangeTooWide { days });
    }
    let raw = feed.fetch_daily_availability(start, end).await?;
    Ok(find_gaps(&parse_days(&raw), min_nights))
}
