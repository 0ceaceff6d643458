use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// The one overlap predicate for half-open intervals `[a_start, a_end)` and
/// `[b_start, b_end)`. Touching intervals do not overlap.
pub const fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Available,
    Unavailable,
    Maintenance,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceStatus::Available => "AVAILABLE",
            ResourceStatus::Unavailable => "UNAVAILABLE",
            ResourceStatus::Maintenance => "MAINTENANCE",
        })
    }
}

impl FromStr for ResourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AVAILABLE" => Ok(ResourceStatus::Available),
            "UNAVAILABLE" => Ok(ResourceStatus::Unavailable),
            "MAINTENANCE" => Ok(ResourceStatus::Maintenance),
            other => Err(format!("unknown resource status: {other}")),
        }
    }
}

/// Booking lifecycle. The only transition driven here is
/// `{Pending, Confirmed} -> Cancelled`; `Completed` is set by nothing in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Whether the booking still occupies its slot.
    pub const fn is_active(self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub const fn can_cancel(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
        })
    }
}

/// Who is acting on a booking. Identity itself is established elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(id: Ulid) -> Self {
        Self { id, is_admin: false }
    }

    pub fn admin(id: Ulid) -> Self {
        Self { id, is_admin: true }
    }
}

/// What an interval on a resource represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalKind {
    Booking {
        requester_id: Ulid,
        total_price: Decimal,
        status: BookingStatus,
        notes: Option<String>,
        created_at: Ms,
        updated_at: Ms,
    },
    /// Administrator-imposed unavailability.
    Block {
        reason: Option<String>,
        created_by: Ulid,
        created_at: Ms,
    },
}

/// A single interval on a resource. Bookings and blocks share one timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    /// A block, or a booking that is not cancelled.
    pub fn occupies(&self) -> bool {
        match &self.kind {
            IntervalKind::Booking { status, .. } => status.is_active(),
            IntervalKind::Block { .. } => true,
        }
    }

    pub fn as_booking(&self, resource_id: Ulid) -> Option<BookingInfo> {
        match &self.kind {
            IntervalKind::Booking {
                requester_id,
                total_price,
                status,
                notes,
                created_at,
                updated_at,
            } => Some(BookingInfo {
                id: self.id,
                resource_id,
                requester_id: *requester_id,
                start: self.span.start,
                end: self.span.end,
                total_price: *total_price,
                status: *status,
                notes: notes.clone(),
                created_at: *created_at,
                updated_at: *updated_at,
            }),
            IntervalKind::Block { .. } => None,
        }
    }

    pub fn as_block(&self, resource_id: Ulid) -> Option<BlockInfo> {
        match &self.kind {
            IntervalKind::Block {
                reason,
                created_by,
                created_at,
            } => Some(BlockInfo {
                id: self.id,
                resource_id,
                start: self.span.start,
                end: self.span.end,
                reason: reason.clone(),
                created_by: *created_by,
                created_at: *created_at,
            }),
            IntervalKind::Booking { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub hourly_rate: Decimal,
    pub status: ResourceStatus,
    /// Bookings (any status) and blocks, sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, capacity: u32, hourly_rate: Decimal, status: ResourceStatus) -> Self {
        Self {
            id,
            name,
            capacity,
            hourly_rate,
            status,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn interval(&self, id: Ulid) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    pub fn interval_mut(&mut self, id: Ulid) -> Option<&mut Interval> {
        self.intervals.iter_mut().find(|i| i.id == id)
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        // Everything at index >= right_bound starts at or after query.end and can't overlap.
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.overlaps(query))
    }

    pub fn has_active_bookings(&self) -> bool {
        self.intervals.iter().any(|i| {
            matches!(i.kind, IntervalKind::Booking { status, .. } if status.is_active())
        })
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
            hourly_rate: self.hourly_rate,
            status: self.status,
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: String,
        capacity: u32,
        #[serde(with = "rust_decimal::serde::str")]
        hourly_rate: Decimal,
        status: ResourceStatus,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        capacity: u32,
        #[serde(with = "rust_decimal::serde::str")]
        hourly_rate: Decimal,
        status: ResourceStatus,
    },
    ResourceDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        resource_id: Ulid,
        requester_id: Ulid,
        span: Span,
        #[serde(with = "rust_decimal::serde::str")]
        total_price: Decimal,
        notes: Option<String>,
        created_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        resource_id: Ulid,
        cancelled_at: Ms,
    },
    BlockCreated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: Option<String>,
        created_by: Ulid,
        created_at: Ms,
    },
    BlockDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub hourly_rate: Decimal,
    pub status: ResourceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub total_price: Decimal,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub reason: Option<String>,
    pub created_by: Ulid,
    pub created_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: IntervalKind::Booking {
                requester_id: Ulid::new(),
                total_price: Decimal::ZERO,
                status,
                notes: None,
                created_at: 0,
                updated_at: 0,
            },
        }
    }

    fn block(start: Ms, end: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: IntervalKind::Block {
                reason: None,
                created_by: Ulid::new(),
                created_at: 0,
            },
        }
    }

    fn empty_resource() -> ResourceState {
        ResourceState::new(Ulid::new(), "Room".into(), 4, Decimal::ZERO, ResourceStatus::Available)
    }

    #[test]
    fn touching_is_not_overlapping() {
        assert!(!overlaps(0, 10, 10, 20));
        assert!(!overlaps(10, 20, 0, 10));
        assert!(overlaps(0, 10, 9, 20));
    }

    #[test]
    fn overlap_is_symmetric() {
        for a in 0..6 {
            for b in (a + 1)..7 {
                for c in 0..6 {
                    for d in (c + 1)..7 {
                        assert_eq!(
                            overlaps(a, b, c, d),
                            overlaps(c, d, a, b),
                            "[{a},{b}) vs [{c},{d})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn containment_overlaps() {
        assert!(overlaps(0, 100, 10, 20));
        assert!(overlaps(10, 20, 0, 100));
        assert!(overlaps(5, 6, 5, 6));
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.overlaps(&Span::new(199, 300)));
        assert!(!s.overlaps(&Span::new(200, 300))); // half-open
    }

    #[test]
    fn checked_span_rejects_empty_and_inverted() {
        assert!(Span::checked(5, 5).is_none());
        assert!(Span::checked(6, 5).is_none());
        assert_eq!(Span::checked(5, 6), Some(Span::new(5, 6)));
    }

    #[test]
    fn interval_ordering() {
        let mut rs = empty_resource();
        rs.insert_interval(booking(300, 400, BookingStatus::Confirmed));
        rs.insert_interval(block(100, 200));
        rs.insert_interval(booking(200, 300, BookingStatus::Confirmed));
        assert_eq!(rs.intervals[0].span.start, 100);
        assert_eq!(rs.intervals[1].span.start, 200);
        assert_eq!(rs.intervals[2].span.start, 300);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = empty_resource();
        rs.insert_interval(block(100, 200));
        assert!(rs.remove_interval(Ulid::new()).is_none());
        assert_eq!(rs.intervals.len(), 1);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = empty_resource();
        rs.insert_interval(booking(100, 200, BookingStatus::Confirmed));
        rs.insert_interval(block(450, 600));
        rs.insert_interval(booking(1000, 1100, BookingStatus::Confirmed));

        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = empty_resource();
        rs.insert_interval(booking(100, 200, BookingStatus::Confirmed));
        rs.insert_interval(booking(300, 400, BookingStatus::Confirmed));
        let hits: Vec<_> = rs.overlapping(&Span::new(200, 300)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn overlapping_large_interval_spanning_query() {
        let mut rs = empty_resource();
        rs.insert_interval(block(0, 10_000));
        let hits: Vec<_> = rs.overlapping(&Span::new(500, 600)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn cancelled_booking_does_not_occupy() {
        assert!(!booking(0, 10, BookingStatus::Cancelled).occupies());
        assert!(booking(0, 10, BookingStatus::Pending).occupies());
        assert!(booking(0, 10, BookingStatus::Completed).occupies());
        assert!(block(0, 10).occupies());
    }

    #[test]
    fn active_bookings_ignore_blocks_and_cancelled() {
        let mut rs = empty_resource();
        rs.insert_interval(block(0, 10));
        rs.insert_interval(booking(10, 20, BookingStatus::Cancelled));
        assert!(!rs.has_active_bookings());
        rs.insert_interval(booking(20, 30, BookingStatus::Confirmed));
        assert!(rs.has_active_bookings());
    }

    #[test]
    fn cancellable_states() {
        assert!(BookingStatus::Pending.can_cancel());
        assert!(BookingStatus::Confirmed.can_cancel());
        assert!(!BookingStatus::Cancelled.can_cancel());
        assert!(!BookingStatus::Completed.can_cancel());
    }

    #[test]
    fn resource_status_parses_case_insensitively() {
        assert_eq!("maintenance".parse(), Ok(ResourceStatus::Maintenance));
        assert_eq!(" Available ".parse(), Ok(ResourceStatus::Available));
        assert!("broken".parse::<ResourceStatus>().is_err());
        assert_eq!(ResourceStatus::Unavailable.to_string(), "UNAVAILABLE");
    }

    #[test]
    fn interval_views() {
        let rid = Ulid::new();
        let b = booking(0, 100, BookingStatus::Confirmed);
        assert!(b.as_block(rid).is_none());
        let info = b.as_booking(rid).unwrap();
        assert_eq!(info.resource_id, rid);
        assert_eq!((info.start, info.end), (0, 100));

        let blk = block(5, 6);
        assert!(blk.as_booking(rid).is_none());
        assert_eq!(blk.as_block(rid).unwrap().id, blk.id);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            requester_id: Ulid::new(),
            span: Span::new(0, 3_600_000),
            total_price: Decimal::new(12550, 2),
            notes: Some("projector".into()),
            created_at: 42,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
