use ulid::Ulid;

use crate::model::*;

use super::{EngineError, SlotConflictReason};

/// `[start, end)` as a span, or `InvalidInterval`.
pub(crate) fn validate_interval(start: Ms, end: Ms) -> Result<Span, EngineError> {
    Span::checked(start, end).ok_or(EngineError::InvalidInterval { start, end })
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// First block on the resource overlapping `span`.
fn find_block(rs: &ResourceState, span: &Span) -> Option<Ulid> {
    rs.overlapping(span)
        .find(|i| matches!(i.kind, IntervalKind::Block { .. }))
        .map(|i| i.id)
}

/// First non-cancelled booking overlapping `span`, other than `exclude`.
fn find_booking(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.overlapping(span)
        .filter(|i| Some(i.id) != exclude)
        .find(|i| matches!(i.kind, IntervalKind::Booking { status, .. } if status.is_active()))
        .map(|i| i.id)
}

/// Is `span` bookable on this resource? Blocks are reported before bookings.
pub(crate) fn check_slot(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
    if rs.status != ResourceStatus::Available {
        return Err(EngineError::ResourceUnavailable {
            id: rs.id,
            status: rs.status,
        });
    }
    if let Some(block_id) = find_block(rs, span) {
        return Err(EngineError::SlotConflict(SlotConflictReason::Blocked { block_id }));
    }
    if let Some(booking_id) = find_booking(rs, span, exclude) {
        return Err(EngineError::SlotConflict(SlotConflictReason::Taken { booking_id }));
    }
    Ok(())
}

/// May an administrator block `span`? Existing bookings win over new blocks.
pub(crate) fn check_block_slot(rs: &ResourceState, span: &Span) -> Result<(), EngineError> {
    if let Some(booking_id) = find_booking(rs, span, None) {
        return Err(EngineError::ConflictWithBooking(booking_id));
    }
    if let Some(block_id) = find_block(rs, span) {
        return Err(EngineError::ConflictWithBlock(block_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    fn resource(status: ResourceStatus) -> ResourceState {
        ResourceState::new(Ulid::new(), "Studio".into(), 2, Decimal::ONE, status)
    }

    fn add_booking(rs: &mut ResourceState, start: Ms, end: Ms, status: BookingStatus) -> Ulid {
        let id = Ulid::new();
        rs.insert_interval(Interval {
            id,
            span: Span::new(start, end),
            kind: IntervalKind::Booking {
                requester_id: Ulid::new(),
                total_price: Decimal::ZERO,
                status,
                notes: None,
                created_at: 0,
                updated_at: 0,
            },
        });
        id
    }

    fn add_block(rs: &mut ResourceState, start: Ms, end: Ms) -> Ulid {
        let id = Ulid::new();
        rs.insert_interval(Interval {
            id,
            span: Span::new(start, end),
            kind: IntervalKind::Block {
                reason: Some("maintenance".into()),
                created_by: Ulid::new(),
                created_at: 0,
            },
        });
        id
    }

    #[test]
    fn free_resource_accepts_any_slot() {
        let rs = resource(ResourceStatus::Available);
        assert!(check_slot(&rs, &Span::new(0, 100), None).is_ok());
    }

    #[test]
    fn unavailable_resource_rejected_before_scanning() {
        for status in [ResourceStatus::Unavailable, ResourceStatus::Maintenance] {
            let rs = resource(status);
            assert!(matches!(
                check_slot(&rs, &Span::new(0, 100), None),
                Err(EngineError::ResourceUnavailable { .. })
            ));
        }
    }

    #[test]
    fn overlapping_booking_is_taken() {
        let mut rs = resource(ResourceStatus::Available);
        let id = add_booking(&mut rs, 100, 200, BookingStatus::Confirmed);
        let err = check_slot(&rs, &Span::new(150, 250), None).unwrap_err();
        assert_eq!(err.conflict_reason(), Some(SlotConflictReason::Taken { booking_id: id }));
    }

    #[test]
    fn adjacent_booking_is_free() {
        let mut rs = resource(ResourceStatus::Available);
        add_booking(&mut rs, 100, 200, BookingStatus::Confirmed);
        assert!(check_slot(&rs, &Span::new(200, 300), None).is_ok());
        assert!(check_slot(&rs, &Span::new(0, 100), None).is_ok());
    }

    #[test]
    fn cancelled_booking_frees_slot() {
        let mut rs = resource(ResourceStatus::Available);
        add_booking(&mut rs, 100, 200, BookingStatus::Cancelled);
        assert!(check_slot(&rs, &Span::new(100, 200), None).is_ok());
    }

    #[test]
    fn pending_booking_still_occupies() {
        let mut rs = resource(ResourceStatus::Available);
        add_booking(&mut rs, 100, 200, BookingStatus::Pending);
        assert!(check_slot(&rs, &Span::new(120, 130), None).is_err());
    }

    #[test]
    fn excluded_booking_is_ignored() {
        let mut rs = resource(ResourceStatus::Available);
        let id = add_booking(&mut rs, 100, 200, BookingStatus::Confirmed);
        assert!(check_slot(&rs, &Span::new(100, 200), Some(id)).is_ok());
    }

    #[test]
    fn block_reported_before_booking() {
        let mut rs = resource(ResourceStatus::Available);
        add_booking(&mut rs, 100, 200, BookingStatus::Confirmed);
        let block_id = add_block(&mut rs, 150, 300);
        let err = check_slot(&rs, &Span::new(0, 1000), None).unwrap_err();
        assert_eq!(err.conflict_reason(), Some(SlotConflictReason::Blocked { block_id }));
    }

    #[test]
    fn block_against_booking_conflicts() {
        let mut rs = resource(ResourceStatus::Available);
        let id = add_booking(&mut rs, 100, 200, BookingStatus::Confirmed);
        assert!(matches!(
            check_block_slot(&rs, &Span::new(150, 250)),
            Err(EngineError::ConflictWithBooking(b)) if b == id
        ));
    }

    #[test]
    fn block_against_block_conflicts() {
        let mut rs = resource(ResourceStatus::Available);
        let id = add_block(&mut rs, 100, 200);
        assert!(matches!(
            check_block_slot(&rs, &Span::new(50, 101)),
            Err(EngineError::ConflictWithBlock(b)) if b == id
        ));
        assert!(check_block_slot(&rs, &Span::new(200, 201)).is_ok());
    }

    #[test]
    fn block_ignores_cancelled_bookings_and_resource_status() {
        let mut rs = resource(ResourceStatus::Maintenance);
        add_booking(&mut rs, 100, 200, BookingStatus::Cancelled);
        assert!(check_block_slot(&rs, &Span::new(100, 200)).is_ok());
    }

    #[test]
    fn interval_validation() {
        assert!(matches!(validate_interval(5, 5), Err(EngineError::InvalidInterval { .. })));
        assert!(validate_interval(5, 6).is_ok());
        assert!(matches!(
            validate_span(&Span::new(0, 10)),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        ));
    }
}
