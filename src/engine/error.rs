use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms, ResourceStatus};

/// Why a slot could not be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotConflictReason {
    /// An administrative block covers part of the slot.
    Blocked { block_id: Ulid },
    /// A live booking already holds part of the slot.
    Taken { booking_id: Ulid },
    /// The slot was free at the pre-check but another booking committed first.
    RaceLost { booking_id: Ulid },
}

impl SlotConflictReason {
    pub fn label(&self) -> &'static str {
        match self {
            SlotConflictReason::Blocked { .. } => "blocked",
            SlotConflictReason::Taken { .. } => "taken",
            SlotConflictReason::RaceLost { .. } => "race_lost",
        }
    }
}

impl std::fmt::Display for SlotConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotConflictReason::Blocked { block_id } => {
                write!(f, "slot is blocked by an administrator (block {block_id})")
            }
            SlotConflictReason::Taken { booking_id } => {
                write!(f, "slot is already booked (booking {booking_id})")
            }
            SlotConflictReason::RaceLost { booking_id } => {
                write!(f, "slot was just taken (booking {booking_id})")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("end ({end}) must be after start ({start})")]
    InvalidInterval { start: Ms, end: Ms },
    #[error("booking starts in the past ({start} < now {now})")]
    PastBooking { start: Ms, now: Ms },
    #[error("resource not found: {0}")]
    ResourceNotFound(Ulid),
    #[error("resource {id} is not bookable (status {status})")]
    ResourceUnavailable { id: Ulid, status: ResourceStatus },
    #[error("{0}")]
    SlotConflict(SlotConflictReason),
    #[error("block overlaps booking {0}")]
    ConflictWithBooking(Ulid),
    #[error("block overlaps block {0}")]
    ConflictWithBlock(Ulid),
    #[error("booking {0} is already cancelled")]
    AlreadyCancelled(Ulid),
    #[error("booking {id} cannot be cancelled from status {from}")]
    InvalidTransition { id: Ulid, from: BookingStatus },
    #[error("actor {actor} may not modify booking {booking}")]
    NotAuthorized { actor: Ulid, booking: Ulid },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("resource {0} still has active bookings")]
    ResourceInUse(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// The detail is for logs only; callers see a generic message.
    #[error("storage unavailable")]
    Storage(String),
}

impl EngineError {
    /// Stable machine-readable kind.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "INVALID_INTERVAL",
            EngineError::PastBooking { .. } => "PAST_BOOKING",
            EngineError::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            EngineError::ResourceUnavailable { .. } => "RESOURCE_UNAVAILABLE",
            EngineError::SlotConflict(_) => "SLOT_CONFLICT",
            EngineError::ConflictWithBooking(_) => "CONFLICT_WITH_BOOKING",
            EngineError::ConflictWithBlock(_) => "CONFLICT_WITH_BLOCK",
            EngineError::AlreadyCancelled(_) => "ALREADY_CANCELLED",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::NotAuthorized { .. } => "NOT_AUTHORIZED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
            EngineError::ResourceInUse(_) => "RESOURCE_IN_USE",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::Storage(_) => "STORAGE",
        }
    }

    pub fn conflict_reason(&self) -> Option<SlotConflictReason> {
        match self {
            EngineError::SlotConflict(reason) => Some(*reason),
            _ => None,
        }
    }
}
