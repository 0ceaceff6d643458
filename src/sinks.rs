//! Best-effort side effects of booking and block changes.
//!
//! Notifications, confirmation messages and audit records are delivered by
//! [`EventSink`]s. [`SideEffects::fire`] gives each sink one attempt on its own
//! task; whatever a sink does (fail, stall, panic) never reaches the operation
//! that triggered it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{BlockInfo, BookingInfo};
use crate::timestamp::format_instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    BookingCreated { booking: BookingInfo },
    BookingCancelled { booking: BookingInfo, actor_id: Ulid },
    BlockCreated { block: BlockInfo },
    BlockDeleted { block: BlockInfo, actor_id: Ulid },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::BookingCreated { .. } => "booking_created",
            DomainEvent::BookingCancelled { .. } => "booking_cancelled",
            DomainEvent::BlockCreated { .. } => "block_created",
            DomainEvent::BlockDeleted { .. } => "block_deleted",
        }
    }

    pub fn resource_id(&self) -> Ulid {
        match self {
            DomainEvent::BookingCreated { booking } | DomainEvent::BookingCancelled { booking, .. } => {
                booking.resource_id
            }
            DomainEvent::BlockCreated { block } | DomainEvent::BlockDeleted { block, .. } => block.resource_id,
        }
    }

    /// Id of the booking or block the event is about.
    pub fn subject_id(&self) -> Ulid {
        match self {
            DomainEvent::BookingCreated { booking } | DomainEvent::BookingCancelled { booking, .. } => booking.id,
            DomainEvent::BlockCreated { block } | DomainEvent::BlockDeleted { block, .. } => block.id,
        }
    }

    pub fn actor_id(&self) -> Ulid {
        match self {
            DomainEvent::BookingCreated { booking } => booking.requester_id,
            DomainEvent::BlockCreated { block } => block.created_by,
            DomainEvent::BookingCancelled { actor_id, .. } | DomainEvent::BlockDeleted { actor_id, .. } => *actor_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn record(&self, event: &DomainEvent) -> Result<(), SinkError>;
}

/// The configured sinks, shared by every engine operation.
#[derive(Clone, Default)]
pub struct SideEffects {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SideEffects {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// One attempt per sink, each on its own task. Returns immediately.
    pub fn fire(&self, event: DomainEvent) {
        for sink in &self.sinks {
            let sink = sink.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let failure = match AssertUnwindSafe(sink.record(&event)).catch_unwind().await {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "sink panicked".to_string(),
                };
                warn!(
                    sink = sink.name(),
                    kind = event.kind(),
                    subject = %event.subject_id(),
                    "side effect failed: {failure}"
                );
                metrics::counter!(crate::observability::SIDE_EFFECT_FAILURES_TOTAL, "sink" => sink.name()).increment(1);
            });
        }
    }
}

/// Audit trail written as structured log records on target `bookd::audit`.
pub struct AuditLog;

#[async_trait]
impl EventSink for AuditLog {
    fn name(&self) -> &'static str {
        "audit_log"
    }

    async fn record(&self, event: &DomainEvent) -> Result<(), SinkError> {
        match event {
            DomainEvent::BookingCreated { booking } => info!(
                target: "bookd::audit",
                kind = event.kind(),
                booking = %booking.id,
                resource = %booking.resource_id,
                actor = %booking.requester_id,
                start = %format_instant(booking.start),
                end = %format_instant(booking.end),
                total_price = %booking.total_price,
            ),
            DomainEvent::BookingCancelled { booking, actor_id } => info!(
                target: "bookd::audit",
                kind = event.kind(),
                booking = %booking.id,
                resource = %booking.resource_id,
                actor = %actor_id,
            ),
            DomainEvent::BlockCreated { block } => info!(
                target: "bookd::audit",
                kind = event.kind(),
                block = %block.id,
                resource = %block.resource_id,
                actor = %block.created_by,
                start = %format_instant(block.start),
                end = %format_instant(block.end),
                reason = block.reason.as_deref().unwrap_or(""),
            ),
            DomainEvent::BlockDeleted { block, actor_id } => info!(
                target: "bookd::audit",
                kind = event.kind(),
                block = %block.id,
                resource = %block.resource_id,
                actor = %actor_id,
            ),
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use rust_decimal::Decimal;
    use tokio::sync::mpsc;

    use super::testing::*;
    use super::*;
    use crate::model::BookingStatus;

    fn sample_booking() -> BookingInfo {
        BookingInfo {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            requester_id: Ulid::new(),
            start: 0,
            end: 3_600_000,
            total_price: Decimal::new(5000, 2),
            status: BookingStatus::Confirmed,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn every_sink_gets_the_event() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(ChannelSink(tx_a)), Arc::new(ChannelSink(tx_b))];
        let effects = SideEffects::new(sinks);

        let event = DomainEvent::BookingCreated { booking: sample_booking() };
        effects.fire(event.clone());

        let got_a = tokio::time::timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap();
        let got_b = tokio::time::timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap();
        assert_eq!(got_a, Some(event.clone()));
        assert_eq!(got_b, Some(event));
    }

    #[tokio::test]
    async fn failing_sink_does_not_starve_others() {
        let failing = Arc::new(FailingSink::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sinks: Vec<Arc<dyn EventSink>> = vec![failing.clone(), Arc::new(PanickingSink), Arc::new(ChannelSink(tx))];
        let effects = SideEffects::new(sinks);

        effects.fire(DomainEvent::BookingCreated { booking: sample_booking() });

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(got.is_some());
        // Give the failing task a moment; it is tried exactly once.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(failing.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn audit_log_never_fails() {
        let booking = sample_booking();
        let actor = Ulid::new();
        let event = DomainEvent::BookingCancelled { booking: booking.clone(), actor_id: actor };
        assert!(AuditLog.record(&event).await.is_ok());
        assert_eq!(event.actor_id(), actor);
        assert_eq!(event.resource_id(), booking.resource_id);
        assert_eq!(event.subject_id(), booking.id);
    }

    #[test]
    fn no_sinks_by_default() {
        assert!(SideEffects::none().is_empty());
        assert_eq!(SideEffects::none().len(), 0);
    }
}
