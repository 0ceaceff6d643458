use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    BOOKINGS_CANCELLED_TOTAL, BOOKINGS_CREATED_TOTAL, BOOKING_CONFLICTS_TOTAL, RESOURCES_ACTIVE,
    WAL_COMPACTIONS_TOTAL,
};
use crate::pricing::price;
use crate::sinks::DomainEvent;
use crate::timestamp::now_ms;

use super::conflict::{check_block_slot, check_slot, validate_interval, validate_span};
use super::{forget_intervals, storage_error, Engine, EngineError, SlotConflictReason, WalCommand};

/// A booking request. The engine assigns the id and the price.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub resource_id: Ulid,
    pub requester_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub notes: Option<String>,
}

/// An administrative block request.
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub reason: Option<String>,
}

fn validate_resource_fields(name: &str, hourly_rate: Decimal) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    if hourly_rate.is_sign_negative() {
        return Err(EngineError::LimitExceeded("hourly rate must not be negative"));
    }
    if hourly_rate > Decimal::from(MAX_HOURLY_RATE) {
        return Err(EngineError::LimitExceeded("hourly rate too high"));
    }
    Ok(())
}

fn count_conflict(err: &EngineError) {
    if let Some(reason) = err.conflict_reason() {
        metrics::counter!(BOOKING_CONFLICTS_TOTAL, "reason" => reason.label()).increment(1);
    }
}

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        hourly_rate: Decimal,
        status: ResourceStatus,
    ) -> Result<ResourceInfo, EngineError> {
        validate_resource_fields(&name, hourly_rate)?;
        let _admin = self.admin.lock().await;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceCreated {
            id,
            name: name.clone(),
            capacity,
            hourly_rate,
            status,
        };
        self.wal_append(&event).await?;
        let rs = ResourceState::new(id, name, capacity, hourly_rate, status);
        let info = rs.info();
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        metrics::gauge!(RESOURCES_ACTIVE).set(self.state.len() as f64);
        Ok(info)
    }

    pub async fn update_resource(
        &self,
        id: Ulid,
        name: String,
        capacity: u32,
        hourly_rate: Decimal,
        status: ResourceStatus,
    ) -> Result<ResourceInfo, EngineError> {
        validate_resource_fields(&name, hourly_rate)?;
        let rs = self.get_resource(&id).ok_or(EngineError::ResourceNotFound(id))?;
        let mut guard = rs.write().await;
        if !self.state.contains_key(&id) {
            return Err(EngineError::ResourceNotFound(id));
        }

        let event = Event::ResourceUpdated {
            id,
            name,
            capacity,
            hourly_rate,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Refused while any non-cancelled booking references the resource.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::ResourceNotFound(id))?;
        let guard = rs.write().await;
        if !self.state.contains_key(&id) {
            return Err(EngineError::ResourceNotFound(id));
        }
        if guard.has_active_bookings() {
            return Err(EngineError::ResourceInUse(id));
        }

        self.wal_append(&Event::ResourceDeleted { id }).await?;
        self.state.remove(&id);
        forget_intervals(&guard, &self.entity_to_resource);
        metrics::gauge!(RESOURCES_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    /// Book `[start, end)` on a resource.
    ///
    /// The guard runs twice: once under the read lock as a fast fail, then
    /// again under the write lock, which is held until the booking is durable.
    /// A booking that slips in between surfaces as [`SlotConflictReason::RaceLost`].
    pub async fn create_booking(&self, req: NewBooking) -> Result<BookingInfo, EngineError> {
        let span = validate_interval(req.start, req.end)?;
        let now = now_ms();
        if span.start < now {
            return Err(EngineError::PastBooking { start: span.start, now });
        }
        validate_span(&span)?;
        if let Some(ref n) = req.notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let rs = self
            .get_resource(&req.resource_id)
            .ok_or(EngineError::ResourceNotFound(req.resource_id))?;

        {
            let guard = rs.read().await;
            check_slot(&guard, &span, None).inspect_err(count_conflict)?;
        }

        let mut guard = rs.write().await;
        if !self.state.contains_key(&req.resource_id) {
            return Err(EngineError::ResourceNotFound(req.resource_id));
        }
        check_slot(&guard, &span, None)
            .map_err(|e| match e {
                EngineError::SlotConflict(SlotConflictReason::Taken { booking_id }) => {
                    EngineError::SlotConflict(SlotConflictReason::RaceLost { booking_id })
                }
                other => other,
            })
            .inspect_err(count_conflict)?;
        if guard.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }

        let total_price = price(span.start, span.end, guard.hourly_rate)?;
        let id = Ulid::new();
        let created_at = now_ms();
        let event = Event::BookingCreated {
            id,
            resource_id: req.resource_id,
            requester_id: req.requester_id,
            span,
            total_price,
            notes: req.notes.clone(),
            created_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        let booking = BookingInfo {
            id,
            resource_id: req.resource_id,
            requester_id: req.requester_id,
            start: span.start,
            end: span.end,
            total_price,
            status: BookingStatus::Confirmed,
            notes: req.notes,
            created_at,
            updated_at: created_at,
        };
        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        debug!(booking = %id, resource = %booking.resource_id, "booking confirmed");
        self.side_effects.fire(DomainEvent::BookingCreated {
            booking: booking.clone(),
        });
        Ok(booking)
    }

    /// `{Pending, Confirmed} -> Cancelled`, by the requester or an admin.
    /// The booking stays on the timeline with status `Cancelled`.
    pub async fn cancel_booking(&self, id: Ulid, actor: Actor) -> Result<BookingInfo, EngineError> {
        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let (requester_id, status) = match guard.interval(id).map(|i| &i.kind) {
            Some(IntervalKind::Booking { requester_id, status, .. }) => (*requester_id, *status),
            _ => return Err(EngineError::NotFound(id)),
        };
        if !actor.is_admin && actor.id != requester_id {
            return Err(EngineError::NotAuthorized {
                actor: actor.id,
                booking: id,
            });
        }
        if status == BookingStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(id));
        }
        if !status.can_cancel() {
            return Err(EngineError::InvalidTransition { id, from: status });
        }

        let event = Event::BookingCancelled {
            id,
            resource_id,
            cancelled_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booking = guard
            .interval(id)
            .and_then(|i| i.as_booking(resource_id))
            .ok_or(EngineError::NotFound(id))?;
        drop(guard);

        metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
        self.side_effects.fire(DomainEvent::BookingCancelled {
            booking: booking.clone(),
            actor_id: actor.id,
        });
        Ok(booking)
    }

    /// Blocks yield to existing bookings and to each other. The overlap check
    /// runs under the resource's write lock, the same unit of work as bookings.
    pub async fn create_block(&self, req: NewBlock, created_by: Ulid) -> Result<BlockInfo, EngineError> {
        let span = validate_interval(req.start, req.end)?;
        validate_span(&span)?;
        if let Some(ref r) = req.reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }

        let rs = self
            .get_resource(&req.resource_id)
            .ok_or(EngineError::ResourceNotFound(req.resource_id))?;
        let mut guard = rs.write().await;
        if !self.state.contains_key(&req.resource_id) {
            return Err(EngineError::ResourceNotFound(req.resource_id));
        }
        check_block_slot(&guard, &span)?;
        if guard.intervals.len() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }

        let block = BlockInfo {
            id: Ulid::new(),
            resource_id: req.resource_id,
            start: span.start,
            end: span.end,
            reason: req.reason,
            created_by,
            created_at: now_ms(),
        };
        let event = Event::BlockCreated {
            id: block.id,
            resource_id: block.resource_id,
            span,
            reason: block.reason.clone(),
            created_by,
            created_at: block.created_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        self.side_effects.fire(DomainEvent::BlockCreated { block: block.clone() });
        Ok(block)
    }

    pub async fn delete_block(&self, id: Ulid, actor_id: Ulid) -> Result<BlockInfo, EngineError> {
        let (resource_id, mut guard) = self.resolve_entity_write(&id).await?;
        let block = guard
            .interval(id)
            .and_then(|i| i.as_block(resource_id))
            .ok_or(EngineError::NotFound(id))?;

        let event = Event::BlockDeleted { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        self.side_effects.fire(DomainEvent::BlockDeleted {
            block: block.clone(),
            actor_id,
        });
        Ok(block)
    }

    /// Rewrite the WAL as the minimal event list that recreates current state.
    ///
    /// Holds every resource's read lock until the writer has swapped files, so
    /// no mutation can land in the old log after the snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;
        let mut resources: Vec<(Ulid, super::SharedResourceState)> =
            self.state.iter().map(|e| (*e.key(), e.value().clone())).collect();
        resources.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(resources.len());
        for (id, rs) in resources {
            let guard = rs.read_owned().await;
            if self.state.contains_key(&id) {
                guards.push(guard);
            }
        }

        let mut events = Vec::new();
        for rs in &guards {
            events.push(Event::ResourceCreated {
                id: rs.id,
                name: rs.name.clone(),
                capacity: rs.capacity,
                hourly_rate: rs.hourly_rate,
                status: rs.status,
            });
            for interval in &rs.intervals {
                match &interval.kind {
                    IntervalKind::Booking {
                        requester_id,
                        total_price,
                        status,
                        notes,
                        created_at,
                        updated_at,
                    } => {
                        events.push(Event::BookingCreated {
                            id: interval.id,
                            resource_id: rs.id,
                            requester_id: *requester_id,
                            span: interval.span,
                            total_price: *total_price,
                            notes: notes.clone(),
                            created_at: *created_at,
                        });
                        if *status == BookingStatus::Cancelled {
                            events.push(Event::BookingCancelled {
                                id: interval.id,
                                resource_id: rs.id,
                                cancelled_at: *updated_at,
                            });
                        }
                    }
                    IntervalKind::Block {
                        reason,
                        created_by,
                        created_at,
                    } => events.push(Event::BlockCreated {
                        id: interval.id,
                        resource_id: rs.id,
                        span: interval.span,
                        reason: reason.clone(),
                        created_by: *created_by,
                        created_at: *created_at,
                    }),
                }
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| storage_error("WAL writer shut down"))?;
        rx.await
            .map_err(|_| storage_error("WAL writer dropped response"))?
            .map_err(|e| storage_error(e.to_string()))?;
        drop(guards);

        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
