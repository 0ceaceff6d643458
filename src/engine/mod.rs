mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use error::{EngineError, SlotConflictReason};
pub use mutations::{NewBlock, NewBooking};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::error;
use ulid::Ulid;

use crate::model::*;
use crate::sinks::SideEffects;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!(events = batch.len(), "WAL flush failed: {e}");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak into
    // the next batch; every caller in this batch is told it failed.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The booking engine: every resource's timeline behind its own lock, a WAL
/// behind a group-commit writer, and the sinks that hear about committed changes.
///
/// One `Engine` is the storage handle; pass it around as `Arc<Engine>`.
pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) side_effects: SideEffects,
    /// Reverse lookup: booking/block id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    /// Serializes resource creation against WAL compaction.
    pub(super) admin: Mutex<()>,
}

/// Apply an event directly to a ResourceState. The caller holds the lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceUpdated {
            name,
            capacity,
            hourly_rate,
            status,
            ..
        } => {
            rs.name = name.clone();
            rs.capacity = *capacity;
            rs.hourly_rate = *hourly_rate;
            rs.status = *status;
        }
        Event::BookingCreated {
            id,
            resource_id,
            requester_id,
            span,
            total_price,
            notes,
            created_at,
        } => {
            rs.insert_interval(Interval {
                id: *id,
                span: *span,
                kind: IntervalKind::Booking {
                    requester_id: *requester_id,
                    total_price: *total_price,
                    status: BookingStatus::Confirmed,
                    notes: notes.clone(),
                    created_at: *created_at,
                    updated_at: *created_at,
                },
            });
            entity_map.insert(*id, *resource_id);
        }
        Event::BookingCancelled { id, cancelled_at, .. } => {
            if let Some(Interval {
                kind: IntervalKind::Booking { status, updated_at, .. },
                ..
            }) = rs.interval_mut(*id)
            {
                *status = BookingStatus::Cancelled;
                *updated_at = *cancelled_at;
            }
        }
        Event::BlockCreated {
            id,
            resource_id,
            span,
            reason,
            created_by,
            created_at,
        } => {
            rs.insert_interval(Interval {
                id: *id,
                span: *span,
                kind: IntervalKind::Block {
                    reason: reason.clone(),
                    created_by: *created_by,
                    created_at: *created_at,
                },
            });
            entity_map.insert(*id, *resource_id);
        }
        Event::BlockDeleted { id, .. } => {
            rs.remove_interval(*id);
            entity_map.remove(id);
        }
        // ResourceCreated/Deleted are handled at the DashMap level, not here
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf, side_effects: SideEffects) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_resource = DashMap::new();
        let mut resources: HashMap<Ulid, ResourceState> = HashMap::new();
        for event in &events {
            match event {
                Event::ResourceCreated {
                    id,
                    name,
                    capacity,
                    hourly_rate,
                    status,
                } => {
                    resources.insert(
                        *id,
                        ResourceState::new(*id, name.clone(), *capacity, *hourly_rate, *status),
                    );
                }
                Event::ResourceDeleted { id } => {
                    if let Some(rs) = resources.remove(id) {
                        forget_intervals(&rs, &entity_to_resource);
                    }
                }
                other => {
                    if let Some(rs) = event_resource_id(other).and_then(|rid| resources.get_mut(&rid)) {
                        apply_to_resource(rs, other, &entity_to_resource);
                    }
                }
            }
        }

        let state = DashMap::with_capacity(resources.len());
        for (id, rs) in resources {
            state.insert(id, Arc::new(RwLock::new(rs)));
        }
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(state.len() as f64);

        Ok(Self {
            state,
            wal_tx,
            side_effects,
            entity_to_resource,
            admin: Mutex::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| storage_error("WAL writer shut down"))?;
        rx.await
            .map_err(|_| storage_error("WAL writer dropped response"))?
            .map_err(|e| storage_error(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append then apply. The caller holds the resource's write lock, so
    /// nothing observes the event before it is durable.
    pub(super) async fn persist_and_apply(&self, rs: &mut ResourceState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.entity_to_resource);
        Ok(())
    }

    /// Lookup entity → resource, get resource, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = rs.write_owned().await;
        Ok((resource_id, guard))
    }
}

/// Log the detail, hand the caller a generic storage error.
fn storage_error(detail: impl Into<String>) -> EngineError {
    let detail = detail.into();
    error!("storage failure: {detail}");
    EngineError::Storage(detail)
}

fn forget_intervals(rs: &ResourceState, entity_map: &DashMap<Ulid, Ulid>) {
    for interval in &rs.intervals {
        entity_map.remove(&interval.id);
    }
}

/// Extract the resource_id from an event (for non-Create/Delete events).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BookingCreated { resource_id, .. }
        | Event::BookingCancelled { resource_id, .. }
        | Event::BlockCreated { resource_id, .. }
        | Event::BlockDeleted { resource_id, .. } => Some(*resource_id),
        Event::ResourceUpdated { id, .. } => Some(*id),
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => None,
    }
}
