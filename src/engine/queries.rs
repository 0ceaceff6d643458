use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_windows;
use super::conflict::{check_slot, validate_interval};
use super::{Engine, EngineError, SharedResourceState, SlotConflictReason};

impl Engine {
    fn resource_or_not_found(&self, id: Ulid) -> Result<SharedResourceState, EngineError> {
        self.get_resource(&id).ok_or(EngineError::ResourceNotFound(id))
    }

    /// Why `[start, end)` is not bookable, or `None` if it is.
    ///
    /// Fails with `ResourceNotFound` / `ResourceUnavailable` rather than
    /// reporting a conflict.
    pub async fn slot_conflict(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_booking: Option<Ulid>,
    ) -> Result<Option<SlotConflictReason>, EngineError> {
        let span = validate_interval(start, end)?;
        let rs = self.resource_or_not_found(resource_id)?;
        let guard = rs.read().await;
        match check_slot(&guard, &span, exclude_booking) {
            Ok(()) => Ok(None),
            Err(EngineError::SlotConflict(reason)) => Ok(Some(reason)),
            Err(e) => Err(e),
        }
    }

    /// Advisory: the answer can be stale by the time the caller acts on it.
    pub async fn is_slot_free(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_booking: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        Ok(self
            .slot_conflict(resource_id, start, end, exclude_booking)
            .await?
            .is_none())
    }

    /// All resources, ordered by id.
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut handles: Vec<SharedResourceState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for rs in handles.drain(..) {
            out.push(rs.read().await.info());
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_resource_info(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.resource_or_not_found(id)?;
        let guard = rs.read().await;
        Ok(guard.info())
    }

    /// Every booking on the resource, cancelled ones included, by start time.
    pub async fn get_bookings(&self, resource_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let rs = self.resource_or_not_found(resource_id)?;
        let guard = rs.read().await;
        Ok(guard
            .intervals
            .iter()
            .filter_map(|i| i.as_booking(resource_id))
            .collect())
    }

    pub async fn get_blocks(&self, resource_id: Ulid) -> Result<Vec<BlockInfo>, EngineError> {
        let rs = self.resource_or_not_found(resource_id)?;
        let guard = rs.read().await;
        Ok(guard
            .intervals
            .iter()
            .filter_map(|i| i.as_block(resource_id))
            .collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let resource_id = self.get_resource_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard
            .interval(id)
            .and_then(|i| i.as_booking(resource_id))
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn compute_free_windows(
        &self,
        resource_id: Ulid,
        query_start: Ms,
        query_end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = validate_interval(query_start, query_end)?;
        if query.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self.resource_or_not_found(resource_id)?;
        let guard = rs.read().await;

        let mut free = free_windows(&guard, &query);
        if let Some(min_dur) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(free)
    }
}
