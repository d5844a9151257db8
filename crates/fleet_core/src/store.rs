//! Rover state store.
//!
//! Each session owns one slot per rover. Slots are locked independently, so
//! writing one rover never waits on another; the session map lock is only
//! held long enough to find the slots.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use shared::{
    domain::{RoverId, RoverRecord, SessionId},
    error::{ApiError, ErrorCode},
};
use tokio::sync::RwLock;

use crate::session::Session;

type Slot = Arc<RwLock<Option<RoverRecord>>>;

struct SessionFleet {
    slots: BTreeMap<RoverId, Slot>,
}

#[derive(Clone, Default)]
pub struct RoverStateStore {
    fleets: Arc<RwLock<HashMap<SessionId, Arc<SessionFleet>>>>,
}

impl RoverStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates empty slots for every rover the session governs.
    pub async fn open(&self, session: &Session) {
        let slots = session
            .rovers
            .iter()
            .map(|rover| (rover.clone(), Slot::default()))
            .collect();
        self.fleets
            .write()
            .await
            .entry(session.id.clone())
            .or_insert_with(|| Arc::new(SessionFleet { slots }));
    }

    pub async fn close(&self, session_id: &SessionId) {
        self.fleets.write().await.remove(session_id);
    }

    async fn fleet(&self, session_id: &SessionId) -> Result<Arc<SessionFleet>, ApiError> {
        self.fleets
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::InvalidSession,
                    format!("no rover state for session {session_id}"),
                )
            })
    }

    async fn slot(&self, session_id: &SessionId, rover: &RoverId) -> Result<Slot, ApiError> {
        self.fleet(session_id)
            .await?
            .slots
            .get(rover)
            .cloned()
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::UnknownRover,
                    format!("{rover} is not part of session {session_id}"),
                )
                .with_rover(rover.clone())
            })
    }

    pub async fn get(&self, session_id: &SessionId, rover: &RoverId) -> Result<RoverRecord, ApiError> {
        let slot = self.slot(session_id, rover).await?;
        let record = slot.read().await.clone();
        record.ok_or_else(|| {
            ApiError::new(ErrorCode::NoData, format!("no data recorded for {rover} yet"))
                .with_rover(rover.clone())
        })
    }

    /// Best-effort snapshot of every populated rover. Each record is
    /// consistent on its own; the set as a whole is not taken atomically.
    pub async fn get_all(
        &self,
        session_id: &SessionId,
    ) -> Result<BTreeMap<RoverId, RoverRecord>, ApiError> {
        let fleet = self.fleet(session_id).await?;
        let mut snapshot = BTreeMap::new();
        for (rover, slot) in &fleet.slots {
            if let Some(record) = slot.read().await.as_ref() {
                snapshot.insert(rover.clone(), record.clone());
            }
        }
        Ok(snapshot)
    }

    /// Replaces a rover's record unless the stored one is newer. Returns
    /// whether the write was applied. The battery level never goes up here.
    pub async fn update(&self, session_id: &SessionId, record: RoverRecord) -> Result<bool, ApiError> {
        self.write(session_id, record, false).await
    }

    /// Like [`update`](Self::update), but a reset may restore battery level.
    pub async fn reset(&self, session_id: &SessionId, record: RoverRecord) -> Result<bool, ApiError> {
        self.write(session_id, record, true).await
    }

    async fn write(
        &self,
        session_id: &SessionId,
        mut record: RoverRecord,
        allow_recharge: bool,
    ) -> Result<bool, ApiError> {
        let slot = self.slot(session_id, &record.rover_id).await?;
        let mut current = slot.write().await;
        record.battery = record.battery.min(100);
        if let Some(existing) = current.as_ref() {
            if record.updated_at < existing.updated_at {
                return Ok(false);
            }
            if !allow_recharge {
                record.battery = record.battery.min(existing.battery);
            }
        }
        *current = Some(record);
        Ok(true)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
