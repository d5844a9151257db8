//! Client side of the remote rover backend.
//!
//! Everything the gateway knows about the backend goes through [`FleetBackend`].
//! [`HttpFleetBackend`] speaks the backend's HTTP contract; tests substitute
//! scripted implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use shared::{
    domain::{Direction, RoverId, SessionId, TaskName},
    protocol::{
        BatteryReading, CommandAck, CoordinateReading, RoverStatusReport, SensorReading,
    },
};

mod error;
mod http;

pub use error::BackendError;
pub use http::{BackendConfig, HttpFleetBackend};

#[async_trait]
pub trait FleetBackend: Send + Sync {
    async fn start_session(&self) -> Result<SessionId, BackendError>;

    async fn fleet_status(
        &self,
        session: &SessionId,
    ) -> Result<HashMap<RoverId, RoverStatusReport>, BackendError>;

    async fn rover_status(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<RoverStatusReport, BackendError>;

    async fn sensor_data(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<SensorReading, BackendError>;

    async fn battery(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<BatteryReading, BackendError>;

    async fn coordinates(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<CoordinateReading, BackendError>;

    async fn move_rover(
        &self,
        session: &SessionId,
        rover: &RoverId,
        direction: &Direction,
    ) -> Result<CommandAck, BackendError>;

    async fn reset_rover(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<CommandAck, BackendError>;

    async fn assign_task(
        &self,
        session: &SessionId,
        rover: &RoverId,
        task: &TaskName,
    ) -> Result<CommandAck, BackendError>;
}
