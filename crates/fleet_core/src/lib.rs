//! Fleet coordination core: sessions, rover state, command sequencing,
//! fleet-wide reads and task coordination on top of a [`FleetBackend`].

use std::{sync::Arc, time::Duration};

use fleet_backend::FleetBackend;
use shared::{
    domain::SessionId,
    error::ApiError,
    protocol::{FleetEvent, StartSessionResponse},
};
use tokio::sync::broadcast;
use tracing::info;

pub mod aggregate;
pub mod coordinate;
pub mod dispatch;
pub mod profile;
pub mod sensors;
pub mod session;
pub mod store;

pub use aggregate::{
    battery_levels, cached_status, coordinates, fleet_status, rover_status, sensor_data, FanOut,
};
pub use coordinate::{coordinate_task, CrewCandidate, TaskPlan};
pub use dispatch::{assign_task, move_rover, reset_rover, CommandGates};
pub use profile::FleetProfile;
pub use sensors::{sensor_health, SensorCheck, SensorHealth, SensorTolerances};
pub use session::{Session, SessionRegistry};
pub use store::RoverStateStore;

#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub session_idle_timeout: Duration,
    /// Default budget for fan-out reads when the caller does not pass one.
    pub fan_out_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::from_secs(30 * 60),
            fan_out_timeout: Duration::from_secs(8),
            event_capacity: 256,
        }
    }
}

#[derive(Clone)]
pub struct FleetContext {
    pub profile: Arc<FleetProfile>,
    pub backend: Arc<dyn FleetBackend>,
    pub sessions: SessionRegistry,
    pub store: RoverStateStore,
    pub gates: CommandGates,
    events: broadcast::Sender<FleetEvent>,
    fan_out_timeout: Duration,
}

impl FleetContext {
    pub fn new(profile: FleetProfile, backend: Arc<dyn FleetBackend>, options: FleetOptions) -> Self {
        let sessions = SessionRegistry::new(
            backend.clone(),
            profile.rovers.clone(),
            options.session_idle_timeout,
        );
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            profile: Arc::new(profile),
            backend,
            sessions,
            store: RoverStateStore::new(),
            gates: CommandGates::default(),
            events,
            fan_out_timeout: options.fan_out_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: FleetEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn budget(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.fan_out_timeout)
    }
}

pub async fn start_session(ctx: &FleetContext) -> Result<StartSessionResponse, ApiError> {
    let session = ctx.sessions.start().await?;
    ctx.store.open(&session).await;
    ctx.publish(FleetEvent::SessionStarted {
        session_id: session.id.clone(),
    });
    Ok(StartSessionResponse {
        session_id: session.id,
    })
}

/// Forgets sessions that have been idle past the timeout, along with their
/// rover state and command gates.
pub async fn expire_idle_sessions(ctx: &FleetContext) -> Vec<SessionId> {
    let expired = ctx.sessions.expire_idle().await;
    forget_sessions(ctx, &expired).await;
    expired
}

async fn forget_sessions(ctx: &FleetContext, expired: &[SessionId]) {
    for session_id in expired {
        ctx.store.close(session_id).await;
        ctx.gates.forget_session(session_id).await;
        info!(session_id = %session_id, "session expired");
        ctx.publish(FleetEvent::SessionExpired {
            session_id: session_id.clone(),
        });
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
