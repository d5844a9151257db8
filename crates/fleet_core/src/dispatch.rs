//! Command validation and dispatch.
//!
//! Every command holds its rover's gate for the whole round trip: backend
//! call, status refresh and store write. Moves refuse to wait for the gate and
//! fail with `RoverBusy`; resets and task assignments queue behind it.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{CommandKind, RoverId, RoverRecord, RoverStatus, SessionId},
    error::{ApiError, ErrorCode},
    protocol::{CommandAck, FleetEvent},
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::{session::Session, FleetContext};

/// One async mutex per (session, rover).
#[derive(Clone, Default)]
pub struct CommandGates {
    gates: Arc<Mutex<HashMap<(SessionId, RoverId), Arc<Mutex<()>>>>>,
}

impl CommandGates {
    async fn gate(&self, session_id: &SessionId, rover: &RoverId) -> Arc<Mutex<()>> {
        self.gates
            .lock()
            .await
            .entry((session_id.clone(), rover.clone()))
            .or_default()
            .clone()
    }

    /// Takes the gate only if no other command holds it.
    pub async fn try_acquire(
        &self,
        session_id: &SessionId,
        rover: &RoverId,
    ) -> Option<OwnedMutexGuard<()>> {
        self.gate(session_id, rover).await.try_lock_owned().ok()
    }

    /// Waits for the gate. Waiters are served in arrival order.
    pub async fn acquire(&self, session_id: &SessionId, rover: &RoverId) -> OwnedMutexGuard<()> {
        self.gate(session_id, rover).await.lock_owned().await
    }

    pub async fn forget_session(&self, session_id: &SessionId) {
        self.gates
            .lock()
            .await
            .retain(|(session, _), _| session != session_id);
    }
}

pub async fn move_rover(
    ctx: &FleetContext,
    session_id: &str,
    rover: &str,
    direction: &str,
) -> Result<CommandAck, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let rover = session.rover(rover)?;
    let direction = ctx.profile.direction(direction)?;

    let Some(_gate) = ctx.gates.try_acquire(&session.id, &rover).await else {
        return Err(busy(&rover, "another command is still in flight"));
    };
    let previous = known_record(ctx, &session, &rover).await?;
    if let Some(record) = &previous {
        if record.status == RoverStatus::Moving {
            return Err(busy(&rover, "rover is already moving"));
        }
        if !ctx.profile.can_move(record.battery) {
            return Err(low_battery(
                ctx,
                &rover,
                record.battery,
                "a move",
                ctx.profile.move_battery_cost,
            ));
        }
    }

    dispatch(ctx, &session, rover, CommandKind::Move { direction }, previous).await
}

pub async fn reset_rover(
    ctx: &FleetContext,
    session_id: &str,
    rover: &str,
) -> Result<CommandAck, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let rover = session.rover(rover)?;

    let _gate = ctx.gates.acquire(&session.id, &rover).await;
    let previous = known_record(ctx, &session, &rover).await?;
    dispatch(ctx, &session, rover, CommandKind::Reset, previous).await
}

pub async fn assign_task(
    ctx: &FleetContext,
    session_id: &str,
    rover: &str,
    task: &str,
) -> Result<CommandAck, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let rover = session.rover(rover)?;
    let task = ctx.profile.task(task)?;

    let _gate = ctx.gates.acquire(&session.id, &rover).await;
    let previous = known_record(ctx, &session, &rover).await?;
    if let Some(record) = &previous {
        if record.status == RoverStatus::Moving {
            return Err(busy(&rover, "cannot assign a task while the rover is moving"));
        }
        if !ctx.profile.can_run(&task, record.battery) {
            return Err(low_battery(
                ctx,
                &rover,
                record.battery,
                task.as_str(),
                ctx.profile.task_battery_cost(&task),
            ));
        }
    }
    dispatch(ctx, &session, rover, CommandKind::AssignTask { task }, previous).await
}

async fn dispatch(
    ctx: &FleetContext,
    session: &Session,
    rover: RoverId,
    kind: CommandKind,
    previous: Option<RoverRecord>,
) -> Result<CommandAck, ApiError> {
    let sent = match &kind {
        CommandKind::Move { direction } => {
            ctx.backend.move_rover(&session.id, &rover, direction).await
        }
        CommandKind::Reset => ctx.backend.reset_rover(&session.id, &rover).await,
        CommandKind::AssignTask { task } => {
            ctx.backend.assign_task(&session.id, &rover, task).await
        }
    };
    let ack = sent.map_err(|err| {
        warn!(
            session_id = %session.id,
            rover = %rover,
            command = kind.label(),
            error = %err,
            "command failed"
        );
        ApiError::from(err)
    })?;
    info!(
        session_id = %session.id,
        rover = %rover,
        command = kind.label(),
        message = %ack.message,
        "command dispatched"
    );

    let record = settle(ctx, session, &rover, previous, &kind).await?;
    ctx.publish(FleetEvent::CommandDispatched {
        session_id: session.id.clone(),
        rover_id: rover,
        command: kind,
        message: ack.message.clone(),
    });
    ctx.publish(FleetEvent::RoverUpdated {
        session_id: session.id.clone(),
        record,
    });
    Ok(ack)
}

/// Refreshes the rover from the backend and stores it with the command's
/// transition applied. Falls back to the last known record if the refresh fails.
async fn settle(
    ctx: &FleetContext,
    session: &Session,
    rover: &RoverId,
    previous: Option<RoverRecord>,
    kind: &CommandKind,
) -> Result<RoverRecord, ApiError> {
    let asked_at = Utc::now();
    let base = match ctx.backend.rover_status(&session.id, rover).await {
        Ok(report) => report.into_record(rover.clone(), asked_at),
        Err(err) => {
            warn!(
                session_id = %session.id,
                rover = %rover,
                error = %err,
                "status refresh after command failed; applying transition locally"
            );
            previous.unwrap_or_else(|| RoverRecord::idle(rover.clone(), asked_at))
        }
    };
    let record = base.apply(kind, asked_at);
    match kind {
        CommandKind::Reset => ctx.store.reset(&session.id, record).await?,
        _ => ctx.store.update(&session.id, record).await?,
    };
    ctx.store.get(&session.id, rover).await
}

async fn known_record(
    ctx: &FleetContext,
    session: &Session,
    rover: &RoverId,
) -> Result<Option<RoverRecord>, ApiError> {
    match ctx.store.get(&session.id, rover).await {
        Ok(record) => Ok(Some(record)),
        Err(err) if err.code == ErrorCode::NoData => Ok(None),
        Err(err) => Err(err),
    }
}

fn low_battery(ctx: &FleetContext, rover: &RoverId, battery: u8, job: &str, cost: u8) -> ApiError {
    ApiError::new(
        ErrorCode::InsufficientBattery,
        format!(
            "{rover} has {battery}% battery; {job} uses {cost}% and {}% must stay in reserve",
            ctx.profile.battery_reserve
        ),
    )
    .with_rover(rover.clone())
}

fn busy(rover: &RoverId, reason: &str) -> ApiError {
    ApiError::new(ErrorCode::RoverBusy, format!("{rover} is busy: {reason}")).with_rover(rover.clone())
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
