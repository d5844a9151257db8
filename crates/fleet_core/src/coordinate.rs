//! Task coordination: picks the nearest idle rovers that can afford a task and
//! assigns it to them.

use std::{collections::BTreeMap, time::Duration};

use futures::future::join_all;
use serde::Serialize;
use shared::{
    domain::{Coordinates, RoverId, RoverRecord, RoverStatus, TaskName},
    error::{ApiError, ErrorCode},
    protocol::CommandAck,
};
use tracing::info;

use crate::{aggregate::fleet_status, dispatch::assign_task, FleetContext, FleetProfile};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrewCandidate {
    pub rover_id: RoverId,
    /// Manhattan distance to the task site.
    pub distance: u64,
    pub battery: u8,
    pub moves_left: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPlan {
    pub task: TaskName,
    pub target: Coordinates,
    pub crew_size: usize,
    pub crew: Vec<CrewCandidate>,
    pub assigned: BTreeMap<RoverId, CommandAck>,
    pub errors: BTreeMap<RoverId, ApiError>,
}

fn distance(from: Coordinates, to: Coordinates) -> u64 {
    from[0].abs_diff(to[0]) + from[1].abs_diff(to[1])
}

fn is_free(record: &RoverRecord) -> bool {
    record.status == RoverStatus::Idle && record.task.is_none()
}

/// Idle rovers without a task that can afford a move and the task, nearest
/// first. Ties go to the lower rover id.
pub fn candidates<'a>(
    records: impl IntoIterator<Item = &'a RoverRecord>,
    profile: &FleetProfile,
    task: &TaskName,
    target: Coordinates,
) -> Vec<CrewCandidate> {
    let mut picked: Vec<CrewCandidate> = records
        .into_iter()
        .filter(|record| is_free(record))
        .filter(|record| profile.can_move(record.battery) && profile.can_run(task, record.battery))
        .map(|record| CrewCandidate {
            rover_id: record.rover_id.clone(),
            distance: distance(record.coordinates, target),
            battery: record.battery,
            moves_left: profile.moves_left(record.battery),
        })
        .collect();
    picked.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then_with(|| a.rover_id.cmp(&b.rover_id))
    });
    picked
}

/// Refreshes the fleet, then assigns `task` to the `crew` nearest eligible
/// rovers (the task's configured crew size when `None`). Assignments that
/// fail are reported per rover; the call fails only when nobody is eligible.
pub async fn coordinate_task(
    ctx: &FleetContext,
    session_id: &str,
    task: &str,
    target: Coordinates,
    crew: Option<usize>,
    budget: Option<Duration>,
) -> Result<TaskPlan, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let task = ctx.profile.task(task)?;
    let crew_size = match crew {
        Some(0) => {
            return Err(ApiError::new(
                ErrorCode::MissingField,
                "crew must be at least 1",
            ))
        }
        Some(size) => size,
        None => ctx.profile.task_crew(&task),
    };

    fleet_status(ctx, session_id, budget).await?;
    let snapshot = ctx.store.get_all(&session.id).await?;
    let mut crew: Vec<CrewCandidate> = candidates(snapshot.values(), &ctx.profile, &task, target);
    if crew.is_empty() {
        let (code, reason) = if snapshot.values().any(is_free) {
            (ErrorCode::InsufficientBattery, "has enough battery for")
        } else {
            (ErrorCode::RoverBusy, "is free for")
        };
        return Err(ApiError::new(code, format!("no idle rover {reason} {task}")));
    }
    crew.truncate(crew_size);

    let calls = crew.iter().map(|candidate| {
        let rover = candidate.rover_id.clone();
        let task = task.as_str();
        async move {
            let outcome = assign_task(ctx, session_id, rover.as_str(), task).await;
            (rover, outcome)
        }
    });
    let mut assigned = BTreeMap::new();
    let mut errors = BTreeMap::new();
    for (rover, outcome) in join_all(calls).await {
        match outcome {
            Ok(ack) => {
                assigned.insert(rover, ack);
            }
            Err(err) => {
                errors.insert(rover, err);
            }
        }
    }

    info!(
        session_id = %session.id,
        task = %task,
        wanted = crew_size,
        assigned = assigned.len(),
        failed = errors.len(),
        "task coordinated"
    );
    Ok(TaskPlan {
        task,
        target,
        crew_size,
        crew,
        assigned,
        errors,
    })
}

#[cfg(test)]
#[path = "tests/coordinate_tests.rs"]
mod tests;
