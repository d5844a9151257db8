//! Fleet-wide reads.
//!
//! Each view fans out one backend call per rover, runs them concurrently and
//! keeps whatever came back inside the time budget. Rovers that failed or ran
//! out of time are reported next to the results instead of failing the call.

use std::{collections::BTreeMap, future::Future, time::Duration};

use chrono::{DateTime, Utc};
use fleet_backend::BackendError;
use futures::future::join_all;
use serde::Serialize;
use shared::{
    domain::RoverId,
    error::{ApiError, ErrorCode},
    protocol::{
        BatteryReading, CoordinateReading, FleetEvent, RoverStatusReport, SensorReading,
    },
};
use tokio::time::{timeout, Instant};
use tracing::warn;

use crate::{session::Session, FleetContext};

#[derive(Debug, Clone, Serialize)]
pub struct FanOut<T> {
    pub results: BTreeMap<RoverId, T>,
    pub errors: BTreeMap<RoverId, ApiError>,
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }
}

impl<T> FanOut<T> {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty() && !self.results.is_empty()
    }

    /// Every rover failed. An empty fleet is not a failure.
    pub fn is_total_failure(&self) -> bool {
        !self.errors.is_empty() && self.results.is_empty()
    }
}

/// A reply stamped with the moment its request went out.
struct Observed<T> {
    at: DateTime<Utc>,
    value: T,
}

impl<T> FanOut<Observed<T>> {
    fn into_values(self) -> FanOut<T> {
        FanOut {
            results: self
                .results
                .into_iter()
                .map(|(rover, observed)| (rover, observed.value))
                .collect(),
            errors: self.errors,
        }
    }
}

fn timeout_error(rover: &RoverId, budget: Duration) -> ApiError {
    ApiError::new(
        ErrorCode::BackendTimeout,
        format!("{rover} did not answer within {}ms", budget.as_millis()),
    )
    .with_rover(rover.clone())
}

/// Every rover reported as timed out, without calling the backend.
fn timed_out<T>(rovers: &[RoverId], budget: Duration) -> FanOut<T> {
    FanOut {
        results: BTreeMap::new(),
        errors: rovers
            .iter()
            .map(|rover| (rover.clone(), timeout_error(rover, budget)))
            .collect(),
    }
}

async fn observe<T, F, Fut>(rovers: &[RoverId], budget: Duration, call: F) -> FanOut<Observed<T>>
where
    F: Fn(RoverId) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let calls = rovers.iter().cloned().map(|rover| {
        let pending = call(rover.clone());
        async move {
            let at = Utc::now();
            let outcome = match timeout(budget, pending).await {
                Ok(Ok(value)) => Ok(Observed { at, value }),
                Ok(Err(err)) => Err(ApiError::from(err)),
                Err(_) => Err(timeout_error(&rover, budget)),
            };
            (rover, outcome)
        }
    });

    let mut out = FanOut::default();
    for (rover, outcome) in join_all(calls).await {
        match outcome {
            Ok(observed) => {
                out.results.insert(rover, observed);
            }
            Err(err) => {
                out.errors.insert(rover, err);
            }
        }
    }
    out
}

async fn fan_out<T, F, Fut>(rovers: &[RoverId], budget: Duration, call: F) -> FanOut<T>
where
    F: Fn(RoverId) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    observe(rovers, budget, call).await.into_values()
}

fn report_partial<T>(view: &str, session: &Session, out: &FanOut<T>) {
    if out.errors.is_empty() {
        return;
    }
    warn!(
        session_id = %session.id,
        view,
        failed = out.errors.len(),
        succeeded = out.results.len(),
        "fan-out finished with failures"
    );
}

/// Fleet status from the backend's aggregate endpoint, falling back to one
/// call per rover when the aggregate call fails.
pub async fn fleet_status(
    ctx: &FleetContext,
    session_id: &str,
    budget: Option<Duration>,
) -> Result<FanOut<RoverStatusReport>, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let budget = ctx.budget(budget);
    let deadline = Instant::now() + budget;

    let asked_at = Utc::now();
    let observed = match timeout(budget, ctx.backend.fleet_status(&session.id)).await {
        Ok(Ok(mut reports)) => {
            let mut out = FanOut::default();
            for rover in session.rovers.iter() {
                match reports.remove(rover) {
                    Some(value) => {
                        out.results.insert(
                            rover.clone(),
                            Observed {
                                at: asked_at,
                                value,
                            },
                        );
                    }
                    None => {
                        out.errors.insert(
                            rover.clone(),
                            ApiError::new(
                                ErrorCode::NoData,
                                format!("{rover} missing from fleet status reply"),
                            )
                            .with_rover(rover.clone()),
                        );
                    }
                }
            }
            out
        }
        Ok(Err(err)) => {
            warn!(session_id = %session.id, error = %err, "fleet status call failed; asking each rover");
            let remaining = deadline.saturating_duration_since(Instant::now());
            status_fan_out(ctx, &session, remaining).await
        }
        Err(_) => {
            warn!(session_id = %session.id, "fleet status call timed out");
            timed_out(&session.rovers, budget)
        }
    };

    record_statuses(ctx, &session, &observed).await;
    let out = observed.into_values();
    report_partial("fleet_status", &session, &out);
    Ok(out)
}

/// Status of every rover, one backend call each.
pub async fn rover_status(
    ctx: &FleetContext,
    session_id: &str,
    budget: Option<Duration>,
) -> Result<FanOut<RoverStatusReport>, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let observed = status_fan_out(ctx, &session, ctx.budget(budget)).await;
    record_statuses(ctx, &session, &observed).await;
    let out = observed.into_values();
    report_partial("rover_status", &session, &out);
    Ok(out)
}

async fn status_fan_out(
    ctx: &FleetContext,
    session: &Session,
    budget: Duration,
) -> FanOut<Observed<RoverStatusReport>> {
    observe(&session.rovers, budget, |rover| {
        let backend = ctx.backend.clone();
        let session_id = session.id.clone();
        async move { backend.rover_status(&session_id, &rover).await }
    })
    .await
}

/// Writes each reply through to the store, stamped with when it was asked
/// for, so a reply that raced a command cannot overwrite the command's result.
async fn record_statuses(
    ctx: &FleetContext,
    session: &Session,
    out: &FanOut<Observed<RoverStatusReport>>,
) {
    for (rover, observed) in &out.results {
        let record = observed.value.clone().into_record(rover.clone(), observed.at);
        match ctx.store.update(&session.id, record).await {
            Ok(true) => {
                if let Ok(stored) = ctx.store.get(&session.id, rover).await {
                    ctx.publish(FleetEvent::RoverUpdated {
                        session_id: session.id.clone(),
                        record: stored,
                    });
                }
            }
            Ok(false) => {}
            Err(err) => {
                warn!(session_id = %session.id, rover = %rover, error = %err.message, "could not record rover status");
            }
        }
    }
}

pub async fn sensor_data(
    ctx: &FleetContext,
    session_id: &str,
    budget: Option<Duration>,
) -> Result<FanOut<SensorReading>, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let out = fan_out(&session.rovers, ctx.budget(budget), |rover| {
        let backend = ctx.backend.clone();
        let session_id = session.id.clone();
        async move { backend.sensor_data(&session_id, &rover).await }
    })
    .await;
    report_partial("sensor_data", &session, &out);
    Ok(out)
}

pub async fn battery_levels(
    ctx: &FleetContext,
    session_id: &str,
    budget: Option<Duration>,
) -> Result<FanOut<BatteryReading>, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let out = fan_out(&session.rovers, ctx.budget(budget), |rover| {
        let backend = ctx.backend.clone();
        let session_id = session.id.clone();
        async move { backend.battery(&session_id, &rover).await }
    })
    .await;
    report_partial("battery", &session, &out);
    Ok(out)
}

pub async fn coordinates(
    ctx: &FleetContext,
    session_id: &str,
    budget: Option<Duration>,
) -> Result<FanOut<CoordinateReading>, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let out = fan_out(&session.rovers, ctx.budget(budget), |rover| {
        let backend = ctx.backend.clone();
        let session_id = session.id.clone();
        async move { backend.coordinates(&session_id, &rover).await }
    })
    .await;
    report_partial("coordinates", &session, &out);
    Ok(out)
}

/// What the store currently knows, without asking the backend.
pub async fn cached_status(
    ctx: &FleetContext,
    session_id: &str,
) -> Result<BTreeMap<RoverId, RoverStatusReport>, ApiError> {
    let session = ctx.sessions.validate(session_id).await?;
    let snapshot = ctx.store.get_all(&session.id).await?;
    Ok(snapshot
        .iter()
        .map(|(rover, record)| (rover.clone(), RoverStatusReport::from(record)))
        .collect())
}

#[cfg(test)]
#[path = "tests/aggregate_tests.rs"]
mod tests;
