//! Sensor cross-checks.
//!
//! Rovers in one field should read roughly the same soil. A reading that sits
//! too far from the average of the other rovers marks that sensor as faulty.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use shared::{domain::RoverId, error::ApiError, protocol::SensorReading};
use tracing::warn;

use crate::{aggregate::sensor_data, FanOut, FleetContext};

const MOISTURE_RANGE: f64 = 100.0;
const PH_RANGE: f64 = 14.0;
const TEMPERATURE_RANGE: f64 = 50.0;

/// Largest distance from the peer average a sensor may read and still count as working.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorTolerances {
    pub moisture: f64,
    pub ph: f64,
    pub temperature: f64,
}

impl Default for SensorTolerances {
    fn default() -> Self {
        Self {
            moisture: 25.0,
            ph: 2.5,
            temperature: 12.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorCheck {
    pub value: f64,
    /// `None` when no other rover answered.
    pub peer_average: Option<f64>,
    pub working: bool,
    /// `1.0` when the reading matches its peers, falling to `0.0` across the sensor's range.
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorHealth {
    pub rover_id: RoverId,
    pub soil_moisture: SensorCheck,
    #[serde(rename = "soil_pH")]
    pub soil_ph: SensorCheck,
    pub temperature: SensorCheck,
}

impl SensorHealth {
    pub fn is_healthy(&self) -> bool {
        self.soil_moisture.working && self.soil_ph.working && self.temperature.working
    }
}

fn check(value: f64, peers: &[f64], tolerance: f64, range: f64) -> SensorCheck {
    if peers.is_empty() {
        return SensorCheck {
            value,
            peer_average: None,
            working: true,
            accuracy: 1.0,
        };
    }
    let average = peers.iter().sum::<f64>() / peers.len() as f64;
    let diff = (value - average).abs();
    SensorCheck {
        value,
        peer_average: Some(average),
        working: diff <= tolerance,
        accuracy: (1.0 - diff / range).clamp(0.0, 1.0),
    }
}

/// Compares every rover's readings with the average of all the others.
pub fn assess(
    readings: &BTreeMap<RoverId, SensorReading>,
    tolerances: &SensorTolerances,
) -> BTreeMap<RoverId, SensorHealth> {
    readings
        .iter()
        .map(|(rover, reading)| {
            let peers: Vec<&SensorReading> = readings
                .iter()
                .filter(|(other, _)| *other != rover)
                .map(|(_, peer)| peer)
                .collect();
            let values = |field: fn(&SensorReading) -> f64| -> Vec<f64> {
                peers.iter().map(|&peer| field(peer)).collect()
            };
            let health = SensorHealth {
                rover_id: rover.clone(),
                soil_moisture: check(
                    reading.soil_moisture,
                    &values(|r| r.soil_moisture),
                    tolerances.moisture,
                    MOISTURE_RANGE,
                ),
                soil_ph: check(
                    reading.soil_ph,
                    &values(|r| r.soil_ph),
                    tolerances.ph,
                    PH_RANGE,
                ),
                temperature: check(
                    reading.temperature,
                    &values(|r| r.temperature),
                    tolerances.temperature,
                    TEMPERATURE_RANGE,
                ),
            };
            (rover.clone(), health)
        })
        .collect()
}

/// Fresh sensor readings for the fleet, each checked against the others.
/// Rovers that did not answer keep their error entry.
pub async fn sensor_health(
    ctx: &FleetContext,
    session_id: &str,
    budget: Option<Duration>,
) -> Result<FanOut<SensorHealth>, ApiError> {
    let readings = sensor_data(ctx, session_id, budget).await?;
    let results = assess(&readings.results, &ctx.profile.sensor_tolerances);
    for health in results.values().filter(|health| !health.is_healthy()) {
        warn!(
            session_id,
            rover = %health.rover_id,
            moisture = health.soil_moisture.working,
            ph = health.soil_ph.working,
            temperature = health.temperature.working,
            "sensor readings disagree with the rest of the fleet"
        );
    }
    Ok(FanOut {
        results,
        errors: readings.errors,
    })
}

#[cfg(test)]
#[path = "tests/sensors_tests.rs"]
mod tests;
