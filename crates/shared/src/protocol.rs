use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{
    CommandKind, Coordinates, RoverId, RoverRecord, RoverStatus, SessionId, TaskName,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: SessionId,
}

/// Reply to move, reset and task commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoverStatusReport {
    pub status: RoverStatus,
    #[serde(deserialize_with = "battery_percent")]
    pub battery: u8,
    pub coordinates: Coordinates,
    #[serde(default)]
    pub task: Option<TaskName>,
}

impl RoverStatusReport {
    pub fn into_record(
        self,
        rover_id: RoverId,
        at: chrono::DateTime<chrono::Utc>,
    ) -> RoverRecord {
        RoverRecord {
            rover_id,
            status: self.status,
            battery: self.battery,
            coordinates: self.coordinates,
            task: self.task,
            updated_at: at,
        }
    }
}

impl From<&RoverRecord> for RoverStatusReport {
    fn from(record: &RoverRecord) -> Self {
        Self {
            status: record.status,
            battery: record.battery,
            coordinates: record.coordinates,
            task: record.task.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: f64,
    pub rover_id: RoverId,
    pub soil_moisture: f64,
    #[serde(rename = "soil_pH")]
    pub soil_ph: f64,
    pub temperature: f64,
    #[serde(deserialize_with = "battery_level")]
    pub battery_level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub rover_id: RoverId,
    #[serde(deserialize_with = "battery_level")]
    pub battery_level: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateReading {
    pub rover_id: RoverId,
    pub coordinates: Coordinates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FleetEvent {
    SessionStarted {
        session_id: SessionId,
    },
    SessionExpired {
        session_id: SessionId,
    },
    RoverUpdated {
        session_id: SessionId,
        record: RoverRecord,
    },
    CommandDispatched {
        session_id: SessionId,
        rover_id: RoverId,
        command: CommandKind,
        message: String,
    },
}

impl FleetEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            FleetEvent::SessionStarted { session_id }
            | FleetEvent::SessionExpired { session_id }
            | FleetEvent::RoverUpdated { session_id, .. }
            | FleetEvent::CommandDispatched { session_id, .. } => session_id,
        }
    }
}

fn battery_level<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    if raw.is_nan() {
        return Ok(0.0);
    }
    Ok(raw.clamp(0.0, 100.0))
}

fn battery_percent<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let level = battery_level(deserializer)?;
    Ok(level.round() as u8)
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
