use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! name_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_newtype!(SessionId);
name_newtype!(RoverId);
name_newtype!(Direction);
name_newtype!(TaskName);

/// Grid position reported by the backend as `[x, y]`.
pub type Coordinates = [i64; 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoverStatus {
    #[default]
    Idle,
    Moving,
    #[serde(other)]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    Move { direction: Direction },
    Reset,
    AssignTask { task: TaskName },
}

impl CommandKind {
    pub fn label(&self) -> &'static str {
        match self {
            CommandKind::Move { .. } => "move",
            CommandKind::Reset => "reset",
            CommandKind::AssignTask { .. } => "assign_task",
        }
    }
}

/// Last known state of one rover inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoverRecord {
    pub rover_id: RoverId,
    pub status: RoverStatus,
    /// Percentage in `0..=100`.
    pub battery: u8,
    pub coordinates: Coordinates,
    pub task: Option<TaskName>,
    pub updated_at: DateTime<Utc>,
}

impl RoverRecord {
    /// A rover nobody has reported on yet: idle at the origin with a full battery.
    pub fn idle(rover_id: RoverId, at: DateTime<Utc>) -> Self {
        Self {
            rover_id,
            status: RoverStatus::Idle,
            battery: 100,
            coordinates: [0, 0],
            task: None,
            updated_at: at,
        }
    }

    /// Applies the state transition a successful command implies.
    pub fn apply(mut self, kind: &CommandKind, at: DateTime<Utc>) -> Self {
        match kind {
            CommandKind::Move { .. } => {
                self.status = RoverStatus::Moving;
            }
            CommandKind::Reset => {
                self.status = RoverStatus::Idle;
                self.task = None;
            }
            CommandKind::AssignTask { task } => {
                self.task = Some(task.clone());
            }
        }
        self.updated_at = at;
        self
    }
}
