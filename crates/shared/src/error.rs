use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::RoverId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidSession,
    MissingField,
    InvalidDirection,
    InvalidTask,
    UnknownRover,
    NoData,
    RoverBusy,
    InsufficientBattery,
    BackendUnavailable,
    BackendTimeout,
    CommandUncertain,
    PartialFailure,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rover: Option<RoverId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            rover: None,
            upstream_status: None,
        }
    }

    pub fn with_rover(mut self, rover: RoverId) -> Self {
        self.rover = Some(rover);
        self
    }

    pub fn with_upstream_status(mut self, status: Option<u16>) -> Self {
        self.upstream_status = status;
        self
    }
}

#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct ApiException {
    pub code: ErrorCode,
    pub message: String,
    pub rover: Option<RoverId>,
}

impl ApiException {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            rover: None,
        }
    }
}

impl From<ApiException> for ApiError {
    fn from(value: ApiException) -> Self {
        Self {
            code: value.code,
            message: value.message,
            rover: value.rover,
            upstream_status: None,
        }
    }
}

impl From<ApiError> for ApiException {
    fn from(value: ApiError) -> Self {
        Self {
            code: value.code,
            message: value.message,
            rover: value.rover,
        }
    }
}
