use shared::{
    domain::RoverId,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable{}: {message}", rover_suffix(.rover))]
    Unavailable {
        rover: Option<RoverId>,
        status: Option<u16>,
        message: String,
    },
    #[error("backend timed out{}", rover_suffix(.rover))]
    Timeout { rover: Option<RoverId> },
    #[error("command outcome unknown for {rover}: request was sent but no reply arrived")]
    CommandUncertain { rover: RoverId },
    #[error("malformed backend reply{}: {message}", rover_suffix(.rover))]
    Decode {
        rover: Option<RoverId>,
        message: String,
    },
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

impl BackendError {
    /// Whether an idempotent read may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Timeout { .. } => true,
            BackendError::Unavailable { status: None, .. } => true,
            BackendError::Unavailable {
                status: Some(status),
                ..
            } => *status >= 500,
            BackendError::CommandUncertain { .. }
            | BackendError::Decode { .. }
            | BackendError::InvalidUrl(_) => false,
        }
    }

    pub fn rover(&self) -> Option<&RoverId> {
        match self {
            BackendError::Unavailable { rover, .. }
            | BackendError::Timeout { rover }
            | BackendError::Decode { rover, .. } => rover.as_ref(),
            BackendError::CommandUncertain { rover } => Some(rover),
            BackendError::InvalidUrl(_) => None,
        }
    }
}

fn rover_suffix(rover: &Option<RoverId>) -> String {
    match rover {
        Some(rover) => format!(" for {rover}"),
        None => String::new(),
    }
}

impl From<BackendError> for ApiError {
    fn from(value: BackendError) -> Self {
        let rover = value.rover().cloned();
        let message = value.to_string();
        let error = match &value {
            BackendError::Unavailable { status, .. } => {
                ApiError::new(ErrorCode::BackendUnavailable, message).with_upstream_status(*status)
            }
            BackendError::Timeout { .. } => ApiError::new(ErrorCode::BackendTimeout, message),
            BackendError::CommandUncertain { .. } => {
                ApiError::new(ErrorCode::CommandUncertain, message)
            }
            BackendError::Decode { .. } => ApiError::new(ErrorCode::BackendUnavailable, message),
            BackendError::InvalidUrl(_) => ApiError::new(ErrorCode::Internal, message),
        };
        match rover {
            Some(rover) => error.with_rover(rover),
            None => error,
        }
    }
}
