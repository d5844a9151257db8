use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Direction, RoverId, SessionId, TaskName},
    protocol::{
        BatteryReading, CommandAck, CoordinateReading, RoverStatusReport, SensorReading,
        StartSessionResponse,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{BackendError, FleetBackend};

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    /// Total attempts for idempotent reads. Commands are always sent once.
    pub read_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fleetbots-production.up.railway.app".into(),
            request_timeout: Duration::from_secs(5),
            read_attempts: 2,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct HttpFleetBackend {
    http: Client,
    base: Url,
    config: BackendConfig,
}

impl HttpFleetBackend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| BackendError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if !matches!(base.scheme(), "http" | "https") || base.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(config.base_url.clone()));
        }
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Unavailable {
                rover: None,
                status: None,
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { http, base, config })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn rover_endpoint(&self, rover: &RoverId, leaf: &str) -> Result<Url, BackendError> {
        self.endpoint(&["api", "rover", rover.as_str(), leaf])
    }

    async fn read<T: DeserializeOwned>(
        &self,
        url: Url,
        session: &SessionId,
        rover: Option<&RoverId>,
    ) -> Result<T, BackendError> {
        let attempts = self.config.read_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.read_once(url.clone(), session, rover).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && err.is_retryable() => {
                    debug!(%url, attempt, error = %err, "backend read failed; retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(%url, attempt, error = %err, "backend read failed");
                    return Err(err);
                }
            }
        }
    }

    async fn read_once<T: DeserializeOwned>(
        &self,
        url: Url,
        session: &SessionId,
        rover: Option<&RoverId>,
    ) -> Result<T, BackendError> {
        let response = self
            .http
            .get(url)
            .query(&[("session_id", session.as_str())])
            .send()
            .await
            .map_err(|e| read_failure(e, rover))?;
        let body = ensure_success(response, rover)
            .await?
            .text()
            .await
            .map_err(|e| read_failure(e, rover))?;
        serde_json::from_str(&body).map_err(|e| BackendError::Decode {
            rover: rover.cloned(),
            message: e.to_string(),
        })
    }

    async fn command(
        &self,
        url: Url,
        query: &[(&str, &str)],
        rover: &RoverId,
    ) -> Result<CommandAck, BackendError> {
        let response = self
            .http
            .post(url)
            .query(query)
            .send()
            .await
            .map_err(|e| command_failure(e, rover))?;
        let body = ensure_success(response, Some(rover))
            .await?
            .text()
            .await
            .map_err(|e| command_failure(e, rover))?;
        // The action already happened at this point; an odd body is not a failure.
        Ok(serde_json::from_str(&body).unwrap_or_else(|_| CommandAck {
            message: body.trim().to_string(),
        }))
    }
}

async fn ensure_success(
    response: Response,
    rover: Option<&RoverId>,
) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response.text().await.unwrap_or_default();
    Err(BackendError::Unavailable {
        rover: rover.cloned(),
        status: Some(status.as_u16()),
        message: if detail.trim().is_empty() {
            format!("backend returned {status}")
        } else {
            format!("backend returned {status}: {}", detail.trim())
        },
    })
}

fn read_failure(err: reqwest::Error, rover: Option<&RoverId>) -> BackendError {
    if err.is_timeout() && !err.is_connect() {
        BackendError::Timeout {
            rover: rover.cloned(),
        }
    } else {
        BackendError::Unavailable {
            rover: rover.cloned(),
            status: None,
            message: err.to_string(),
        }
    }
}

fn command_failure(err: reqwest::Error, rover: &RoverId) -> BackendError {
    // A connect error means the backend never saw the command.
    if err.is_timeout() && !err.is_connect() {
        BackendError::CommandUncertain {
            rover: rover.clone(),
        }
    } else {
        BackendError::Unavailable {
            rover: Some(rover.clone()),
            status: None,
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl FleetBackend for HttpFleetBackend {
    async fn start_session(&self) -> Result<SessionId, BackendError> {
        let url = self.endpoint(&["api", "session", "start"])?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| read_failure(e, None))?;
        let body = ensure_success(response, None)
            .await?
            .text()
            .await
            .map_err(|e| read_failure(e, None))?;
        let started: StartSessionResponse =
            serde_json::from_str(&body).map_err(|e| BackendError::Decode {
                rover: None,
                message: e.to_string(),
            })?;
        Ok(started.session_id)
    }

    async fn fleet_status(
        &self,
        session: &SessionId,
    ) -> Result<HashMap<RoverId, RoverStatusReport>, BackendError> {
        let url = self.endpoint(&["api", "fleet", "status"])?;
        self.read(url, session, None).await
    }

    async fn rover_status(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<RoverStatusReport, BackendError> {
        let url = self.rover_endpoint(rover, "status")?;
        self.read(url, session, Some(rover)).await
    }

    async fn sensor_data(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<SensorReading, BackendError> {
        let url = self.rover_endpoint(rover, "sensor-data")?;
        self.read(url, session, Some(rover)).await
    }

    async fn battery(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<BatteryReading, BackendError> {
        let url = self.rover_endpoint(rover, "battery")?;
        self.read(url, session, Some(rover)).await
    }

    async fn coordinates(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<CoordinateReading, BackendError> {
        let url = self.rover_endpoint(rover, "coordinates")?;
        self.read(url, session, Some(rover)).await
    }

    async fn move_rover(
        &self,
        session: &SessionId,
        rover: &RoverId,
        direction: &Direction,
    ) -> Result<CommandAck, BackendError> {
        let url = self.rover_endpoint(rover, "move")?;
        self.command(
            url,
            &[
                ("session_id", session.as_str()),
                ("direction", direction.as_str()),
            ],
            rover,
        )
        .await
    }

    async fn reset_rover(
        &self,
        session: &SessionId,
        rover: &RoverId,
    ) -> Result<CommandAck, BackendError> {
        let url = self.rover_endpoint(rover, "reset")?;
        self.command(url, &[("session_id", session.as_str())], rover)
            .await
    }

    async fn assign_task(
        &self,
        session: &SessionId,
        rover: &RoverId,
        task: &TaskName,
    ) -> Result<CommandAck, BackendError> {
        let url = self.rover_endpoint(rover, "task")?;
        self.command(
            url,
            &[("session_id", session.as_str()), ("task", task.as_str())],
            rover,
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
