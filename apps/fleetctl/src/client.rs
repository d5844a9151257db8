use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{Coordinates, SessionId},
    error::{ApiError, ApiException},
    protocol::{CommandAck, StartSessionResponse},
};
use tracing::debug;
use url::Url;

/// Fleet-wide reply. `partial` is set when the gateway answered 207.
#[derive(Debug)]
pub struct FleetReply {
    pub partial: bool,
    pub body: Value,
}

#[derive(Serialize)]
struct CommandBody<'a> {
    session_id: &'a str,
    rover: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    direction: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'a str>,
}

#[derive(Serialize)]
struct CoordinateBody<'a> {
    session_id: &'a str,
    task: &'a str,
    target: Coordinates,
    #[serde(skip_serializing_if = "Option::is_none")]
    crew: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

pub struct GatewayClient {
    http: Client,
    base: Url,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url.trim())
            .with_context(|| format!("invalid gateway url '{base_url}'"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid endpoint '{path}'"))
    }

    pub async fn start_session(&self) -> Result<SessionId> {
        let res = self
            .http
            .post(self.url("api/session/start")?)
            .send()
            .await?;
        let body: StartSessionResponse = decode(res).await?;
        Ok(body.session_id)
    }

    pub async fn fleet_view(
        &self,
        path: &str,
        session_id: &str,
        timeout_ms: Option<u64>,
    ) -> Result<FleetReply> {
        let mut url = self.url(path)?;
        url.query_pairs_mut().append_pair("session_id", session_id);
        if let Some(timeout_ms) = timeout_ms {
            url.query_pairs_mut()
                .append_pair("timeout_ms", &timeout_ms.to_string());
        }
        debug!(%url, "fleet view");
        let res = self.http.get(url).send().await?;
        let partial = res.status() == StatusCode::MULTI_STATUS;
        let body: Value = decode(res).await?;
        Ok(FleetReply { partial, body })
    }

    pub async fn move_rover(&self, session_id: &str, rover: &str, direction: &str) -> Result<CommandAck> {
        self.command(
            "api/rover/move",
            CommandBody {
                session_id,
                rover,
                direction: Some(direction),
                task: None,
            },
        )
        .await
    }

    pub async fn reset_rover(&self, session_id: &str, rover: &str) -> Result<CommandAck> {
        self.command(
            "api/rover/reset",
            CommandBody {
                session_id,
                rover,
                direction: None,
                task: None,
            },
        )
        .await
    }

    pub async fn assign_task(&self, session_id: &str, rover: &str, task: &str) -> Result<CommandAck> {
        self.command(
            "api/rover/task",
            CommandBody {
                session_id,
                rover,
                direction: None,
                task: Some(task),
            },
        )
        .await
    }

    /// Asks the gateway to pick the nearest free rovers for `task` and assign it.
    pub async fn coordinate(
        &self,
        session_id: &str,
        task: &str,
        target: Coordinates,
        crew: Option<usize>,
        timeout_ms: Option<u64>,
    ) -> Result<FleetReply> {
        let body = CoordinateBody {
            session_id,
            task,
            target,
            crew,
            timeout_ms,
        };
        let res = self
            .http
            .post(self.url("api/fleet/coordinate")?)
            .json(&body)
            .send()
            .await?;
        let partial = res.status() == StatusCode::MULTI_STATUS;
        let body: Value = decode(res).await?;
        Ok(FleetReply { partial, body })
    }

    async fn command(&self, path: &str, body: CommandBody<'_>) -> Result<CommandAck> {
        let res = self.http.post(self.url(path)?).json(&body).send().await?;
        decode(res).await
    }
}

/// Decodes a success body, or turns the gateway's error body into an [`ApiException`].
async fn decode<T: DeserializeOwned>(res: Response) -> Result<T> {
    let status = res.status();
    let bytes = res.bytes().await?;
    if status.is_success() {
        return serde_json::from_slice(&bytes)
            .with_context(|| format!("unexpected reply from gateway ({status})"));
    }
    match serde_json::from_slice::<ApiError>(&bytes) {
        Ok(err) => Err(ApiException::from(err).into()),
        Err(_) => anyhow::bail!(
            "gateway returned {status}: {}",
            String::from_utf8_lossy(&bytes)
        ),
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
