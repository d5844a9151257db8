//! Session registry.
//!
//! A session is handed out by the backend and scopes one fleet's worth of
//! rover state. The registry remembers which sessions this gateway started,
//! when they were last used, and which rovers they govern.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use fleet_backend::{BackendError, FleetBackend};
use shared::{
    domain::{RoverId, SessionId},
    error::{ApiError, ErrorCode},
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::profile::{join, required};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub rovers: Arc<[RoverId]>,
}

impl Session {
    /// Resolves a raw rover name against the rovers this session governs.
    pub fn rover(&self, raw: &str) -> Result<RoverId, ApiError> {
        let raw = required(raw, "rover")?;
        self.rovers
            .iter()
            .find(|rover| rover.as_str() == raw)
            .cloned()
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::UnknownRover,
                    format!("unknown rover {raw}. Must be one of: {}", join(&self.rovers[..])),
                )
            })
    }

    fn is_idle_at(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_seen) > idle_timeout
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    backend: Arc<dyn FleetBackend>,
    rovers: Arc<[RoverId]>,
    idle_timeout: chrono::Duration,
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn FleetBackend>, rovers: Vec<RoverId>, idle_timeout: Duration) -> Self {
        Self {
            backend,
            rovers: rovers.into(),
            idle_timeout: chrono::Duration::from_std(idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Asks the backend for a new session and starts tracking it.
    pub async fn start(&self) -> Result<Session, ApiError> {
        let id = self.backend.start_session().await.map_err(|err| {
            warn!(error = %err, "backend refused to start a session");
            let upstream_status = match &err {
                BackendError::Unavailable { status, .. } => *status,
                _ => None,
            };
            ApiError::new(
                ErrorCode::BackendUnavailable,
                format!("failed to start session: {err}"),
            )
            .with_upstream_status(upstream_status)
        })?;
        let session = self.register_at(id, Utc::now()).await;
        info!(session_id = %session.id, rovers = session.rovers.len(), "session started");
        Ok(session)
    }

    pub(crate) async fn register_at(&self, id: SessionId, now: DateTime<Utc>) -> Session {
        let session = Session {
            id: id.clone(),
            created_at: now,
            last_seen: now,
            rovers: self.rovers.clone(),
        };
        self.sessions.write().await.insert(id, session.clone());
        session
    }

    /// Checks that `raw` names a live session and marks it as used.
    pub async fn validate(&self, raw: &str) -> Result<Session, ApiError> {
        self.validate_at(raw, Utc::now()).await
    }

    pub async fn validate_at(&self, raw: &str, now: DateTime<Utc>) -> Result<Session, ApiError> {
        let id = SessionId::new(required(raw, "session_id")?);
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .filter(|session| !session.is_idle_at(now, self.idle_timeout))
            .ok_or_else(|| {
                ApiError::new(
                    ErrorCode::InvalidSession,
                    format!("session {id} is unknown or expired"),
                )
            })?;
        session.last_seen = now;
        Ok(session.clone())
    }

    pub async fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drops sessions that have been idle longer than the timeout.
    pub async fn expire_idle(&self) -> Vec<SessionId> {
        self.expire_idle_at(Utc::now()).await
    }

    pub async fn expire_idle_at(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|session| session.is_idle_at(now, self.idle_timeout))
            .map(|session| session.id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
