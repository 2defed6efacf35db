//! Remote command bridge
//!
//! Process-wide directory from station ID to the live session serving it.
//! This is the seam the control plane calls through: `deliver` addresses a
//! connected station by ID, forwards a CSMS-initiated CALL into its session
//! and waits (bounded) for the station's answer. Registration, supersession
//! and lookup are atomic under one lock; exactly one live session per station
//! ID at a time.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::correlation::CallOutcome;

/// Commands a session accepts from the outside.
#[derive(Debug)]
pub enum SessionCommand {
    /// Forward a CSMS-initiated CALL and complete `reply` with the outcome.
    /// `timeout` is the caller's delivery deadline, so the session's own
    /// sweep retires the pending call in step with the waiting caller.
    Deliver {
        action: String,
        payload: Value,
        timeout: Duration,
        reply: oneshot::Sender<CallOutcome>,
    },
    /// A newer connection took over this station ID; terminate.
    Shutdown,
}

/// Address of one live session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(session_id: Uuid, commands: mpsc::Sender<SessionCommand>) -> Self {
        Self {
            session_id,
            commands,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

/// Why a delivery did not produce a station response.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("station {0} is not connected")]
    NotConnected(String),

    #[error("delivery to station {0} timed out")]
    Timeout(String),

    #[error("session for station {0} closed before answering")]
    SessionClosed(String),

    #[error("station answered with {code}: {description}")]
    Rejected { code: String, description: String },
}

/// The process-wide station-ID to session directory.
pub struct CommandBridge {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl CommandBridge {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session, superseding any prior one for the same station.
    /// The superseded session is told to shut down.
    pub fn register(&self, station_id: &str, handle: SessionHandle) {
        let previous = self.sessions.write().insert(station_id.to_string(), handle);
        if let Some(previous) = previous {
            warn!(station = %station_id, "new connection supersedes a live session");
            let _ = previous.commands.try_send(SessionCommand::Shutdown);
        }
    }

    /// Remove a session, but only if it is still the registered one for this
    /// station: a superseded session must not evict its successor.
    pub fn deregister(&self, station_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(station_id) {
            Some(current) if current.session_id == session_id => {
                sessions.remove(station_id);
                debug!(station = %station_id, "session deregistered");
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, station_id: &str) -> Option<SessionHandle> {
        self.sessions.read().get(station_id).cloned()
    }

    pub fn connected(&self) -> usize {
        self.sessions.read().len()
    }

    /// Deliver a CSMS-initiated command to a connected station and wait for
    /// its answer, bounded by `wait`.
    ///
    /// Never blocks the target session's receive loop: the command is queued
    /// with `try_send` and a full queue is a clean failure, not back-pressure.
    /// No session is created as a side effect of addressing an absent station.
    pub async fn deliver(
        &self,
        station_id: &str,
        action: &str,
        payload: Value,
        wait: Duration,
    ) -> Result<Value, DeliveryError> {
        let handle = self
            .lookup(station_id)
            .ok_or_else(|| DeliveryError::NotConnected(station_id.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .commands
            .try_send(SessionCommand::Deliver {
                action: action.to_string(),
                payload,
                timeout: wait,
                reply: reply_tx,
            })
            .map_err(|_| DeliveryError::NotConnected(station_id.to_string()))?;

        match timeout(wait, reply_rx).await {
            Err(_) => Err(DeliveryError::Timeout(station_id.to_string())),
            Ok(Err(_)) => Err(DeliveryError::SessionClosed(station_id.to_string())),
            Ok(Ok(CallOutcome::Result(value))) => Ok(value),
            Ok(Ok(CallOutcome::Error {
                code, description, ..
            })) => Err(DeliveryError::Rejected {
                code: code.to_string(),
                description,
            }),
            Ok(Ok(CallOutcome::Timeout)) => Err(DeliveryError::Timeout(station_id.to_string())),
            Ok(Ok(CallOutcome::Cancelled)) => {
                Err(DeliveryError::SessionClosed(station_id.to_string()))
            }
        }
    }
}

impl Default for CommandBridge {
    fn default() -> Self {
        Self::new()
    }
}
