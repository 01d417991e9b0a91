//! Connection state machine for one configured server.
//!
//! The handle is created lazily on first reference and kept for the whole
//! session, so a disconnected server keeps its last error and activity
//! history. State is published through a watch channel: callers that join a
//! connect attempt in flight subscribe and adopt the attempt's outcome.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::{error::BrokerError, transport::ToolTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    /// True outside the transitional `Connecting`/`Disconnecting` states.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ConnectionState::Connecting | ConnectionState::Disconnecting)
    }
}

pub struct ServerHandle {
    name: String,
    state_tx: watch::Sender<ConnectionState>,
    transport: Mutex<Option<Arc<dyn ToolTransport>>>,
    last_error: Mutex<Option<BrokerError>>,
    last_activity: Mutex<Option<(Instant, DateTime<Utc>)>>,
    /// Serializes state transitions; held across a whole connect or
    /// disconnect attempt.
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl ServerHandle {
    pub fn new(name: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name: name.into(),
            state_tx,
            transport: Mutex::new(None),
            last_error: Mutex::new(None),
            last_activity: Mutex::new(None),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Wait until the state machine leaves `Connecting`/`Disconnecting`.
    pub async fn wait_settled(&self) -> ConnectionState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_settled() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    pub fn transport(&self) -> Option<Arc<dyn ToolTransport>> {
        self.transport.lock().clone()
    }

    pub(crate) fn install_transport(&self, transport: Arc<dyn ToolTransport>) {
        *self.transport.lock() = Some(transport);
    }

    pub(crate) fn take_transport(&self) -> Option<Arc<dyn ToolTransport>> {
        self.transport.lock().take()
    }

    pub fn last_error(&self) -> Option<BrokerError> {
        self.last_error.lock().clone()
    }

    pub(crate) fn set_last_error(&self, error: Option<BrokerError>) {
        *self.last_error.lock() = error;
    }

    /// Record activity now, for idle accounting and `list()`.
    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Some((Instant::now(), Utc::now()));
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity.lock().as_ref().map(|(_, at)| *at)
    }

    pub fn idle_for(&self) -> Option<Duration> {
        self.last_activity
            .lock()
            .as_ref()
            .map(|(instant, _)| instant.elapsed())
    }

    pub(crate) fn gate(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.gate)
    }
}
