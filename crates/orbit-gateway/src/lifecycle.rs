//! Connection lifecycle.
//!
//! ```text
//!  uninitialized ──start()──▶ connecting ──▶ open
//!                                 ▲            │
//!                                 └── closed ◀─┘
//!                                        │
//!                                        ▼
//!                               restart plan → exit
//! ```
//!
//! The controller connects exactly once per process. Every close ends in a
//! [`RestartPlan`]: the supervisor waits out the plan's delay, tears the
//! adapter down and exits, and the orchestrator spawns a fresh process.
//! Reconnecting in-process would leave two sessions for one identity that
//! keep kicking each other off.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, AdapterEvent, ConnectRequest, DisconnectReason, SessionAdapter};
use crate::auth::AuthState;
use crate::config::TimingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

/// How a close is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Credentials were revoked. Wipe them before restarting.
    Logout,
    /// A competing session for the same identity.
    Conflict,
    Transient,
}

impl CloseKind {
    pub fn classify(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::LoggedOut => CloseKind::Logout,
            DisconnectReason::Conflict => CloseKind::Conflict,
            DisconnectReason::ConnectionLost | DisconnectReason::Other => CloseKind::Transient,
        }
    }
}

/// What to do after a close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPlan {
    pub kind: CloseKind,
    /// Wait before tearing down and requesting the restart.
    pub delay: Duration,
    pub clear_credentials: bool,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("session already started in this process")]
    AlreadyStarted,

    #[error("failed to open session: {0}")]
    Connect(#[from] AdapterError),
}

pub struct LifecycleController {
    adapter: Arc<dyn SessionAdapter>,
    timing: TimingConfig,
    state: watch::Sender<ConnectionState>,
    started: bool,
    shutting_down: bool,
    torn_down: bool,
}

impl LifecycleController {
    pub fn new(adapter: Arc<dyn SessionAdapter>, timing: TimingConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            adapter,
            timing,
            state,
            started: false,
            shutting_down: false,
            torn_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follow state changes (the command worker gates on this).
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = prev.as_str(), to = next.as_str(), "Connection state changed");
        }
    }

    /// Open the session. Callable once per process.
    ///
    /// With a phone number (code-based linking), an unregistered record left
    /// by an interrupted attempt is wiped first: linking on top of it fails.
    pub async fn start(
        &mut self,
        auth: &mut AuthState,
        phone: Option<&str>,
    ) -> Result<mpsc::Receiver<AdapterEvent>, LifecycleError> {
        if self.started {
            return Err(LifecycleError::AlreadyStarted);
        }
        self.started = true;

        if phone.is_some() {
            match auth.discard_partial().await {
                Ok(true) => info!("Starting code-based linking from a clean slate"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Failed to wipe partial credentials"),
            }
        }

        self.set_state(ConnectionState::Connecting);
        let request = ConnectRequest {
            credentials: auth.record().cloned(),
            store: auth.store(),
            phone: phone.map(str::to_string),
        };
        info!(
            registered = auth.is_registered(),
            linking_by_code = phone.is_some(),
            "Opening session"
        );

        match self.adapter.connect(request).await {
            Ok(events) => Ok(events),
            Err(e) => {
                self.set_state(ConnectionState::Closed);
                Err(LifecycleError::Connect(e))
            }
        }
    }

    pub fn on_connecting(&self) {
        if self.state() != ConnectionState::Closed {
            self.set_state(ConnectionState::Connecting);
        }
    }

    pub fn on_open(&self) {
        if self.shutting_down {
            return;
        }
        self.set_state(ConnectionState::Open);
    }

    /// Classify a close. `None` while shutting down: a close we caused is
    /// not a failure.
    pub fn on_closed(&mut self, reason: DisconnectReason, detail: Option<&str>) -> Option<RestartPlan> {
        self.set_state(ConnectionState::Closed);
        if self.shutting_down {
            debug!("Session closed during shutdown");
            return None;
        }

        let kind = CloseKind::classify(reason);
        let (delay, reason_text) = match kind {
            CloseKind::Logout => (self.timing.logout_cooldown(), "logged out".to_string()),
            CloseKind::Conflict => (self.timing.conflict_backoff(), "session conflict".to_string()),
            CloseKind::Transient => (
                self.timing.transient_backoff(),
                match detail {
                    Some(detail) => format!("connection closed: {}", detail),
                    None => "connection closed".to_string(),
                },
            ),
        };

        info!(kind = ?kind, delay_ms = delay.as_millis() as u64, "Session closed, restart planned");
        Some(RestartPlan {
            kind,
            delay,
            clear_credentials: kind == CloseKind::Logout,
            reason: reason_text,
        })
    }

    /// Suppress restart handling for the rest of the process.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Unsubscribe every listener and force-close the transport, so the next
    /// process cannot collide with a socket still owned by this one.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.adapter.unsubscribe_all().await;
        if let Err(e) = self.adapter.close().await {
            warn!(error = %e, "Failed to close session transport");
        }
        self.set_state(ConnectionState::Closed);
        debug!("Session torn down");
    }
}
