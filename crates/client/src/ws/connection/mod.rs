//! Session connection with state management and auto-reconnect.
//!
//! This module provides the shared types; the connection loop itself lives in
//! `connection_native`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tableside_shared::SessionEvent;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::dispatcher::{Dispatcher, Event, SubscriptionId};
use super::transport::Connector;

mod connection_native;

pub use connection_native::TungsteniteConnector;

/// Connection state for a session's duplex connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Closed on purpose, by us or by the server. No retry.
    ClosedClean,
    /// Closed unexpectedly. A reconnect may follow.
    ClosedDirty,
    /// Waiting out the backoff before retry number `attempt`.
    Reconnecting { attempt: u32 },
    /// Gave up after the configured number of retries.
    Exhausted,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }

    /// No further transitions will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::ClosedClean | ConnectionState::Exhausted)
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Maximum number of reconnect attempts after a connection drops
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based):
    /// `min(initial * multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .checked_pow(attempt)
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay to wait after `attempts` failed reconnects, or `None` once retrying should stop.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if !self.enabled || attempts >= self.max_attempts {
            None
        } else {
            Some(self.delay_for_attempt(attempts))
        }
    }
}

/// Connected / disconnected notifications, broadcast to every holder of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { clean: bool, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
}

impl Event for ConnectionEvent {
    type Kind = ConnectionEventKind;

    fn kind(&self) -> ConnectionEventKind {
        match self {
            ConnectionEvent::Connected => ConnectionEventKind::Connected,
            ConnectionEvent::Disconnected { .. } => ConnectionEventKind::Disconnected,
        }
    }
}

/// Builds the endpoint URL for each connect attempt, so a refreshed token is
/// picked up on reconnect.
pub(crate) type UrlBuilder = Arc<dyn Fn() -> String + Send + Sync>;

/// One live connection for one session, shared by every handle to it.
pub(crate) struct SessionConnection {
    session_id: String,
    pub(crate) events: Arc<Dispatcher<SessionEvent>>,
    pub(crate) status: Arc<Dispatcher<ConnectionEvent>>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    replays: mpsc::UnboundedSender<SubscriptionId>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionConnection {
    /// Spawn the connection loop. It first waits for `predecessor`, the loop
    /// of an earlier connection to the same session that is still closing.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub(crate) fn open(
        session_id: String,
        url_builder: UrlBuilder,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        predecessor: Option<JoinHandle<()>>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (replays_tx, replays_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let connection = Arc::new(Self {
            session_id: session_id.clone(),
            events: Dispatcher::new(),
            status: Dispatcher::new(),
            state: Arc::new(state),
            shutdown: Mutex::new(Some(shutdown_tx)),
            replays: replays_tx,
            task: Mutex::new(None),
        });

        let task = connection_native::start_connection_loop(
            connection_native::LoopContext {
                session_id,
                url_builder,
                connector,
                policy,
                events: connection.events.clone(),
                status: connection.status.clone(),
                state: connection.state.clone(),
            },
            shutdown_rx,
            replays_rx,
            predecessor,
        );
        *connection.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        connection
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Ask the loop to hand the current connection's session and cart
    /// snapshots to a subscription that registered after they arrived.
    pub(crate) fn request_replay(&self, id: SubscriptionId) {
        // The loop is gone once the connection is shut down; nothing to replay.
        let _ = self.replays.send(id);
    }

    /// The loop task, for waiting until the socket is really closed.
    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Stop the loop (cancelling any pending backoff) and detach every listener.
    pub(crate) fn shutdown(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
        self.events.clear();
        self.status.clear();
    }
}
