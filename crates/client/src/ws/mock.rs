//! # In-memory connector for tests
//!
//! [`MockConnector`] implements [`Connector`] without touching the network.
//! Every accepted connection yields a [`MockPeer`], the "server side" of that
//! connection, through which a test pushes events and ends the connection
//! either cleanly or abruptly.
//!
//! ```rust,ignore
//! let connector = Arc::new(MockConnector::new());
//! let registry = SessionRegistry::new(base_url, connector.clone(), creds, policy);
//! let handle = registry.acquire("s1");
//!
//! let peer = connector.next_peer().await;
//! peer.push(&SessionEvent::CartState(CartSnapshot::default()));
//! peer.fail("connection reset");
//! ```
//!
//! The connector also counts connect attempts (with their tokio timestamps)
//! and tracks how many transports are open at once. It can greet every new
//! connection with a fixed set of events and make the close handshake slow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tableside_shared::{SessionEvent, CLEAN_CLOSE_CODE};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::transport::{Connector, Frame, Transport, TransportError};

/// A recorded call to [`Connector::connect`].
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub url: String,
    pub at: Instant,
    pub accepted: bool,
}

#[derive(Default)]
struct MockState {
    refuse_all: bool,
    refusals: VecDeque<String>,
    attempts: Vec<ConnectAttempt>,
    open: usize,
    max_open: usize,
    greeting: Vec<SessionEvent>,
    close_delay: Duration,
}

pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>,
}

impl MockConnector {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse every connect attempt until switched off again.
    pub fn refuse_all(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    /// Refuse the next connect attempt with `reason`. Calls queue up.
    pub fn refuse_next(&self, reason: impl Into<String>) {
        self.lock().refusals.push_back(reason.into());
    }

    /// Events every accepted connection receives before anything else.
    pub fn greet_with(&self, events: Vec<SessionEvent>) {
        self.lock().greeting = events;
    }

    /// Make each client-initiated close take `delay`.
    pub fn delay_close(&self, delay: Duration) {
        self.lock().close_delay = delay;
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.lock().attempts.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open
    }

    /// Highest number of simultaneously open transports seen so far.
    pub fn max_open_connections(&self) -> usize {
        self.lock().max_open
    }

    /// Wait for the next accepted connection.
    pub async fn next_peer(&self) -> MockPeer {
        self.peers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector owns a sender, so the channel never closes")
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.lock();
        let refusal = if state.refuse_all {
            Some("connection refused".to_string())
        } else {
            state.refusals.pop_front()
        };
        state.attempts.push(ConnectAttempt {
            url: url.to_string(),
            at: Instant::now(),
            accepted: refusal.is_none(),
        });
        if let Some(reason) = refusal {
            return Err(TransportError::Connect(reason));
        }

        state.open += 1;
        state.max_open = state.max_open.max(state.open);
        let greeting = state.greeting.clone();
        let close_delay = state.close_delay;
        drop(state);

        let (tx, rx) = mpsc::unbounded_channel();
        for event in &greeting {
            if let Ok(text) = serde_json::to_string(event) {
                let _ = tx.send(Ok(Frame::Text(text)));
            }
        }
        let closed_by_client = Arc::new(AtomicBool::new(false));
        let peer = MockPeer {
            url: url.to_string(),
            tx,
            closed_by_client: closed_by_client.clone(),
        };
        let _ = self.peers_tx.send(peer);

        Ok(Box::new(MockTransport {
            rx,
            closed_by_client,
            close_delay,
            state: self.state.clone(),
        }))
    }
}

/// Server side of one mock connection.
#[derive(Clone)]
pub struct MockPeer {
    url: String,
    tx: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    closed_by_client: Arc<AtomicBool>,
}

impl MockPeer {
    /// URL the client connected with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push an event frame. Returns `false` once the client side is gone.
    pub fn push(&self, event: &SessionEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(text) => self.push_raw(text),
            Err(_) => false,
        }
    }

    /// Push an arbitrary text frame.
    pub fn push_raw(&self, text: impl Into<String>) -> bool {
        self.tx.send(Ok(Frame::Text(text.into()))).is_ok()
    }

    /// Intended shutdown from the server side.
    pub fn close_clean(&self) -> bool {
        self.tx
            .send(Ok(Frame::Close {
                code: CLEAN_CLOSE_CODE,
                reason: "session closed".to_string(),
            }))
            .is_ok()
    }

    /// Close with an arbitrary code.
    pub fn close_with(&self, code: u16, reason: impl Into<String>) -> bool {
        self.tx
            .send(Ok(Frame::Close {
                code,
                reason: reason.into(),
            }))
            .is_ok()
    }

    /// Abrupt network failure.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send(Err(TransportError::Protocol(reason.into())))
            .is_ok()
    }

    /// Whether the client sent a close frame on this connection.
    pub fn closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    closed_by_client: Arc<AtomicBool>,
    close_delay: Duration,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.closed_by_client.store(true, Ordering::SeqCst);
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.open = state.open.saturating_sub(1);
    }
}
