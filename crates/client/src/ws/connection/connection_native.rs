//! Connection loop and the tokio-tungstenite transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tableside_shared::{SessionEvent, CLEAN_CLOSE_CODE};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{ConnectionEvent, ConnectionState, ReconnectPolicy, UrlBuilder};
use crate::ws::dispatcher::{Dispatcher, SubscriptionId};
use crate::ws::transport::{Connector, Frame, Transport, TransportError};

/// Close code reported when the peer closed without a status.
const NO_STATUS_CODE: u16 = 1005;

/// Upper bound on the close handshake when shutting down.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Most session events kept for late subscribers.
const REPLAY_LIMIT: usize = 256;

/// Production connector over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(TungsteniteTransport { stream }))
    }
}

struct TungsteniteTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(TransportError::Protocol(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (NO_STATUS_CODE, String::new()),
                    };
                    return Some(Ok(Frame::Close { code, reason }));
                }
                Message::Ping(data) => {
                    // Pong is handled automatically by tungstenite
                    crate::log_debug!("Received ping: {:?}", data);
                }
                Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            crate::log_debug!("close handshake failed: {}", e);
        }
    }
}

pub(super) struct LoopContext {
    pub(super) session_id: String,
    pub(super) url_builder: UrlBuilder,
    pub(super) connector: Arc<dyn Connector>,
    pub(super) policy: ReconnectPolicy,
    pub(super) events: Arc<Dispatcher<SessionEvent>>,
    pub(super) status: Arc<Dispatcher<ConnectionEvent>>,
    pub(super) state: Arc<watch::Sender<ConnectionState>>,
}

impl LoopContext {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// How an open connection ended.
enum CloseOutcome {
    Clean,
    Dirty(String),
}

enum Step<T> {
    Shutdown,
    Proceed(T),
}

enum Inbound {
    Frame(Option<Result<Frame, TransportError>>),
    Replay(SubscriptionId),
}

fn is_cart_push(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::CartState(_) | SessionEvent::CartUpdate(_))
}

/// What a subscriber that joins mid-connection still needs: the latest cart
/// push, and every other event since the latest `session_state`. Each entry
/// carries the first subscription id that missed it.
#[derive(Default)]
struct ReplayLog {
    entries: VecDeque<(SubscriptionId, SessionEvent)>,
}

impl ReplayLog {
    fn record(&mut self, missed_from: SubscriptionId, event: &SessionEvent) {
        if is_cart_push(event) {
            self.entries.retain(|(_, kept)| !is_cart_push(kept));
        } else if let SessionEvent::SessionState(_) = event {
            self.entries.retain(|(_, kept)| is_cart_push(kept));
        } else if self.entries.len() >= REPLAY_LIMIT {
            if let Some(oldest) = self.entries.iter().position(|(_, kept)| !is_cart_push(kept)) {
                self.entries.remove(oldest);
            }
        }
        self.entries.push_back((missed_from, event.clone()));
    }

    /// Deliver to `id` whatever it registered too late to see. Returns the
    /// number of events delivered.
    fn replay(&self, events: &Dispatcher<SessionEvent>, id: SubscriptionId) -> usize {
        self.entries
            .iter()
            .filter(|(missed_from, _)| id >= *missed_from)
            .filter(|(_, event)| events.emit_to(id, event))
            .count()
    }
}

/// Start the connection management loop in a background tokio task
pub(super) fn start_connection_loop(
    ctx: LoopContext,
    shutdown: oneshot::Receiver<()>,
    replays: mpsc::UnboundedReceiver<SubscriptionId>,
    predecessor: Option<JoinHandle<()>>,
) -> JoinHandle<()> {
    tokio::spawn(run(ctx, shutdown, replays, predecessor))
}

async fn run(
    ctx: LoopContext,
    mut shutdown: oneshot::Receiver<()>,
    mut replays: mpsc::UnboundedReceiver<SubscriptionId>,
    predecessor: Option<JoinHandle<()>>,
) {
    let session = ctx.session_id.clone();
    let mut attempts = 0u32;

    // Never overlap with the previous socket of this session.
    if let Some(previous) = predecessor {
        crate::log_debug!(session = session, "waiting for the previous connection to close");
        let _ = previous.await;
    }

    loop {
        let url = (ctx.url_builder)();
        if attempts == 0 {
            ctx.set_state(ConnectionState::Connecting);
        } else {
            ctx.set_state(ConnectionState::Reconnecting { attempt: attempts });
        }

        // A dropped sender counts as a shutdown request too.
        let connected = tokio::select! {
            _ = &mut shutdown => Step::Shutdown,
            result = ctx.connector.connect(&url) => Step::Proceed(result),
        };
        let connected = match connected {
            Step::Shutdown => break,
            Step::Proceed(result) => result,
        };

        let outcome = match connected {
            Ok(mut transport) => {
                attempts = 0;
                ctx.set_state(ConnectionState::Open);
                crate::log_info!(session = session, "connection open");
                ctx.status.emit(&ConnectionEvent::Connected);

                let step = tokio::select! {
                    _ = &mut shutdown => Step::Shutdown,
                    outcome = pump(&ctx, transport.as_mut(), &mut replays) => Step::Proceed(outcome),
                };
                match step {
                    Step::Shutdown => {
                        if tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await.is_err() {
                            crate::log_warn!(session = session, "close handshake timed out");
                        }
                        drop(transport);
                        break;
                    }
                    Step::Proceed(outcome) => {
                        let (clean, reason) = match &outcome {
                            CloseOutcome::Clean => (true, "closed by server".to_string()),
                            CloseOutcome::Dirty(reason) => (false, reason.clone()),
                        };
                        crate::log_info!(session = session, "connection closed (clean: {}): {}", clean, reason);
                        ctx.status
                            .emit(&ConnectionEvent::Disconnected { clean, reason });
                        outcome
                    }
                }
            }
            Err(e) => {
                crate::log_warn!(session = session, "connection attempt failed: {}", e);
                CloseOutcome::Dirty(e.to_string())
            }
        };

        if let CloseOutcome::Clean = outcome {
            ctx.set_state(ConnectionState::ClosedClean);
            return;
        }
        ctx.set_state(ConnectionState::ClosedDirty);

        let Some(delay) = ctx.policy.next_delay(attempts) else {
            crate::log_error!(
                session = session,
                "giving up after {} reconnect attempts",
                attempts
            );
            ctx.set_state(ConnectionState::Exhausted);
            return;
        };
        attempts += 1;
        ctx.set_state(ConnectionState::Reconnecting { attempt: attempts });
        crate::log_info!(
            session = session,
            "reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            attempts
        );

        let step = tokio::select! {
            _ = &mut shutdown => Step::Shutdown,
            _ = tokio::time::sleep(delay) => Step::Proceed(()),
        };
        if let Step::Shutdown = step {
            break;
        }
    }

    crate::log_info!(session = session, "connection shut down");
    ctx.set_state(ConnectionState::ClosedClean);
}

/// Read frames until the connection ends, dispatching each parsed event in
/// order. Replay requests from late subscribers are served in between.
async fn pump(
    ctx: &LoopContext,
    transport: &mut dyn Transport,
    replays: &mut mpsc::UnboundedReceiver<SubscriptionId>,
) -> CloseOutcome {
    let mut log = ReplayLog::default();
    loop {
        let inbound = tokio::select! {
            frame = transport.next_frame() => Inbound::Frame(frame),
            Some(id) = replays.recv() => Inbound::Replay(id),
        };
        let frame = match inbound {
            Inbound::Frame(frame) => frame,
            Inbound::Replay(id) => {
                let delivered = log.replay(&ctx.events, id);
                if delivered > 0 {
                    crate::log_debug!(session = ctx.session_id, "replayed {} events to a late subscriber", delivered);
                }
                continue;
            }
        };

        match frame {
            Some(Ok(Frame::Text(text))) => match serde_json::from_str::<SessionEvent>(&text) {
                Ok(event) => {
                    crate::log_debug!(session = ctx.session_id, "received {}", event.kind());
                    let missed_from = ctx.events.emit_marked(&event);
                    log.record(missed_from, &event);
                }
                Err(e) => {
                    crate::log_warn!(session = ctx.session_id, "dropping malformed frame: {}", e);
                }
            },
            Some(Ok(Frame::Close { code, reason })) => {
                return if code == CLEAN_CLOSE_CODE {
                    CloseOutcome::Clean
                } else {
                    CloseOutcome::Dirty(format!("close code {}: {}", code, reason))
                };
            }
            Some(Err(e)) => return CloseOutcome::Dirty(e.to_string()),
            None => return CloseOutcome::Dirty("stream ended without a close frame".to_string()),
        }
    }
}
