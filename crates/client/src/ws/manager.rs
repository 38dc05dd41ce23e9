//! Session connection registry: one live connection per session, shared by
//! every consumer in the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tableside_shared::{session_socket_path, EventKind, SessionEvent, TOKEN_QUERY_PARAM};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use super::connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, ReconnectPolicy, SessionConnection,
    UrlBuilder,
};
use super::dispatcher::Subscription;
use super::transport::Connector;
use crate::storage::CredentialSupplier;

/// Build the duplex endpoint URL for a session:
/// `<base>/session/<id>/` plus `?token=<token>` when one is available.
pub fn endpoint_url(base: &Url, session_id: &str, token: Option<&str>) -> String {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }

    let mut url = match base.join(&session_socket_path(session_id)) {
        Ok(url) => url,
        Err(_) => base,
    };
    url.set_query(None);
    if let Some(token) = token {
        url.query_pairs_mut().append_pair(TOKEN_QUERY_PARAM, token);
    }
    url.to_string()
}

struct Entry {
    connection: Arc<SessionConnection>,
    refs: usize,
}

#[derive(Default)]
struct Sessions {
    live: HashMap<String, Entry>,
    /// Loops of released connections that may still be closing their socket.
    closing: HashMap<String, JoinHandle<()>>,
}

impl Sessions {
    fn retire(&mut self, session_id: &str, connection: &SessionConnection) {
        connection.shutdown();
        self.closing.retain(|_, task| !task.is_finished());
        if let Some(task) = connection.take_task() {
            self.closing.insert(session_id.to_string(), task);
        }
    }
}

struct RegistryInner {
    sessions: Mutex<Sessions>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSupplier>,
    ws_base: Url,
    policy: ReconnectPolicy,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, connection: &Arc<SessionConnection>) {
        let session_id = connection.session_id();
        let mut sessions = self.lock();
        let Some(entry) = sessions.live.get_mut(session_id) else {
            return;
        };
        // A handle that outlived `shutdown_all` must not touch a newer entry.
        if !Arc::ptr_eq(&entry.connection, connection) {
            return;
        }
        entry.refs -= 1;
        if entry.refs > 0 {
            crate::log_debug!(session = session_id, "handle released, {} remaining", entry.refs);
            return;
        }

        // Retired under the lock, so a concurrent acquire sees the closing loop.
        if let Some(entry) = sessions.live.remove(session_id) {
            sessions.retire(session_id, &entry.connection);
            crate::log_info!(session = session_id, "last handle released, connection torn down");
        }
    }

    fn shutdown_all(&self) {
        let mut sessions = self.lock();
        let drained: Vec<(String, Entry)> = sessions.live.drain().collect();
        for (session_id, entry) in drained {
            sessions.retire(&session_id, &entry.connection);
            crate::log_info!(session = session_id, "connection torn down");
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

/// Owns at most one live connection per session identifier.
///
/// Cloning shares the same registry. Dropping the last clone tears down every
/// connection it still holds.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        ws_base: Url,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSupplier>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(Sessions::default()),
                connector,
                credentials,
                ws_base,
                policy,
            }),
        }
    }

    /// Get a handle to the session's connection, opening it if this is the first.
    ///
    /// The token is read from the credential supplier on every connect
    /// attempt; a failing lookup connects anonymously. If an earlier
    /// connection to the session is still closing, the new one waits for it.
    ///
    /// # Panics
    ///
    /// Opening a connection spawns its loop, so this panics when called
    /// outside a tokio runtime.
    pub fn acquire(&self, session_id: &str) -> SessionHandle {
        let mut sessions = self.inner.lock();
        let connection = match sessions.live.get_mut(session_id) {
            Some(entry) => {
                entry.refs += 1;
                crate::log_debug!(session = session_id, "reusing connection, {} handles", entry.refs);
                entry.connection.clone()
            }
            None => {
                crate::log_info!(session = session_id, "opening connection");
                let predecessor = sessions.closing.remove(session_id);
                let connection = SessionConnection::open(
                    session_id.to_string(),
                    self.url_builder(session_id),
                    self.inner.connector.clone(),
                    self.inner.policy.clone(),
                    predecessor,
                );
                sessions.live.insert(
                    session_id.to_string(),
                    Entry {
                        connection: connection.clone(),
                        refs: 1,
                    },
                );
                connection
            }
        };

        SessionHandle {
            connection,
            registry: Arc::downgrade(&self.inner),
        }
    }

    fn url_builder(&self, session_id: &str) -> UrlBuilder {
        let credentials = self.inner.credentials.clone();
        let base = self.inner.ws_base.clone();
        let id = session_id.to_string();
        Arc::new(move || {
            let token = credentials.bearer_token().unwrap_or_else(|e| {
                crate::log_warn!(session = id, "credential lookup failed, connecting anonymously: {}", e);
                None
            });
            endpoint_url(&base, &id, token.as_deref())
        })
    }

    /// Give a handle back. Equivalent to dropping it.
    pub fn release(&self, handle: SessionHandle) {
        drop(handle);
    }

    /// Number of live handles for a session (0 when not connected).
    pub fn ref_count(&self, session_id: &str) -> usize {
        self.inner.lock().live.get(session_id).map_or(0, |entry| entry.refs)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.inner.lock().live.keys().cloned().collect()
    }

    /// Tear down every connection, e.g. on logout. Outstanding handles become inert.
    pub fn shutdown_all(&self) {
        self.inner.shutdown_all();
    }
}

/// A reference to one session's shared connection.
///
/// Not `Clone`: each holder counts once. Dropping the handle releases it; the
/// connection closes when the last handle goes.
pub struct SessionHandle {
    connection: Arc<SessionConnection>,
    registry: Weak<RegistryInner>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        self.connection.session_id()
    }

    /// Subscribe to one kind of inbound event.
    ///
    /// A subscriber that joins an open connection is first brought up to
    /// date: it receives the latest cart push and the events since the latest
    /// `session_state`, in their original order, before anything newer.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let subscription = self.connection.events.on(kind, handler);
        self.connection.request_replay(subscription.id());
        subscription
    }

    /// Subscribe to every inbound event. Late subscribers catch up as with
    /// [`on`](Self::on).
    pub fn on_any(&self, handler: impl Fn(&SessionEvent) + Send + Sync + 'static) -> Subscription {
        let subscription = self.connection.events.on_any(handler);
        self.connection.request_replay(subscription.id());
        subscription
    }

    /// Called each time the connection opens, including after a reconnect.
    pub fn on_connect(&self, handler: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.connection
            .status
            .on(ConnectionEventKind::Connected, move |_| handler())
    }

    /// Called once each time an open connection closes.
    pub fn on_disconnect(
        &self,
        handler: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.connection
            .status
            .on(ConnectionEventKind::Disconnected, handler)
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Handles currently sharing this connection, this one included.
    pub fn ref_count(&self) -> usize {
        self.registry
            .upgrade()
            .map_or(0, |registry| {
                registry
                    .lock()
                    .live
                    .get(self.session_id())
                    .filter(|entry| Arc::ptr_eq(&entry.connection, &self.connection))
                    .map_or(0, |entry| entry.refs)
            })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.connection);
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StaticCredentials, StorageError};
    use crate::ws::mock::MockConnector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tableside_shared::{CartSnapshot, LockChange, SessionCompleted};
    use tokio::sync::mpsc;

    struct BrokenCredentials;

    impl CredentialSupplier for BrokenCredentials {
        fn bearer_token(&self) -> Result<Option<String>, StorageError> {
            Err(StorageError::NoConfigDir)
        }
    }

    fn base() -> Url {
        Url::parse("ws://tables.test/ws").unwrap()
    }

    fn registry_with(
        connector: Arc<MockConnector>,
        credentials: Arc<dyn CredentialSupplier>,
    ) -> SessionRegistry {
        SessionRegistry::new(base(), connector, credentials, ReconnectPolicy::default())
    }

    fn registry(connector: Arc<MockConnector>) -> SessionRegistry {
        registry_with(connector, Arc::new(StaticCredentials::new(Some("t0k"))))
    }

    async fn wait_for(handle: &SessionHandle, wanted: ConnectionState) {
        let mut rx = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    #[test]
    fn endpoint_url_appends_session_and_token() {
        assert_eq!(
            endpoint_url(&base(), "abc", Some("a b")),
            "ws://tables.test/ws/session/abc/?token=a+b"
        );
        assert_eq!(
            endpoint_url(&Url::parse("wss://x.io/").unwrap(), "s 1", None),
            "wss://x.io/session/s%201/"
        );
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_connection() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());

        let first = registry.acquire("s1");
        let second = registry.acquire("s1");
        let third = registry.acquire("s1");
        let _peer = connector.next_peer().await;
        wait_for(&first, ConnectionState::Open).await;

        assert_eq!(registry.ref_count("s1"), 3);
        assert_eq!(second.ref_count(), 3);

        registry.release(first);
        registry.release(second);
        assert_eq!(registry.ref_count("s1"), 1);
        assert_eq!(connector.open_connections(), 1);

        let mut state = third.watch_state();
        registry.release(third);
        assert_eq!(registry.ref_count("s1"), 0);
        assert!(registry.active_sessions().is_empty());

        state
            .wait_for(|s| *s == ConnectionState::ClosedClean)
            .await
            .unwrap();
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(connector.max_open_connections(), 1);
        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn release_sends_a_close_frame() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());

        let handle = registry.acquire("s1");
        let peer = connector.next_peer().await;
        wait_for(&handle, ConnectionState::Open).await;

        let mut state = handle.watch_state();
        drop(handle);
        state
            .wait_for(|s| *s == ConnectionState::ClosedClean)
            .await
            .unwrap();
        assert!(peer.closed_by_client());
    }

    #[tokio::test]
    async fn reacquire_after_teardown_opens_a_fresh_connection() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());

        let handle = registry.acquire("s1");
        let _first = connector.next_peer().await;
        let mut state = handle.watch_state();
        drop(handle);
        state
            .wait_for(|s| *s == ConnectionState::ClosedClean)
            .await
            .unwrap();

        let again = registry.acquire("s1");
        let _second = connector.next_peer().await;
        wait_for(&again, ConnectionState::Open).await;
        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(connector.max_open_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reacquire_while_closing_waits_for_the_old_socket() {
        let connector = Arc::new(MockConnector::new());
        connector.delay_close(Duration::from_millis(200));
        let registry = registry(connector.clone());

        let handle = registry.acquire("s1");
        let first = connector.next_peer().await;
        wait_for(&handle, ConnectionState::Open).await;
        drop(handle);

        let again = registry.acquire("s1");
        let _second = connector.next_peer().await;
        wait_for(&again, ConnectionState::Open).await;

        assert!(first.closed_by_client());
        assert_eq!(connector.max_open_connections(), 1);
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].at - attempts[0].at >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn late_subscriber_catches_up_on_an_open_connection() {
        let connector = Arc::new(MockConnector::new());
        let snapshot = SessionEvent::CartState(CartSnapshot {
            items_count: 3,
            ..Default::default()
        });
        connector.greet_with(vec![snapshot.clone()]);
        let registry = registry(connector.clone());

        let early = registry.acquire("s1");
        let (tx, mut early_rx) = mpsc::unbounded_channel();
        let _early_sub = early.on_any(move |event| {
            let _ = tx.send(event.clone());
        });
        let peer = connector.next_peer().await;
        assert_eq!(early_rx.recv().await, Some(snapshot.clone()));

        // The greeting has already been dispatched when this one subscribes.
        let late = registry.acquire("s1");
        let (tx, mut late_rx) = mpsc::unbounded_channel();
        let _late_sub = late.on(EventKind::CartState, move |event| {
            let _ = tx.send(event.clone());
        });
        assert_eq!(late_rx.recv().await, Some(snapshot));

        peer.close_clean();
        wait_for(&late, ConnectionState::ClosedClean).await;
        assert!(early_rx.try_recv().is_err(), "no duplicate for the early subscriber");
        assert!(late_rx.try_recv().is_err(), "no duplicate for the late subscriber");
    }

    #[tokio::test]
    async fn token_goes_into_the_query_string() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());

        let _handle = registry.acquire("abc");
        let peer = connector.next_peer().await;
        assert_eq!(peer.url(), "ws://tables.test/ws/session/abc/?token=t0k");
    }

    #[tokio::test]
    async fn failing_credentials_connect_anonymously() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry_with(connector.clone(), Arc::new(BrokenCredentials));

        let _handle = registry.acquire("abc");
        let peer = connector.next_peer().await;
        assert_eq!(peer.url(), "ws://tables.test/ws/session/abc/");
    }

    #[tokio::test]
    async fn every_subscriber_sees_events_in_delivery_order() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());

        let a = registry.acquire("s1");
        let b = registry.acquire("s1");
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let log = seen_a.clone();
        let _sub_a = a.on_any(move |event| log.lock().unwrap().push(event.kind()));
        let log = seen_b.clone();
        let _sub_b = b.on_any(move |event| log.lock().unwrap().push(event.kind()));

        let peer = connector.next_peer().await;
        peer.push(&SessionEvent::SessionLocked(LockChange::default()));
        peer.push(&SessionEvent::SessionUnlocked(LockChange::default()));
        peer.push(&SessionEvent::SessionCompleted(SessionCompleted::default()));
        // A close-and-wait acts as a barrier behind the pushed frames.
        peer.close_clean();
        wait_for(&a, ConnectionState::ClosedClean).await;

        let expected = vec![
            EventKind::SessionLocked,
            EventKind::SessionUnlocked,
            EventKind::SessionCompleted,
        ];
        assert_eq!(*seen_a.lock().unwrap(), expected);
        assert_eq!(*seen_b.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_closing() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());
        let handle = registry.acquire("s1");

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = handle.on(EventKind::SessionLocked, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let peer = connector.next_peer().await;
        peer.push_raw("{not json");
        peer.push_raw(r#"{"type":"mystery","data":{}}"#);
        peer.push(&SessionEvent::SessionLocked(LockChange::default()));
        peer.close_clean();
        wait_for(&handle, ConnectionState::ClosedClean).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abrupt_close_notifies_each_subscriber_once() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());

        let a = registry.acquire("s1");
        let b = registry.acquire("s1");
        let drops_a = Arc::new(AtomicUsize::new(0));
        let drops_b = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));

        let d = drops_a.clone();
        let _da = a.on_disconnect(move |event| {
            assert!(matches!(event, ConnectionEvent::Disconnected { clean: false, .. }));
            d.fetch_add(1, Ordering::SeqCst);
        });
        let d = drops_b.clone();
        let _db = b.on_disconnect(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let c = connects.clone();
        let _cb = b.on_connect(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let peer = connector.next_peer().await;
        wait_for(&a, ConnectionState::Open).await;
        peer.fail("connection reset by peer");

        // The reconnect succeeds after the first backoff.
        let _second = connector.next_peer().await;
        wait_for(&b, ConnectionState::Open).await;

        assert_eq!(drops_a.load(Ordering::SeqCst), 1);
        assert_eq!(drops_b.load(Ordering::SeqCst), 1);
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].at - attempts[0].at, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_stops_after_five_retries() {
        let connector = Arc::new(MockConnector::new());
        connector.refuse_all(true);
        let registry = registry(connector.clone());

        let handle = registry.acquire("s1");
        wait_for(&handle, ConnectionState::Exhausted).await;

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 6, "initial attempt plus five retries");
        let gaps: Vec<u128> = attempts
            .windows(2)
            .map(|pair| (pair[1].at - pair[0].at).as_millis())
            .collect();
        assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 16000]);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts().len(), 6);
        assert!(handle.state().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_the_attempt_counter() {
        let connector = Arc::new(MockConnector::new());
        connector.refuse_next("boom");
        connector.refuse_next("boom");
        let registry = registry(connector.clone());

        let handle = registry.acquire("s1");
        let peer = connector.next_peer().await;
        wait_for(&handle, ConnectionState::Open).await;
        peer.fail("reset");
        let _peer = connector.next_peer().await;

        let attempts = connector.attempts();
        let gaps: Vec<u128> = attempts
            .windows(2)
            .map(|pair| (pair[1].at - pair[0].at).as_millis())
            .collect();
        // Two refusals back off 1s then 2s; after the open, the next drop starts at 1s again.
        assert_eq!(gaps, vec![1000, 2000, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_server_close_does_not_reconnect() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());

        let handle = registry.acquire("s1");
        let peer = connector.next_peer().await;
        wait_for(&handle, ConnectionState::Open).await;
        peer.close_clean();
        wait_for(&handle, ConnectionState::ClosedClean).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_cancels_a_pending_reconnect() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());

        let handle = registry.acquire("s1");
        let peer = connector.next_peer().await;
        wait_for(&handle, ConnectionState::Open).await;
        peer.close_with(1011, "server error");
        wait_for(&handle, ConnectionState::Reconnecting { attempt: 1 }).await;

        let mut state = handle.watch_state();
        drop(handle);
        state
            .wait_for(|s| *s == ConnectionState::ClosedClean)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn teardown_detaches_listeners() {
        let connector = Arc::new(MockConnector::new());
        let registry = registry(connector.clone());

        let handle = registry.acquire("s1");
        let _peer = connector.next_peer().await;
        handle.on(EventKind::CartState, |_| {}).keep();
        let events = handle.connection.events.clone();
        assert_eq!(events.len(), 1);

        drop(handle);
        assert!(events.is_empty());
    }
}
