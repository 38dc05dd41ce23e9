//! Composition root: one registry, one REST client, stores per joined session.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api_client::ApiClient;
use crate::config::ClientConfig;
use crate::storage::CredentialSupplier;
use crate::stores::{Clock, LifecycleNotice, SessionLifecycle, SessionRoster, SharedCart, SystemClock};
use crate::ws::{Connector, SessionRegistry, TungsteniteConnector};

pub struct SessionClient {
    config: ClientConfig,
    credentials: Arc<dyn CredentialSupplier>,
    registry: SessionRegistry,
    clock: Arc<dyn Clock>,
}

impl SessionClient {
    /// Client speaking to the configured servers over real sockets.
    pub fn new(config: ClientConfig, credentials: Arc<dyn CredentialSupplier>) -> Self {
        Self::with_connector(config, credentials, Arc::new(TungsteniteConnector))
    }

    pub fn with_connector(
        config: ClientConfig,
        credentials: Arc<dyn CredentialSupplier>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let registry = SessionRegistry::new(
            config.ws_base_url.clone(),
            connector,
            credentials.clone(),
            config.reconnect.clone(),
        );
        Self {
            config,
            credentials,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wall clock used for archival countdowns.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// REST client carrying the current bearer token, if any.
    pub fn api(&self) -> ApiClient {
        let token = self.credentials.bearer_token().unwrap_or_else(|e| {
            crate::log_warn!("credential lookup failed, continuing anonymously: {}", e);
            None
        });
        ApiClient::new()
            .with_base_url(self.config.api_base_url.clone())
            .with_bearer_token(token)
    }

    /// Attach cart, lifecycle and roster stores to a session. All three share
    /// one connection.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, see [`SessionRegistry::acquire`].
    pub fn join(&self, session_id: &str, participant_id: Option<String>) -> JoinedSession {
        let api = self.api();
        let cart = SharedCart::attach(self.registry.acquire(session_id), api.clone(), participant_id);
        let (lifecycle, notices) = SessionLifecycle::attach(
            self.registry.acquire(session_id),
            api.clone(),
            self.clock.clone(),
            self.config.lifecycle.clone(),
        );
        let roster = SessionRoster::attach(self.registry.acquire(session_id), api);
        crate::log_info!(session = session_id, "joined");

        JoinedSession {
            cart,
            lifecycle,
            roster,
            notices,
        }
    }

    /// Tear down every session connection, e.g. on logout.
    pub fn disconnect_all(&self) {
        self.registry.shutdown_all();
    }
}

/// The stores for one joined session. Dropping it releases the connection.
pub struct JoinedSession {
    pub cart: SharedCart,
    pub lifecycle: SessionLifecycle,
    pub roster: SessionRoster,
    pub notices: mpsc::UnboundedReceiver<LifecycleNotice>,
}

impl JoinedSession {
    pub fn session_id(&self) -> &str {
        self.cart.session_id()
    }

    /// Load the REST baselines for the cart and the roster.
    pub async fn load_baselines(&self) {
        let (cart, roster) = tokio::join!(self.cart.fetch_snapshot(), self.roster.load_baseline());
        if let Err(e) = cart {
            crate::log_warn!(session = self.session_id(), "no cart baseline: {}", e);
        }
        if let Err(e) = roster {
            crate::log_warn!(session = self.session_id(), "no session baseline: {}", e);
        }
    }
}
