//! Real-time session connections.
//!
//! This module provides:
//! - One shared connection per session, reference counted across consumers
//! - Auto-reconnect with exponential backoff after unexpected closes
//! - Typed event fan-out to every subscriber, in delivery order
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  SessionRegistry                    │
//! │     (one entry per session id, with a refcount)     │
//! └─────────────────────────────────────────────────────┘
//!                         │
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!   ┌────────────┐ ┌────────────┐ ┌────────────┐
//!   │ Connection │ │ Connection │ │ Connection │
//!   │ (table 4)  │ │ (table 7)  │ │ (table 9)  │
//!   └────────────┘ └────────────┘ └────────────┘
//!          │
//!          ▼
//!   ┌─────────────────────┐
//!   │  Dispatcher         │
//!   │  (cart, lifecycle,  │
//!   │   roster stores)    │
//!   └─────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = SessionRegistry::new(ws_base, Arc::new(TungsteniteConnector), creds, policy);
//! let handle = registry.acquire("4f1c");
//! let _sub = handle.on(EventKind::CartUpdate, |event| println!("{:?}", event));
//! // Dropping the last handle for a session closes its connection.
//! ```

mod connection;
mod dispatcher;
mod manager;
pub mod mock;
mod transport;

pub use connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, ReconnectPolicy, TungsteniteConnector,
};
pub use dispatcher::{Dispatcher, Event, Subscription, SubscriptionId};
pub use manager::{endpoint_url, SessionHandle, SessionRegistry};
pub use transport::{Connector, Frame, Transport, TransportError};
