//! Tableside Client - collaborative table session sync layer
//!
//! This crate keeps several people at one restaurant table in sync: a shared
//! connection per session, the shared cart, the session lifecycle with its
//! archival countdown, and the participant/order roster.

#[macro_use]
pub mod logging;

pub mod api_client;
pub mod client;
pub mod config;
pub mod storage;
pub mod stores;
pub mod ws;

pub use api_client::ApiClient;
pub use client::{JoinedSession, SessionClient};
pub use config::{ClientConfig, ConfigError, LifecycleOptions};
pub use storage::{CredentialSupplier, StaticCredentials, StorageError, TokenStore};
