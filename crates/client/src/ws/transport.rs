//! The seam between the connection loop and the actual socket.

use async_trait::async_trait;

/// One inbound frame, after control traffic has been filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection error: {0}")]
    Protocol(String),
}

/// An open duplex connection, read side.
#[async_trait]
pub trait Transport: Send {
    /// Next frame, or `None` once the underlying stream has ended.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Send a close frame and flush. Errors are swallowed: the caller is
    /// tearing the connection down either way.
    async fn close(&mut self);
}

/// Opens transports for endpoint URLs.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}
