//! Logging macros for the sync layer.
//!
//! Everything forwards to `tracing`. The `session = <id>,` prefix form attaches
//! the session identifier as a structured field so a single table can be
//! filtered out of busy logs.

#[doc(hidden)]
pub use tracing as __tracing;

/// Install the global `tracing` subscriber, honouring `RUST_LOG` and falling
/// back to `default_filter`.
pub fn init(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A second init (tests, embedding apps) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    (session = $session:expr, $($arg:tt)*) => {
        $crate::logging::__tracing::info!(session = %$session, "{}", format!($($arg)*))
    };
    ($($arg:tt)*) => {
        $crate::logging::__tracing::info!("{}", format!($($arg)*))
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    (session = $session:expr, $($arg:tt)*) => {
        $crate::logging::__tracing::error!(session = %$session, "{}", format!($($arg)*))
    };
    ($($arg:tt)*) => {
        $crate::logging::__tracing::error!("{}", format!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    (session = $session:expr, $($arg:tt)*) => {
        $crate::logging::__tracing::warn!(session = %$session, "{}", format!($($arg)*))
    };
    ($($arg:tt)*) => {
        $crate::logging::__tracing::warn!("{}", format!($($arg)*))
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    (session = $session:expr, $($arg:tt)*) => {
        $crate::logging::__tracing::debug!(session = %$session, "{}", format!($($arg)*))
    };
    ($($arg:tt)*) => {
        $crate::logging::__tracing::debug!("{}", format!($($arg)*))
    };
}
