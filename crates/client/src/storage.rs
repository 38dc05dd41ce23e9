//! Local persistent storage and the credential supplier built on it.
//!
//! Values are JSON files in the platform-appropriate config directory:
//!   - Linux: `~/.config/tableside/`
//!   - macOS: `~/Library/Application Support/tableside/`
//!   - Windows: `%APPDATA%\tableside\`

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

/// Key under which the bearer token is stored.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no config directory available on this platform")]
    NoConfigDir,
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Supplies the bearer token used for the duplex endpoint and REST calls.
///
/// `Ok(None)` means anonymous access. Callers treat `Err` the same way after
/// logging it, since the server permits anonymous reads.
pub trait CredentialSupplier: Send + Sync {
    fn bearer_token(&self) -> Result<Option<String>, StorageError>;
}

/// A fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(Option<String>);

impl StaticCredentials {
    pub fn new(token: Option<impl Into<String>>) -> Self {
        Self(token.map(Into::into))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl CredentialSupplier for StaticCredentials {
    fn bearer_token(&self) -> Result<Option<String>, StorageError> {
        Ok(self.0.clone())
    }
}

/// File-backed key/value store.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    /// Store rooted in the platform config directory.
    pub fn open_default() -> Result<Self, StorageError> {
        let dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
        Ok(Self::at(dir.join("tableside")))
    }

    /// Store rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, key: &str) -> PathBuf {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.dir.join(format!("{}.json", safe_key))
    }

    /// Save a value to persistent storage.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.file_path(key), json)?;
        Ok(())
    }

    /// Load a value from persistent storage. A missing key is `Ok(None)`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match std::fs::read_to_string(self.file_path(key)) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a value from persistent storage.
    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.file_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a key exists in storage.
    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }
}

impl CredentialSupplier for TokenStore {
    fn bearer_token(&self) -> Result<Option<String>, StorageError> {
        self.load::<String>(AUTH_TOKEN_KEY)
    }
}
