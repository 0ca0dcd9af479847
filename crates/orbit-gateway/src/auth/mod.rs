//! Credential persistence.
//!
//! The session library needs two kinds of state to resume without relinking:
//!
//! - a single **credential record** (identity keys, registration status)
//! - many small **keys** addressed by category + id (pre-keys, sessions,
//!   sender keys, app-state keys), rotated constantly while connected
//!
//! Both live behind the [`AuthStore`] contract. Two backends implement it:
//! [`FileAuthStore`] (one JSON file per object in a local directory) and
//! [`RemoteAuthStore`] (one object per key in a remote bucket). The backend is
//! chosen once, in [`build_store`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use orbit_gateway_protocol::AccountInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AuthBackend, AuthConfig};

pub mod file;
pub mod remote;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use file::FileAuthStore;
pub use remote::RemoteAuthStore;
pub use state::AuthState;

/// Object name of the credential record.
pub const CREDS_OBJECT: &str = "creds.json";

// ============================================================================
// Types
// ============================================================================

/// Opaque credential material plus the few fields the gateway inspects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Whether linking completed for this record.
    #[serde(default)]
    pub registered: bool,
    /// The paired account, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<AccountInfo>,
    /// Library-owned key material. Never interpreted by the gateway.
    #[serde(default)]
    pub creds: serde_json::Value,
}

impl CredentialRecord {
    /// Key material from a linking attempt that never completed.
    pub fn is_partial(&self) -> bool {
        !self.registered
    }
}

/// Categories of rotated key records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyCategory {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
    LidMapping,
}

impl KeyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyCategory::PreKey => "pre-key",
            KeyCategory::Session => "session",
            KeyCategory::SenderKey => "sender-key",
            KeyCategory::SenderKeyMemory => "sender-key-memory",
            KeyCategory::AppStateSyncKey => "app-state-sync-key",
            KeyCategory::AppStateSyncVersion => "app-state-sync-version",
            KeyCategory::LidMapping => "lid-mapping",
        }
    }
}

/// Key values found for a lookup. Missing ids are simply absent.
pub type KeyMap = HashMap<String, serde_json::Value>;

/// Key writes for one category. `None` deletes the key.
pub type KeyWrites = HashMap<String, Option<serde_json::Value>>;

/// Object name for a key record.
///
/// Ids may contain `/` and `:` (device suffixes, group ids), which are not
/// safe in file names or object paths.
pub fn key_object_name(category: KeyCategory, id: &str) -> String {
    let safe_id = id.replace('/', "__").replace(':', "-");
    format!("{}-{}.json", category.as_str(), safe_id)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StorageError {
    /// The object does not exist. Expected for fresh sessions.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("file io error at {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    /// Map an I/O error, keeping "not found" distinguishable.
    pub fn file_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(path.display().to_string())
        } else {
            StorageError::FileIo {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// Contract
// ============================================================================

/// Persistence contract shared by every credential backend.
///
/// `load` and `get_keys` report absence as `Ok(None)` / a missing map entry.
/// Any other failure is an error, so callers can tell a fresh session apart
/// from unreachable storage.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn load(&self) -> StorageResult<Option<CredentialRecord>>;

    async fn save(&self, record: &CredentialRecord) -> StorageResult<()>;

    async fn get_keys(&self, category: KeyCategory, ids: &[String]) -> StorageResult<KeyMap>;

    async fn set_keys(&self, category: KeyCategory, writes: KeyWrites) -> StorageResult<()>;

    /// Remove the credential record and every key.
    async fn clear(&self) -> StorageResult<()>;
}

/// Build the configured backend.
pub fn build_store(config: &AuthConfig, auth_dir: &Path) -> StorageResult<Arc<dyn AuthStore>> {
    match config.backend {
        AuthBackend::File => Ok(Arc::new(
            FileAuthStore::new(auth_dir).with_write_concurrency(config.write_concurrency),
        )),
        AuthBackend::Remote => {
            let store = RemoteAuthStore::from_config(&config.remote, auth_dir)?
                .with_write_concurrency(config.write_concurrency);
            Ok(Arc::new(store))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
