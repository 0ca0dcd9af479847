//! In-memory credential holder.
//!
//! The in-memory record is authoritative for the life of the process. Saves
//! are best-effort: a failed write is logged and the session keeps running
//! on the in-memory copy, to be persisted again on the next rotation.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{AuthStore, CredentialRecord, StorageResult};

/// How the initial load went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A stored record was found.
    Restored,
    /// Nothing stored yet; the session needs linking.
    Fresh,
    /// Storage could not be read; starting fresh anyway.
    Unreachable,
}

pub struct AuthState {
    store: Arc<dyn AuthStore>,
    record: Option<CredentialRecord>,
    dirty: bool,
    revoked: bool,
}

impl AuthState {
    /// Load the stored record. Storage failures degrade to a fresh start.
    pub async fn load(store: Arc<dyn AuthStore>) -> (Self, LoadOutcome) {
        let (record, outcome) = match store.load().await {
            Ok(Some(record)) => {
                info!(backend = store.backend(), registered = record.registered, "Loaded credentials");
                (Some(record), LoadOutcome::Restored)
            }
            Ok(None) => {
                info!(backend = store.backend(), "No stored credentials, session needs linking");
                (None, LoadOutcome::Fresh)
            }
            Err(e) => {
                error!(backend = store.backend(), error = %e, "Failed to load credentials, starting fresh");
                (None, LoadOutcome::Unreachable)
            }
        };

        (
            Self {
                store,
                record,
                dirty: false,
                revoked: false,
            },
            outcome,
        )
    }

    pub fn store(&self) -> Arc<dyn AuthStore> {
        self.store.clone()
    }

    pub fn record(&self) -> Option<&CredentialRecord> {
        self.record.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.record.as_ref().is_some_and(|r| r.registered)
    }

    /// Whether the last save failed and the stored copy is behind memory.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replace the record and try to persist it.
    ///
    /// Ignored once the session has been revoked.
    pub async fn update(&mut self, record: CredentialRecord) {
        if self.revoked {
            debug!("Ignoring credential update after logout");
            return;
        }
        self.record = Some(record);
        self.persist().await;
    }

    /// Retry persisting the in-memory record if an earlier save failed.
    pub async fn flush(&mut self) {
        if self.dirty && !self.revoked {
            self.persist().await;
        }
    }

    async fn persist(&mut self) {
        let Some(record) = &self.record else {
            return;
        };
        match self.store.save(record).await {
            Ok(()) => {
                debug!(backend = self.store.backend(), "Credentials saved");
                self.dirty = false;
            }
            Err(e) => {
                warn!(
                    backend = self.store.backend(),
                    error = %e,
                    "Failed to save credentials, keeping in-memory copy"
                );
                self.dirty = true;
            }
        }
    }

    /// Drop a record left by a linking attempt that never completed.
    ///
    /// Returns `true` if stale state was wiped.
    pub async fn discard_partial(&mut self) -> StorageResult<bool> {
        let stale = self.record.as_ref().is_some_and(CredentialRecord::is_partial);
        if !stale {
            return Ok(false);
        }
        info!("Discarding partial credentials from an interrupted linking attempt");
        self.clear().await?;
        Ok(true)
    }

    /// Erase the record in memory and in storage.
    pub async fn clear(&mut self) -> StorageResult<()> {
        self.record = None;
        self.dirty = false;
        self.store.clear().await
    }

    /// Erase everything after a logout and refuse any later writes.
    ///
    /// A logged-out account must come back unlinked, so late rotations from
    /// the dying session are dropped rather than saved over the wipe.
    pub async fn revoke(&mut self) -> StorageResult<()> {
        self.revoked = true;
        self.clear().await
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked
    }
}
