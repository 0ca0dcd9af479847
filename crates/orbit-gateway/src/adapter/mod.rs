//! Boundary to the session library.
//!
//! The network's handshake and crypto protocol live outside this crate. The
//! gateway only sees the [`SessionAdapter`] primitives and a stream of
//! [`AdapterEvent`]s, one variant per callback kind, validated once here
//! before reaching internal logic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use orbit_gateway_protocol::AccountInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::address::Address;
use crate::auth::{AuthStore, CredentialRecord};

#[cfg(test)]
pub(crate) mod mock;
pub mod subprocess;

pub use subprocess::SubprocessAdapter;

// ============================================================================
// Events
// ============================================================================

/// Everything the session library reports, as one tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AdapterEvent {
    /// A scannable linking code is ready (also means the socket can link).
    Qr { code: String },
    /// Linking finished on the operator's device.
    PairSuccess { id: String },
    Connecting,
    Connected {
        #[serde(default)]
        identity: Option<AccountInfo>,
    },
    Disconnected {
        reason: DisconnectReason,
        #[serde(default)]
        detail: Option<String>,
    },
    /// Key material rotated; must be persisted.
    CredentialsUpdated { record: CredentialRecord },
    /// Server-pushed recent-activity subset.
    ContactsUpsert { contacts: Vec<ContactInfo> },
    /// Incremental updates to that subset.
    ContactsUpdate { contacts: Vec<ContactInfo> },
    /// One-time bulk history payload.
    HistorySync {
        conversations: Vec<HistoryConversation>,
        #[serde(default)]
        contacts: Vec<ContactInfo>,
    },
    /// Incremental per-conversation listing.
    ChatsUpsert { chats: Vec<ChatInfo> },
    /// A live message.
    Message(LiveMessage),
}

impl AdapterEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterEvent::Qr { .. } => "qr",
            AdapterEvent::PairSuccess { .. } => "pair_success",
            AdapterEvent::Connecting => "connecting",
            AdapterEvent::Connected { .. } => "connected",
            AdapterEvent::Disconnected { .. } => "disconnected",
            AdapterEvent::CredentialsUpdated { .. } => "credentials_updated",
            AdapterEvent::ContactsUpsert { .. } => "contacts_upsert",
            AdapterEvent::ContactsUpdate { .. } => "contacts_update",
            AdapterEvent::HistorySync { .. } => "history_sync",
            AdapterEvent::ChatsUpsert { .. } => "chats_upsert",
            AdapterEvent::Message(_) => "message",
        }
    }
}

/// Why the session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The operator unlinked this device. Credentials are dead.
    LoggedOut,
    /// Another session for the same identity took over.
    Conflict,
    ConnectionLost,
    #[serde(other)]
    Other,
}

/// Identity data for one address, as reported by the library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub id: String,
    /// Name saved in the operator's address book.
    #[serde(default)]
    pub name: Option<String>,
    /// Self-chosen display name.
    #[serde(default)]
    pub notify: Option<String>,
    /// Verified business name.
    #[serde(default)]
    pub verified_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConversation {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
    /// Sender inside a group conversation.
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub push_name: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMessage {
    pub id: String,
    /// Conversation address.
    pub chat: String,
    /// Sender inside a group conversation.
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    /// Unix seconds.
    pub timestamp: i64,
    pub content: MessageContent,
}

/// Message payload, reduced to what the gateway uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        media: Option<MediaHandle>,
    },
    Video {
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        media: Option<MediaHandle>,
    },
    Audio {
        #[serde(default)]
        media: Option<MediaHandle>,
    },
    Sticker {
        #[serde(default)]
        media: Option<MediaHandle>,
    },
    Document {
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        media: Option<MediaHandle>,
    },
    #[serde(other)]
    Unsupported,
}

impl MessageContent {
    /// The downloadable attachment, if any.
    pub fn media(&self) -> Option<&MediaHandle> {
        match self {
            MessageContent::Image { media, .. }
            | MessageContent::Video { media, .. }
            | MessageContent::Audio { media }
            | MessageContent::Sticker { media }
            | MessageContent::Document { media, .. } => media.as_ref(),
            MessageContent::Text { .. } | MessageContent::Unsupported => None,
        }
    }

    /// Attachment kind as reported to the orchestrator.
    pub fn media_kind(&self) -> Option<&'static str> {
        match self {
            MessageContent::Image { .. } => Some("image"),
            MessageContent::Video { .. } => Some("video"),
            MessageContent::Audio { .. } => Some("audio"),
            MessageContent::Sticker { .. } => Some("sticker"),
            MessageContent::Document { .. } => Some("document"),
            MessageContent::Text { .. } | MessageContent::Unsupported => None,
        }
    }
}

/// Opaque reference the library needs to fetch an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaHandle {
    pub id: String,
    #[serde(default)]
    pub mimetype: Option<String>,
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundContent {
    Text {
        text: String,
    },
    Media {
        /// Local path or URL of the attachment.
        source: String,
        media_type: String,
        #[serde(default)]
        caption: Option<String>,
    },
    Reaction {
        message_id: String,
        emoji: String,
    },
    Revoke {
        message_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPresence {
    Composing,
    Paused,
}

/// Everything needed to open a session.
pub struct ConnectRequest {
    /// Stored credentials, or `None` to link a new device.
    pub credentials: Option<CredentialRecord>,
    /// Serves the library's key reads and writes.
    pub store: Arc<dyn AuthStore>,
    /// Phone number for code-based linking.
    pub phone: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("rate limited by the network")]
    RateLimited,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected by the network: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session library unavailable: {0}")]
    Unavailable(String),
}

impl AdapterError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::RateLimited | AdapterError::ConnectionClosed | AdapterError::Timeout(_)
        )
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

// ============================================================================
// Contract
// ============================================================================

/// Primitives the gateway needs from the session library.
#[async_trait]
pub trait SessionAdapter: Send + Sync {
    /// Open the session. Events arrive on the returned channel until the
    /// adapter is torn down.
    async fn connect(&self, request: ConnectRequest) -> AdapterResult<mpsc::Receiver<AdapterEvent>>;

    /// Ask for a numeric linking code for `phone`.
    async fn request_pairing_code(&self, phone: &str) -> AdapterResult<String>;

    async fn send(&self, to: &Address, content: &OutboundContent) -> AdapterResult<SentMessage>;

    async fn send_presence(&self, to: &Address, presence: ChatPresence) -> AdapterResult<()>;

    async fn download_media(&self, media: &MediaHandle) -> AdapterResult<Bytes>;

    /// Identity data the library has cached, for periodic resweeps.
    async fn cached_contacts(&self) -> AdapterResult<Vec<ContactInfo>>;

    /// Stop delivering events.
    async fn unsubscribe_all(&self);

    /// Force-close the underlying transport.
    async fn close(&self) -> AdapterResult<()>;
}
