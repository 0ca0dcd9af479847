//! IPC protocol between the Orbit gateway and its orchestrator.
//!
//! The gateway runs as a child process of the orchestrator. Both directions
//! use JSON Lines (one UTF-8 JSON object per line):
//!
//! ```text
//!  Orchestrator                               Gateway
//!       │  GatewayCommand (stdin)                │
//!       │ ─────────────────────────────────────▶ │
//!       │                                        │
//!       │  GatewayEvent (stdout)                 │
//!       │ ◀───────────────────────────────────── │
//! ```
//!
//! Every message carries a `type` discriminator. Commands carry an `id` that
//! the gateway echoes back in exactly one `ack` or `error` event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Commands (orchestrator → gateway)
// ============================================================================

/// Correlation identifier for a command.
///
/// Orchestrators in the wild send either millisecond timestamps or strings,
/// so both are accepted and echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandId {
    Number(i64),
    Text(String),
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandId::Number(n) => write!(f, "{}", n),
            CommandId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for CommandId {
    fn from(value: i64) -> Self {
        CommandId::Number(value)
    }
}

impl From<&str> for CommandId {
    fn from(value: &str) -> Self {
        CommandId::Text(value.to_string())
    }
}

/// Commands sent from the orchestrator to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Send a text or media message.
    SendMessage(SendMessageData),
    /// React to an existing message with an emoji.
    React(ReactData),
    /// Revoke a previously sent message.
    DeleteMessage(DeleteMessageData),
    /// Re-emit the full contact directory.
    GetContacts(GetContactsData),
}

impl GatewayCommand {
    /// The correlation id of this command.
    pub fn id(&self) -> &CommandId {
        match self {
            GatewayCommand::SendMessage(d) => &d.id,
            GatewayCommand::React(d) => &d.id,
            GatewayCommand::DeleteMessage(d) => &d.id,
            GatewayCommand::GetContacts(d) => &d.id,
        }
    }

    /// The wire name of this command kind.
    /// Wire names of every command this protocol understands.
    pub const KINDS: [&'static str; 4] = ["send_message", "react", "delete_message", "get_contacts"];

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayCommand::SendMessage(_) => "send_message",
            GatewayCommand::React(_) => "react",
            GatewayCommand::DeleteMessage(_) => "delete_message",
            GatewayCommand::GetContacts(_) => "get_contacts",
        }
    }

    /// The target address, if the command has one.
    pub fn target(&self) -> Option<&str> {
        match self {
            GatewayCommand::SendMessage(d) => Some(&d.to),
            GatewayCommand::React(d) => Some(&d.to),
            GatewayCommand::DeleteMessage(d) => Some(&d.to),
            GatewayCommand::GetContacts(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageData {
    pub id: CommandId,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Path or URL of an attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    /// Attachment kind (`image`, `video`, `audio`, `document`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactData {
    pub id: CommandId,
    pub to: String,
    pub message_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageData {
    pub id: CommandId,
    pub to: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetContactsData {
    pub id: CommandId,
}

// ============================================================================
// Events (gateway → orchestrator)
// ============================================================================

/// Events sent from the gateway to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Startup banner.
    System(SystemData),
    /// Scannable linking code.
    Qr { data: String },
    /// Numeric linking code for phone-number linking.
    PairingCode { data: String },
    /// Connection status change.
    Connection(ConnectionData),
    /// Full contact directory snapshot.
    Contacts { data: Vec<ContactEntry> },
    /// Running count of known contacts.
    ContactSyncProgress { count: usize },
    /// Batch of historical messages, capped per conversation.
    HistoryMessages { data: Vec<HistoryEntry> },
    /// A live message.
    Message(MessageData),
    /// Operator issued a stop/start directive from their own device.
    AgentControl(AgentControlData),
    /// Command completed successfully.
    Ack(AckData),
    /// Command failed, or a gateway-level error occurred.
    Error(ErrorData),
    /// The gateway is about to exit and wants to be respawned.
    RestartRequested { reason: String },
}

impl GatewayEvent {
    /// Build an `ack` event for a command.
    pub fn ack(id: CommandId) -> Self {
        GatewayEvent::Ack(AckData { id, success: true })
    }

    /// Build an `error` event for a command.
    pub fn command_error(id: CommandId, message: impl Into<String>) -> Self {
        GatewayEvent::Error(ErrorData {
            id: Some(id),
            message: message.into(),
        })
    }

    /// The wire name of this event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::System(_) => "system",
            GatewayEvent::Qr { .. } => "qr",
            GatewayEvent::PairingCode { .. } => "pairing_code",
            GatewayEvent::Connection(_) => "connection",
            GatewayEvent::Contacts { .. } => "contacts",
            GatewayEvent::ContactSyncProgress { .. } => "contact_sync_progress",
            GatewayEvent::HistoryMessages { .. } => "history_messages",
            GatewayEvent::Message(_) => "message",
            GatewayEvent::AgentControl(_) => "agent_control",
            GatewayEvent::Ack(_) => "ack",
            GatewayEvent::Error(_) => "error",
            GatewayEvent::RestartRequested { .. } => "restart_requested",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemData {
    pub message: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

/// Connection status reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Close,
    /// Waiting for the operator to complete linking.
    Pairing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<AccountInfo>,
}

/// The paired account's own identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Address kinds exposed in contact snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Individual,
    Group,
    /// Privacy-preserving linked identity.
    Linked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactEntry {
    pub address: String,
    pub name: Option<String>,
    pub alternate_name: Option<String>,
    pub kind: ContactKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub from: String,
    pub sender_label: Option<String>,
    pub text: String,
    pub from_me: bool,
    /// Unix seconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub id: String,
    pub from: String,
    pub sender_label: Option<String>,
    pub text: String,
    /// Local path of the deduplicated attachment, if any.
    pub media_path: Option<String>,
    pub media_type: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
    pub is_group: bool,
    pub from_me: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Stop,
    Start,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentControlData {
    pub action: ControlAction,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckData {
    pub id: CommandId,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CommandId>,
    pub message: String,
}

// ============================================================================
// Framing
// ============================================================================

/// Serialize an event as a single newline-terminated JSON line.
pub fn encode_event(event: &GatewayEvent) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}

/// Parse one input line into a command.
///
/// Blank lines yield `Ok(None)`.
pub fn decode_command(line: &str) -> serde_json::Result<Option<GatewayCommand>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

/// Error reply for an input line that did not decode into a command.
///
/// Returns `None` when the line has no usable `id`, since such a reply
/// could not be correlated anyway.
pub fn reject_command(line: &str, error: &serde_json::Error) -> Option<GatewayEvent> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let id: CommandId = serde_json::from_value(value.get("id")?.clone()).ok()?;
    let message = match value.get("type").and_then(serde_json::Value::as_str) {
        Some(kind) if GatewayCommand::KINDS.contains(&kind) => {
            format!("invalid {} command: {}", kind, error)
        }
        Some(kind) => format!("unknown command type: {}", kind),
        None => "missing command type".to_string(),
    };
    Some(GatewayEvent::command_error(id, message))
}

/// Serialize a command as a single newline-terminated JSON line.
pub fn encode_command(command: &GatewayCommand) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(command)?;
    line.push('\n');
    Ok(line)
}

/// Parse one output line into an event. Blank lines yield `Ok(None)`.
pub fn decode_event(line: &str) -> serde_json::Result<Option<GatewayEvent>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}
