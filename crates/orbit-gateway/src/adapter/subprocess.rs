//! Session adapter backed by an external helper process.
//!
//! The helper wraps the actual session library and talks JSON Lines over its
//! stdio. Requests carry a `requestId` that the helper echoes in exactly one
//! `response`. Besides responses the helper sends:
//!
//! - `event`: an [`AdapterEvent`], forwarded to the gateway in order
//! - `keys_get` / `keys_set`: key traffic, served one request at a time from
//!   the [`AuthStore`] and answered with `keys_result`
//!
//! The helper's stderr is inherited so its logs land next to ours.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    AdapterError, AdapterEvent, AdapterResult, ChatPresence, ConnectRequest, ContactInfo,
    DisconnectReason, MediaHandle, OutboundContent, SentMessage, SessionAdapter,
};
use crate::address::Address;
use crate::auth::{AuthStore, CredentialRecord, KeyCategory, KeyMap, KeyWrites};
use crate::config::AdapterConfig;

/// Event channel capacity.
const EVENT_BUFFER: usize = 1024;

/// How long the helper gets to exit after `close` before it is killed.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum HelperRequest<'a> {
    Connect {
        request_id: u64,
        credentials: Option<&'a CredentialRecord>,
        phone: Option<&'a str>,
    },
    PairingCode {
        request_id: u64,
        phone: &'a str,
    },
    Send {
        request_id: u64,
        to: &'a str,
        content: &'a OutboundContent,
    },
    Presence {
        request_id: u64,
        to: &'a str,
        presence: ChatPresence,
    },
    Download {
        request_id: u64,
        media: &'a MediaHandle,
    },
    Contacts {
        request_id: u64,
    },
    KeysResult {
        request_id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        keys: Option<KeyMap>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum HelperMessage {
    Response {
        request_id: u64,
        ok: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<HelperError>,
    },
    Event {
        event: AdapterEvent,
    },
    KeysGet {
        request_id: u64,
        category: KeyCategory,
        ids: Vec<String>,
    },
    KeysSet {
        request_id: u64,
        category: KeyCategory,
        writes: KeyWrites,
    },
}

#[derive(Debug, Deserialize)]
struct HelperError {
    code: String,
    #[serde(default)]
    message: String,
}

impl HelperError {
    fn into_adapter_error(self, timeout: Duration) -> AdapterError {
        match self.code.as_str() {
            "rate_limited" => AdapterError::RateLimited,
            "connection_closed" => AdapterError::ConnectionClosed,
            "timeout" => AdapterError::Timeout(timeout),
            _ if self.message.is_empty() => AdapterError::Rejected(self.code),
            _ => AdapterError::Rejected(format!("{}: {}", self.code, self.message)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PairingCodeResult {
    code: String,
}

#[derive(Debug, Deserialize)]
struct DownloadResult {
    data: String,
}

// ============================================================================
// Shared state
// ============================================================================

type Pending = oneshot::Sender<AdapterResult<Value>>;

struct Shared {
    /// Serializes writes to the helper's stdin.
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: DashMap<u64, Pending>,
    /// Dropped on unsubscribe so no further events reach the gateway.
    events: Mutex<Option<mpsc::Sender<AdapterEvent>>>,
    closing: AtomicBool,
    request_timeout: Duration,
}

impl Shared {
    async fn write_request(&self, request: &HelperRequest<'_>) -> AdapterResult<()> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| AdapterError::Protocol(format!("failed to encode request: {}", e)))?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(AdapterError::ConnectionClosed)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| AdapterError::ConnectionClosed)?;
        stdin
            .flush()
            .await
            .map_err(|_| AdapterError::ConnectionClosed)?;
        Ok(())
    }

    fn event_sender(&self) -> Option<mpsc::Sender<AdapterEvent>> {
        self.events.lock().ok().and_then(|guard| guard.clone())
    }

    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(AdapterError::ConnectionClosed));
            }
        }
    }
}

// ============================================================================
// SubprocessAdapter
// ============================================================================

pub struct SubprocessAdapter {
    command: String,
    args: Vec<String>,
    shared: Arc<Shared>,
    child: tokio::sync::Mutex<Option<Child>>,
    key_worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    started: AtomicBool,
}

impl SubprocessAdapter {
    pub fn new(config: &AdapterConfig) -> Self {
        Self::build(
            config.command.clone(),
            config.args.clone(),
            config.request_timeout(),
        )
    }

    fn build(command: String, args: Vec<String>, request_timeout: Duration) -> Self {
        Self {
            command,
            args,
            shared: Arc::new(Shared {
                stdin: tokio::sync::Mutex::new(None),
                pending: DashMap::new(),
                events: Mutex::new(None),
                closing: AtomicBool::new(false),
                request_timeout,
            }),
            child: tokio::sync::Mutex::new(None),
            key_worker: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
        }
    }

    fn spawn_helper(&self) -> AdapterResult<Child> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // SAFETY: pre_exec runs in the forked child before exec; prctl touches
        // no shared state. The helper gets SIGTERM if the gateway dies.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn().map_err(|e| {
            AdapterError::Unavailable(format!("failed to spawn {}: {}", self.command, e))
        })
    }

    /// Send a request and wait for its response.
    async fn request<'r>(
        &self,
        build: impl FnOnce(u64) -> HelperRequest<'r>,
    ) -> AdapterResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);

        if let Err(e) = self.shared.write_request(&build(id)).await {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        let timeout = self.shared.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(AdapterError::Timeout(timeout))
            }
        }
    }
}

#[async_trait]
impl SessionAdapter for SubprocessAdapter {
    async fn connect(&self, request: ConnectRequest) -> AdapterResult<mpsc::Receiver<AdapterEvent>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AdapterError::Protocol(
                "session helper already started".to_string(),
            ));
        }

        let mut child = self.spawn_helper()?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::Unavailable("helper stdout not captured".to_string()))?;
        info!(command = %self.command, pid = ?child.id(), "Session helper started");

        *self.shared.stdin.lock().await = stdin;
        *self.child.lock().await = Some(child);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        if let Ok(mut guard) = self.shared.events.lock() {
            *guard = Some(tx);
        }

        let (keys_tx, keys_rx) = mpsc::unbounded_channel();
        *self.key_worker.lock().await = Some(tokio::spawn(serve_keys(
            keys_rx,
            self.shared.clone(),
            request.store.clone(),
        )));
        tokio::spawn(read_helper_output(stdout, self.shared.clone(), keys_tx));

        let credentials = request.credentials.as_ref();
        let phone = request.phone.as_deref();
        self.request(|request_id| HelperRequest::Connect {
            request_id,
            credentials,
            phone,
        })
        .await?;

        Ok(rx)
    }

    async fn request_pairing_code(&self, phone: &str) -> AdapterResult<String> {
        let result = self
            .request(|request_id| HelperRequest::PairingCode { request_id, phone })
            .await?;
        let parsed: PairingCodeResult = parse_result(result)?;
        Ok(parsed.code)
    }

    async fn send(&self, to: &Address, content: &OutboundContent) -> AdapterResult<SentMessage> {
        let result = self
            .request(|request_id| HelperRequest::Send {
                request_id,
                to: to.as_str(),
                content,
            })
            .await?;
        parse_result(result)
    }

    async fn send_presence(&self, to: &Address, presence: ChatPresence) -> AdapterResult<()> {
        self.request(|request_id| HelperRequest::Presence {
            request_id,
            to: to.as_str(),
            presence,
        })
        .await?;
        Ok(())
    }

    async fn download_media(&self, media: &MediaHandle) -> AdapterResult<Bytes> {
        let result = self
            .request(|request_id| HelperRequest::Download { request_id, media })
            .await?;
        let parsed: DownloadResult = parse_result(result)?;
        let data = BASE64
            .decode(parsed.data.as_bytes())
            .map_err(|e| AdapterError::Protocol(format!("invalid media payload: {}", e)))?;
        Ok(Bytes::from(data))
    }

    async fn cached_contacts(&self) -> AdapterResult<Vec<ContactInfo>> {
        let result = self
            .request(|request_id| HelperRequest::Contacts { request_id })
            .await?;
        parse_result(result)
    }

    async fn unsubscribe_all(&self) {
        if let Ok(mut guard) = self.shared.events.lock() {
            guard.take();
        }
        debug!("Unsubscribed from session events");
    }

    async fn close(&self) -> AdapterResult<()> {
        self.shared.closing.store(true, Ordering::SeqCst);

        if let Err(e) = self.shared.write_request(&HelperRequest::Close).await {
            debug!(error = %e, "Close request not delivered");
        }
        // Closing stdin tells the helper no more requests are coming.
        self.shared.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!(status = %status, "Session helper exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to wait for session helper");
            }
            Err(_) => {
                warn!("Session helper did not exit in time, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| AdapterError::Unavailable(format!("failed to kill helper: {}", e)))?;
            }
        }
        self.shared.fail_pending();

        // The reader drops its end at EOF; wait for the last key write.
        if let Some(worker) = self.key_worker.lock().await.take()
            && tokio::time::timeout(CLOSE_GRACE, worker).await.is_err()
        {
            warn!("Key worker still busy after helper exit");
        }
        Ok(())
    }
}

fn parse_result<T: serde::de::DeserializeOwned>(value: Value) -> AdapterResult<T> {
    serde_json::from_value(value)
        .map_err(|e| AdapterError::Protocol(format!("unexpected response shape: {}", e)))
}

// ============================================================================
// Reader task
// ============================================================================

/// Key traffic from the helper, handed to the key worker in arrival order.
#[derive(Debug)]
enum KeyRequest {
    Get {
        request_id: u64,
        category: KeyCategory,
        ids: Vec<String>,
    },
    Set {
        request_id: u64,
        category: KeyCategory,
        writes: KeyWrites,
    },
}

/// Routes helper output. Never waits on the gateway, so responses keep
/// flowing while the event consumer is busy.
async fn read_helper_output(
    stdout: ChildStdout,
    shared: Arc<Shared>,
    keys: mpsc::UnboundedSender<KeyRequest>,
) {
    let (events, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(forward_events(events_rx, shared.clone()));

    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read from session helper");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: HelperMessage = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Skipping malformed line from session helper");
                continue;
            }
        };

        match message {
            HelperMessage::Response {
                request_id,
                ok,
                result,
                error,
            } => {
                let Some((_, tx)) = shared.pending.remove(&request_id) else {
                    debug!(request_id, "Response for unknown or expired request");
                    continue;
                };
                let outcome = if ok {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    Err(error
                        .map(|e| e.into_adapter_error(shared.request_timeout))
                        .unwrap_or_else(|| AdapterError::Rejected("unspecified".to_string())))
                };
                let _ = tx.send(outcome);
            }
            HelperMessage::Event { event } => {
                let _ = events.send(event);
            }
            HelperMessage::KeysGet {
                request_id,
                category,
                ids,
            } => {
                let _ = keys.send(KeyRequest::Get {
                    request_id,
                    category,
                    ids,
                });
            }
            HelperMessage::KeysSet {
                request_id,
                category,
                writes,
            } => {
                let _ = keys.send(KeyRequest::Set {
                    request_id,
                    category,
                    writes,
                });
            }
        }
    }

    shared.fail_pending();
    if shared.closing.load(Ordering::SeqCst) {
        debug!("Session helper output closed");
        return;
    }

    warn!("Session helper exited unexpectedly");
    let _ = events.send(AdapterEvent::Disconnected {
        reason: DisconnectReason::ConnectionLost,
        detail: Some("session helper exited".to_string()),
    });
}

/// Hands events to the gateway in order, waiting for room as needed.
async fn forward_events(mut rx: mpsc::UnboundedReceiver<AdapterEvent>, shared: Arc<Shared>) {
    while let Some(event) = rx.recv().await {
        let Some(tx) = shared.event_sender() else {
            debug!(kind = event.kind(), "Dropping event after unsubscribe");
            continue;
        };
        if tx.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Serves key reads and writes one at a time, in the order the helper sent
/// them. A later write to the same key always lands after an earlier one.
async fn serve_keys(
    mut rx: mpsc::UnboundedReceiver<KeyRequest>,
    shared: Arc<Shared>,
    store: Arc<dyn AuthStore>,
) {
    while let Some(request) = rx.recv().await {
        let reply = if shared.closing.load(Ordering::SeqCst) {
            debug!("Refusing key traffic from a closing session");
            key_failure(request.request_id(), "session closing".to_string())
        } else {
            execute_key_request(request, store.as_ref()).await
        };
        if let Err(e) = shared.write_request(&reply).await {
            debug!(error = %e, "Failed to answer key request");
        }
    }
}

async fn execute_key_request(request: KeyRequest, store: &dyn AuthStore) -> HelperRequest<'static> {
    match request {
        KeyRequest::Get {
            request_id,
            category,
            ids,
        } => match store.get_keys(category, &ids).await {
            Ok(keys) => HelperRequest::KeysResult {
                request_id,
                ok: true,
                keys: Some(keys),
                error: None,
            },
            Err(e) => {
                warn!(category = category.as_str(), error = %e, "Key read failed");
                key_failure(request_id, e.to_string())
            }
        },
        KeyRequest::Set {
            request_id,
            category,
            writes,
        } => {
            let count = writes.len();
            match store.set_keys(category, writes).await {
                Ok(()) => {
                    debug!(category = category.as_str(), count, "Keys written");
                    HelperRequest::KeysResult {
                        request_id,
                        ok: true,
                        keys: None,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(category = category.as_str(), error = %e, "Key write failed");
                    key_failure(request_id, e.to_string())
                }
            }
        }
    }
}

fn key_failure(request_id: u64, error: String) -> HelperRequest<'static> {
    HelperRequest::KeysResult {
        request_id,
        ok: false,
        keys: None,
        error: Some(error),
    }
}

impl KeyRequest {
    fn request_id(&self) -> u64 {
        match self {
            KeyRequest::Get { request_id, .. } | KeyRequest::Set { request_id, .. } => *request_id,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
