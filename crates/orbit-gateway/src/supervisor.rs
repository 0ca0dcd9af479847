//! The gateway control loop.
//!
//! One task owns the session lifecycle, the contact directory, the debounce
//! and resweep timers and the credential holder. Adapter events, worker
//! requests and timers all funnel into it through a single `select!`, so
//! none of that state needs a lock. Outbound commands run on a separate
//! worker that only reads the connection state.
//!
//! ```text
//!  adapter events ─┐
//!  worker requests ┼─▶ Supervisor::run ──▶ EventSink ──▶ stdout
//!  timers ─────────┘         │
//!                            └─ ConnectionState (watch) ──▶ CommandWorker
//! ```

use std::sync::Arc;

use chrono::Utc;
use orbit_gateway_protocol::{
    AccountInfo, AgentControlData, ConnectionData, ConnectionStatus, ControlAction, ErrorData,
    GatewayCommand, GatewayEvent, MessageData, SystemData,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{
    AdapterEvent, ContactInfo, DisconnectReason, HistoryConversation, LiveMessage, MediaHandle,
    SessionAdapter,
};
use crate::address::Address;
use crate::auth::AuthState;
use crate::config::{ControlConfig, GatewayConfig};
use crate::contacts::{ContactDirectory, ContactSighting, Debouncer};
use crate::history;
use crate::ipc::EventSink;
use crate::lifecycle::{LifecycleController, LifecycleError};
use crate::media::MediaStore;
use crate::queue::{CommandQueue, CommandWorker, ControlRequest};

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Operator or signal asked us to stop.
    Shutdown,
    /// The session closed; the orchestrator should spawn a new process.
    Restart { reason: String },
}

struct PendingRestart {
    at: Instant,
    reason: String,
}

pub struct Supervisor {
    config: GatewayConfig,
    adapter: Arc<dyn SessionAdapter>,
    auth: AuthState,
    lifecycle: LifecycleController,
    directory: ContactDirectory,
    debouncer: Debouncer,
    media: MediaStore,
    events: EventSink,
    queue: CommandQueue,
    queue_rx: Option<mpsc::UnboundedReceiver<GatewayCommand>>,
    phone: Option<String>,
    pairing_code_sent: bool,
    resweep_at: Option<Instant>,
    pending_restart: Option<PendingRestart>,
}

impl Supervisor {
    pub fn new(
        config: GatewayConfig,
        adapter: Arc<dyn SessionAdapter>,
        auth: AuthState,
        media: MediaStore,
        events: EventSink,
        phone: Option<String>,
    ) -> Self {
        let (queue, queue_rx) = CommandQueue::channel();
        Self {
            lifecycle: LifecycleController::new(adapter.clone(), config.timing.clone()),
            debouncer: Debouncer::new(config.timing.contact_debounce()),
            config,
            adapter,
            auth,
            directory: ContactDirectory::new(),
            media,
            events,
            queue,
            queue_rx: Some(queue_rx),
            phone,
            pairing_code_sent: false,
            resweep_at: None,
            pending_restart: None,
        }
    }

    /// Producer handle for inbound commands.
    pub fn queue(&self) -> CommandQueue {
        self.queue.clone()
    }

    /// Run until shutdown or until a restart is due.
    ///
    /// Fails only if the session cannot be opened at all.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<ExitReason, LifecycleError> {
        self.events
            .emit(GatewayEvent::System(SystemData {
                message: "Orbit gateway started".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                started_at: Utc::now(),
            }))
            .await;
        self.emit_connection(ConnectionStatus::Connecting, None).await;

        let mut adapter_rx = match self.lifecycle.start(&mut self.auth, self.phone.as_deref()).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "Failed to open session");
                self.events
                    .emit(GatewayEvent::Error(ErrorData {
                        id: None,
                        message: e.to_string(),
                    }))
                    .await;
                return Err(e);
            }
        };

        let (control_tx, mut control_rx) = mpsc::channel(16);
        let worker_cancel = CancellationToken::new();
        let worker = self.queue_rx.take().map(|rx| {
            CommandWorker::new(
                self.adapter.clone(),
                self.lifecycle.subscribe(),
                self.events.clone(),
                control_tx,
                self.config.queue.clone(),
            )
            .spawn(self.queue.clone(), rx, worker_cancel.clone())
        });

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.timing.heartbeat(),
            self.config.timing.heartbeat(),
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut adapter_live = true;

        let exit = loop {
            let debounce_at = self.debouncer.deadline();
            let resweep_at = self.resweep_at;
            let restart_at = self.pending_restart.as_ref().map(|p| p.at);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break ExitReason::Shutdown;
                }
                event = adapter_rx.recv(), if adapter_live => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        adapter_live = false;
                        if self.pending_restart.is_none() {
                            warn!("Session event stream ended");
                            self.on_closed(DisconnectReason::ConnectionLost, Some("event stream ended")).await;
                        }
                    }
                },
                Some(request) = control_rx.recv() => self.handle_control(request).await,
                _ = sleep_until(debounce_at) => {
                    if self.debouncer.fire() {
                        self.flush_contacts().await;
                    }
                }
                _ = sleep_until(resweep_at) => self.resweep().await,
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = sleep_until(restart_at) => {
                    let reason = self
                        .pending_restart
                        .take()
                        .map(|p| p.reason)
                        .unwrap_or_else(|| "connection closed".to_string());
                    break ExitReason::Restart { reason };
                }
            }
        };

        if exit == ExitReason::Shutdown {
            self.lifecycle.begin_shutdown();
        }
        self.debouncer.cancel();
        self.resweep_at = None;

        worker_cancel.cancel();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            error!(error = %e, "Command worker panicked");
        }
        self.lifecycle.teardown().await;

        match &exit {
            ExitReason::Shutdown => {
                self.emit_connection(ConnectionStatus::Close, None).await;
                info!("Gateway stopped");
            }
            ExitReason::Restart { reason } => {
                info!(reason = %reason, "Requesting restart");
                self.events
                    .emit(GatewayEvent::RestartRequested {
                        reason: reason.clone(),
                    })
                    .await;
            }
        }
        Ok(exit)
    }

    // ========================================================================
    // Adapter events
    // ========================================================================

    async fn handle_event(&mut self, event: AdapterEvent) {
        debug!(kind = event.kind(), "Session event");

        if self.pending_restart.is_some()
            && matches!(
                event,
                AdapterEvent::Qr { .. }
                    | AdapterEvent::Connecting
                    | AdapterEvent::Connected { .. }
                    | AdapterEvent::CredentialsUpdated { .. }
            )
        {
            debug!(kind = event.kind(), "Ignoring session event while restart is pending");
            return;
        }

        match event {
            AdapterEvent::Qr { code } => self.on_link_code(code).await,
            AdapterEvent::PairSuccess { id } => info!(id = %id, "Device linked"),
            AdapterEvent::Connecting => {
                self.lifecycle.on_connecting();
                self.emit_connection(ConnectionStatus::Connecting, None).await;
            }
            AdapterEvent::Connected { identity } => self.on_open(identity).await,
            AdapterEvent::Disconnected { reason, detail } => {
                self.on_closed(reason, detail.as_deref()).await
            }
            AdapterEvent::CredentialsUpdated { record } => self.auth.update(record).await,
            AdapterEvent::ContactsUpsert { contacts } | AdapterEvent::ContactsUpdate { contacts } => {
                self.absorb(&contact_sightings(&contacts)).await;
            }
            AdapterEvent::HistorySync {
                conversations,
                contacts,
            } => self.on_history(&conversations, &contacts).await,
            AdapterEvent::ChatsUpsert { chats } => {
                let sightings: Vec<ContactSighting> =
                    chats.iter().filter_map(ContactSighting::from_chat).collect();
                self.absorb(&sightings).await;
            }
            AdapterEvent::Message(message) => self.on_message(message).await,
        }
    }

    async fn on_link_code(&mut self, qr: String) {
        let Some(phone) = self.phone.clone() else {
            self.events.emit(GatewayEvent::Qr { data: qr }).await;
            self.emit_connection(ConnectionStatus::Pairing, None).await;
            return;
        };

        // Linking by code: one code per process, later QR rotations are noise.
        if self.pairing_code_sent {
            return;
        }
        match self.adapter.request_pairing_code(&phone).await {
            Ok(code) => {
                self.pairing_code_sent = true;
                info!("Pairing code issued");
                self.events.emit(GatewayEvent::PairingCode { data: code }).await;
                self.emit_connection(ConnectionStatus::Pairing, None).await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to request pairing code");
                self.events
                    .emit(GatewayEvent::Error(ErrorData {
                        id: None,
                        message: format!("pairing code request failed: {}", e),
                    }))
                    .await;
            }
        }
    }

    async fn on_open(&mut self, identity: Option<AccountInfo>) {
        self.lifecycle.on_open();
        self.auth.flush().await;

        let user = identity.or_else(|| self.auth.record().and_then(|r| r.me.clone()));
        info!(user = ?user.as_ref().map(|u| &u.id), "Session open");
        self.emit_connection(ConnectionStatus::Open, user).await;

        self.flush_contacts().await;
        self.resweep_at = Some(Instant::now() + self.config.timing.contact_resweep());
    }

    async fn on_closed(&mut self, reason: DisconnectReason, detail: Option<&str>) {
        self.resweep_at = None;
        let plan = self.lifecycle.on_closed(reason, detail);
        self.emit_connection(ConnectionStatus::Close, None).await;

        let Some(plan) = plan else {
            return;
        };

        if plan.clear_credentials {
            // Stop the session first so nothing it still has in flight
            // lands in storage after the wipe.
            self.lifecycle.teardown().await;
            match self.auth.revoke().await {
                Ok(()) => info!("Credentials cleared after logout"),
                Err(e) => error!(error = %e, "Failed to clear credentials after logout"),
            }
        }

        let at = Instant::now() + plan.delay;
        match &mut self.pending_restart {
            None => {
                self.pending_restart = Some(PendingRestart {
                    at,
                    reason: plan.reason,
                });
            }
            // A logout outranks whatever close came first.
            Some(pending) if plan.clear_credentials => {
                pending.at = pending.at.max(at);
                pending.reason = plan.reason;
            }
            Some(_) => debug!("Restart already pending"),
        }
    }

    async fn on_history(&mut self, conversations: &[HistoryConversation], contacts: &[ContactInfo]) {
        let mut sightings = contact_sightings(contacts);
        sightings.extend(history::history_sightings(conversations));
        self.absorb(&sightings).await;
        self.events
            .emit(GatewayEvent::ContactSyncProgress {
                count: self.directory.exposed_count(),
            })
            .await;

        let entries = history::collect_history(conversations, self.config.history.max_per_address);
        info!(
            conversations = conversations.len(),
            messages = entries.len(),
            contacts = self.directory.exposed_count(),
            "History sync"
        );
        if !entries.is_empty() {
            self.events
                .emit(GatewayEvent::HistoryMessages { data: entries })
                .await;
        }
    }

    async fn on_message(&mut self, message: LiveMessage) {
        let chat = match Address::parse(&message.chat) {
            Ok(chat) => chat,
            Err(e) => {
                warn!(chat = %message.chat, error = %e, "Dropping message with invalid chat address");
                return;
            }
        };
        if chat.is_pseudo() {
            debug!(chat = %chat, "Skipping broadcast message");
            return;
        }

        let mut sightings = vec![ContactSighting::new(chat.clone())];
        if !message.from_me {
            let sender = if chat.is_group() {
                message
                    .participant
                    .as_deref()
                    .and_then(|p| Address::parse(p).ok())
            } else {
                Some(chat.clone())
            };
            if let Some(sender) = sender {
                sightings.push(
                    ContactSighting::new(sender).with_alternate_name(message.push_name.as_deref()),
                );
            }
        }
        self.absorb(&sightings).await;

        let text = history::message_text(&message.content);
        if message.from_me
            && let Some(action) = text
                .as_deref()
                .and_then(|t| control_action(&self.config.control, t))
        {
            info!(action = ?action, "Agent control directive");
            self.events
                .emit(GatewayEvent::AgentControl(AgentControlData {
                    action,
                    from: chat.to_string(),
                }))
                .await;
            return;
        }

        let media_path = match message.content.media() {
            Some(handle) => self.save_media(handle).await,
            None => None,
        };
        if text.is_none() && media_path.is_none() {
            debug!(id = %message.id, "Skipping message without usable content");
            return;
        }

        self.events
            .emit(GatewayEvent::Message(MessageData {
                id: message.id,
                from: chat.to_string(),
                sender_label: if message.from_me {
                    None
                } else {
                    message.push_name
                },
                text: text.unwrap_or_default(),
                media_path,
                media_type: message.content.media_kind().map(str::to_string),
                timestamp: message.timestamp,
                is_group: chat.is_group(),
                from_me: message.from_me,
            }))
            .await;
    }

    async fn save_media(&self, handle: &MediaHandle) -> Option<String> {
        let data = match self.adapter.download_media(handle).await {
            Ok(data) => data,
            Err(e) => {
                warn!(media = %handle.id, error = %e, "Failed to download media");
                return None;
            }
        };
        match self.media.store(&data, handle.mimetype.as_deref()).await {
            Ok(stored) => Some(stored.path.display().to_string()),
            Err(e) => {
                warn!(media = %handle.id, error = %e, "Failed to store media");
                None
            }
        }
    }

    // ========================================================================
    // Contacts
    // ========================================================================

    /// Merge sightings; emit now if this opens a debounce window.
    async fn absorb(&mut self, sightings: &[ContactSighting]) -> usize {
        let changed = self.directory.merge_all(sightings);
        if changed > 0 && self.debouncer.on_change(Instant::now()) {
            self.flush_contacts().await;
        }
        changed
    }

    async fn flush_contacts(&self) -> usize {
        let snapshot = self.directory.snapshot();
        let count = snapshot.len();
        debug!(count, "Emitting contact snapshot");
        self.events
            .emit(GatewayEvent::Contacts { data: snapshot })
            .await;
        count
    }

    /// Re-mine the library's cache and re-emit the snapshot.
    async fn resweep(&mut self) {
        self.resweep_at = None;
        if !self.lifecycle.state().is_open() {
            return;
        }

        match self.adapter.cached_contacts().await {
            Ok(contacts) => {
                let changed = self.directory.merge_all(&contact_sightings(&contacts));
                debug!(cached = contacts.len(), changed, "Contact resweep");
            }
            Err(e) => warn!(error = %e, "Contact resweep failed"),
        }
        self.flush_contacts().await;
        self.resweep_at = Some(Instant::now() + self.config.timing.contact_resweep());
    }

    // ========================================================================
    // Misc
    // ========================================================================

    async fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::FlushContacts { reply } => {
                let count = self.flush_contacts().await;
                let _ = reply.send(count);
            }
        }
    }

    async fn heartbeat(&mut self) {
        debug!(
            state = self.lifecycle.state().as_str(),
            contacts = self.directory.exposed_count(),
            groups = self.directory.group_count(),
            queue_depth = self.queue.depth(),
            credentials_dirty = self.auth.is_dirty(),
            "Heartbeat"
        );
        self.auth.flush().await;
    }

    async fn emit_connection(&self, status: ConnectionStatus, user: Option<AccountInfo>) {
        self.events
            .emit(GatewayEvent::Connection(ConnectionData { status, user }))
            .await;
    }
}

fn contact_sightings(contacts: &[ContactInfo]) -> Vec<ContactSighting> {
    contacts
        .iter()
        .filter_map(ContactSighting::from_contact_info)
        .collect()
}

/// Match a stop/start phrase, ignoring case and surrounding whitespace.
fn control_action(control: &ControlConfig, text: &str) -> Option<ControlAction> {
    let text = text.trim().to_lowercase();
    if text == control.stop_phrase.trim().to_lowercase() {
        Some(ControlAction::Stop)
    } else if text == control.start_phrase.trim().to_lowercase() {
        Some(ControlAction::Start)
    } else {
        None
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;
    use crate::adapter::{ChatInfo, HistoryMessage, MessageContent};
    use crate::auth::{AuthStore, CredentialRecord, FileAuthStore};
    use orbit_gateway_protocol::{CommandId, GetContactsData, SendMessageData};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    struct Fixture {
        adapter: Arc<MockAdapter>,
        events: mpsc::Receiver<GatewayEvent>,
        queue: CommandQueue,
        cancel: CancellationToken,
        handle: JoinHandle<Result<ExitReason, LifecycleError>>,
        store: Arc<FileAuthStore>,
        media_dir: std::path::PathBuf,
        _tmp: TempDir,
    }

    impl Fixture {
        async fn start(phone: Option<&str>, seed: Option<CredentialRecord>) -> Self {
            let tmp = TempDir::new().unwrap();
            let store = Arc::new(FileAuthStore::new(tmp.path().join("auth")));
            if let Some(record) = seed {
                store.save(&record).await.unwrap();
            }
            let (auth, _) = AuthState::load(store.clone()).await;
            let media_dir = tmp.path().join("media");
            let adapter = Arc::new(MockAdapter::new());
            let (sink, events) = EventSink::channel(8192);

            let supervisor = Supervisor::new(
                GatewayConfig::default(),
                adapter.clone(),
                auth,
                MediaStore::new(&media_dir),
                sink,
                phone.map(str::to_string),
            );
            let queue = supervisor.queue();
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(supervisor.run(cancel.clone()));

            Self {
                adapter,
                events,
                queue,
                cancel,
                handle,
                store,
                media_dir,
                _tmp: tmp,
            }
        }

        /// Next event matching `pred`, skipping others.
        async fn next(&mut self, pred: impl Fn(&GatewayEvent) -> bool) -> GatewayEvent {
            tokio::time::timeout(Duration::from_secs(600), async {
                loop {
                    let event = self.events.recv().await.expect("event stream closed");
                    if pred(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("timed out waiting for event")
        }

        async fn next_kind(&mut self, kind: &str) -> GatewayEvent {
            self.next(|e| e.kind() == kind).await
        }

        async fn status(&mut self, status: ConnectionStatus) {
            self.next(|e| matches!(e, GatewayEvent::Connection(d) if d.status == status))
                .await;
        }

        /// Stop the supervisor and collect everything still unread.
        async fn finish(mut self) -> (ExitReason, Vec<GatewayEvent>) {
            self.cancel.cancel();
            let exit = self.handle.await.unwrap().unwrap();
            let mut rest = Vec::new();
            while let Some(event) = self.events.recv().await {
                rest.push(event);
            }
            (exit, rest)
        }
    }

    fn registered() -> CredentialRecord {
        CredentialRecord {
            registered: true,
            me: Some(AccountInfo {
                id: "15550009999@s.whatsapp.net".to_string(),
                name: Some("Operator".to_string()),
            }),
            creds: json!({"noise": "key"}),
        }
    }

    fn contact(id: &str, name: Option<&str>) -> ContactInfo {
        ContactInfo {
            id: id.to_string(),
            name: name.map(str::to_string),
            ..ContactInfo::default()
        }
    }

    fn live(id: &str, chat: &str, from_me: bool, content: MessageContent) -> AdapterEvent {
        AdapterEvent::Message(LiveMessage {
            id: id.to_string(),
            chat: chat.to_string(),
            participant: None,
            push_name: Some("Ann".to_string()),
            from_me,
            timestamp: 1_700_000_000,
            content,
        })
    }

    fn send(id: i64) -> GatewayCommand {
        GatewayCommand::SendMessage(SendMessageData {
            id: CommandId::from(id),
            to: "15550001111".to_string(),
            text: Some("hello".to_string()),
            media: None,
            media_type: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_run_goes_to_pairing() {
        let mut fx = Fixture::start(None, None).await;
        fx.next_kind("system").await;

        fx.adapter.inject(AdapterEvent::Qr { code: "2@abc".to_string() }).await;
        match fx.next_kind("qr").await {
            GatewayEvent::Qr { data } => assert_eq!(data, "2@abc"),
            other => panic!("unexpected {:?}", other),
        }
        fx.status(ConnectionStatus::Pairing).await;

        let (had_credentials, _) = fx.adapter.last_request.lock().unwrap().clone().unwrap();
        assert!(!had_credentials);
        assert_eq!(fx.adapter.connects(), 1);
        assert!(matches!(fx.finish().await.0, ExitReason::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn code_linking_issues_one_pairing_code() {
        let mut fx = Fixture::start(Some("15550001111"), None).await;

        fx.adapter.inject(AdapterEvent::Qr { code: "q1".to_string() }).await;
        fx.adapter.inject(AdapterEvent::Qr { code: "q2".to_string() }).await;
        fx.adapter.inject(AdapterEvent::PairSuccess { id: "x".to_string() }).await;
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;

        match fx.next_kind("pairing_code").await {
            GatewayEvent::PairingCode { data } => assert_eq!(data, "ABCD-1234"),
            other => panic!("unexpected {:?}", other),
        }
        let (_, rest) = fx.finish().await;
        assert!(rest.iter().all(|e| !matches!(e.kind(), "pairing_code" | "qr")));
    }

    #[tokio::test(start_paused = true)]
    async fn open_flushes_snapshot_and_transient_close_restarts_once() {
        let mut fx = Fixture::start(None, Some(registered())).await;

        fx.adapter
            .inject(AdapterEvent::ContactsUpsert {
                contacts: vec![contact("111@s.whatsapp.net", Some("Alice"))],
            })
            .await;
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;

        match fx.next(|e| matches!(e, GatewayEvent::Connection(d) if d.status == ConnectionStatus::Open)).await {
            GatewayEvent::Connection(data) => {
                assert_eq!(data.user.unwrap().id, "15550009999@s.whatsapp.net")
            }
            other => panic!("unexpected {:?}", other),
        }
        match fx.next_kind("contacts").await {
            GatewayEvent::Contacts { data } => assert_eq!(data.len(), 1),
            other => panic!("unexpected {:?}", other),
        }

        for _ in 0..3 {
            fx.adapter
                .inject(AdapterEvent::Disconnected {
                    reason: DisconnectReason::ConnectionLost,
                    detail: None,
                })
                .await;
        }
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;

        let started = Instant::now();
        fx.next_kind("restart_requested").await;
        assert!(started.elapsed() >= Duration::from_millis(500));

        let exit = fx.handle.await.unwrap().unwrap();
        assert!(matches!(exit, ExitReason::Restart { .. }));
        assert_eq!(fx.adapter.connects(), 1);
        assert!(fx.adapter.is_torn_down());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_credentials_then_waits_cooldown() {
        let mut fx = Fixture::start(None, Some(registered())).await;
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;
        fx.status(ConnectionStatus::Open).await;

        let started = Instant::now();
        fx.adapter
            .inject(AdapterEvent::Disconnected {
                reason: DisconnectReason::LoggedOut,
                detail: None,
            })
            .await;
        match fx.next_kind("restart_requested").await {
            GatewayEvent::RestartRequested { reason } => assert_eq!(reason, "logged out"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(12));
        assert!(fx.store.load().await.unwrap().is_none());
        assert!(fx.adapter.is_torn_down());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_wipe_survives_late_rotation() {
        let mut fx = Fixture::start(None, Some(registered())).await;
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;
        fx.status(ConnectionStatus::Open).await;

        fx.adapter
            .inject(AdapterEvent::Disconnected {
                reason: DisconnectReason::LoggedOut,
                detail: None,
            })
            .await;
        let mut late = registered();
        late.creds = json!({"noise": "rotated after logout"});
        fx.adapter
            .inject(AdapterEvent::CredentialsUpdated { record: late })
            .await;
        fx.status(ConnectionStatus::Close).await;

        fx.next_kind("restart_requested").await;
        assert!(fx.adapter.is_torn_down());
        assert!(fx.store.load().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_suppresses_pending_restart() {
        let mut fx = Fixture::start(None, Some(registered())).await;
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;
        fx.status(ConnectionStatus::Open).await;
        fx.adapter
            .inject(AdapterEvent::Disconnected {
                reason: DisconnectReason::Conflict,
                detail: None,
            })
            .await;
        fx.status(ConnectionStatus::Close).await;

        let adapter = fx.adapter.clone();
        let (exit, rest) = fx.finish().await;
        assert_eq!(exit, ExitReason::Shutdown);
        assert!(rest.iter().all(|e| e.kind() != "restart_requested"));
        assert!(adapter.is_torn_down());
    }

    #[tokio::test(start_paused = true)]
    async fn send_after_close_errors_and_queue_keeps_draining() {
        let mut fx = Fixture::start(None, Some(registered())).await;
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;
        fx.status(ConnectionStatus::Open).await;

        fx.queue.push(send(1));
        match fx.next(|e| matches!(e, GatewayEvent::Ack(_) | GatewayEvent::Error(_))).await {
            GatewayEvent::Ack(data) => assert_eq!(data.id, CommandId::from(1)),
            other => panic!("unexpected {:?}", other),
        }

        fx.adapter
            .inject(AdapterEvent::Disconnected {
                reason: DisconnectReason::Conflict,
                detail: None,
            })
            .await;
        fx.status(ConnectionStatus::Close).await;

        fx.queue.push(send(2));
        fx.queue.push(send(3));
        fx.queue.push(GatewayCommand::GetContacts(GetContactsData {
            id: CommandId::from(4),
        }));

        for id in [2, 3] {
            match fx.next(|e| matches!(e, GatewayEvent::Ack(_) | GatewayEvent::Error(_))).await {
                GatewayEvent::Error(data) => {
                    assert_eq!(data.id, Some(CommandId::from(id)));
                    assert_eq!(data.message, "not connected");
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        match fx.next(|e| matches!(e, GatewayEvent::Ack(_) | GatewayEvent::Error(_))).await {
            GatewayEvent::Ack(data) => assert_eq!(data.id, CommandId::from(4)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fx.adapter.send_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn contact_burst_collapses_to_two_snapshots() {
        let mut fx = Fixture::start(None, Some(registered())).await;
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;
        fx.status(ConnectionStatus::Open).await;
        fx.next_kind("contacts").await; // flush on open

        for i in 0..500 {
            fx.adapter
                .inject(AdapterEvent::ContactsUpsert {
                    contacts: vec![contact(&format!("{}@s.whatsapp.net", 1000 + i), None)],
                })
                .await;
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        let (_, rest) = fx.finish().await;
        let snapshots: Vec<&GatewayEvent> = rest.iter().filter(|e| e.kind() == "contacts").collect();
        assert_eq!(snapshots.len(), 2);
        match snapshots[1] {
            GatewayEvent::Contacts { data } => assert_eq!(data.len(), 500),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn group_only_updates_emit_no_snapshot() {
        let mut fx = Fixture::start(None, Some(registered())).await;
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;
        fx.status(ConnectionStatus::Open).await;
        fx.next_kind("contacts").await;

        fx.adapter
            .inject(AdapterEvent::ChatsUpsert {
                chats: vec![ChatInfo {
                    id: "120363@g.us".to_string(),
                    name: Some("Team".to_string()),
                }],
            })
            .await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let (_, rest) = fx.finish().await;
        assert!(rest.iter().all(|e| e.kind() != "contacts"));
    }

    #[tokio::test(start_paused = true)]
    async fn history_sync_emits_capped_history_and_progress() {
        let mut fx = Fixture::start(None, Some(registered())).await;

        let messages = (0..70)
            .map(|i| HistoryMessage {
                id: format!("m{}", i),
                from_me: false,
                participant: None,
                push_name: Some("Bob".to_string()),
                timestamp: i,
                content: MessageContent::Text {
                    text: format!("msg {}", i),
                },
            })
            .collect();
        fx.adapter
            .inject(AdapterEvent::HistorySync {
                conversations: vec![HistoryConversation {
                    id: "222@s.whatsapp.net".to_string(),
                    name: None,
                    messages,
                }],
                contacts: vec![contact("333@lid", Some("Carol"))],
            })
            .await;
        fx.adapter
            .inject(AdapterEvent::ChatsUpsert {
                chats: vec![ChatInfo {
                    id: "120363@g.us".to_string(),
                    name: Some("Team".to_string()),
                }],
            })
            .await;

        match fx.next_kind("contact_sync_progress").await {
            GatewayEvent::ContactSyncProgress { count } => assert_eq!(count, 2),
            other => panic!("unexpected {:?}", other),
        }
        match fx.next_kind("history_messages").await {
            GatewayEvent::HistoryMessages { data } => {
                assert_eq!(data.len(), 50);
                assert_eq!(data[0].id, "m69");
                assert_eq!(data[0].sender_label.as_deref(), Some("Bob"));
            }
            other => panic!("unexpected {:?}", other),
        }

        fx.queue.push(GatewayCommand::GetContacts(GetContactsData {
            id: CommandId::from("all"),
        }));
        fx.next_kind("ack").await;
        let (_, rest) = fx.finish().await;
        // Groups never appear in snapshots.
        for event in rest {
            if let GatewayEvent::Contacts { data } = event {
                assert!(data.iter().all(|c| !c.address.ends_with("@g.us")));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn operator_phrase_becomes_agent_control() {
        let mut fx = Fixture::start(None, Some(registered())).await;
        fx.adapter
            .inject(live(
                "c1",
                "15550001111@s.whatsapp.net",
                true,
                MessageContent::Text {
                    text: "  Stop Orbit ".to_string(),
                },
            ))
            .await;
        fx.adapter
            .inject(live(
                "c2",
                "15550001111@s.whatsapp.net",
                false,
                MessageContent::Text {
                    text: "stop orbit".to_string(),
                },
            ))
            .await;

        match fx.next_kind("agent_control").await {
            GatewayEvent::AgentControl(data) => {
                assert_eq!(data.action, ControlAction::Stop);
                assert_eq!(data.from, "15550001111@s.whatsapp.net");
            }
            other => panic!("unexpected {:?}", other),
        }
        // From the contact, the same words are just a message.
        match fx.next_kind("message").await {
            GatewayEvent::Message(data) => {
                assert_eq!(data.id, "c2");
                assert_eq!(data.sender_label.as_deref(), Some("Ann"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_media_is_stored_once() {
        let mut fx = Fixture::start(None, Some(registered())).await;
        fx.adapter.add_media("a", b"jpeg bytes");
        fx.adapter.add_media("b", b"jpeg bytes");

        for (id, media) in [("m1", "a"), ("m2", "b")] {
            fx.adapter
                .inject(live(
                    id,
                    "15550001111@s.whatsapp.net",
                    false,
                    MessageContent::Image {
                        caption: None,
                        media: Some(MediaHandle {
                            id: media.to_string(),
                            mimetype: Some("image/jpeg".to_string()),
                        }),
                    },
                ))
                .await;
        }
        fx.adapter
            .inject(live("skip", "status@broadcast", false, MessageContent::Text { text: "story".to_string() }))
            .await;

        let mut paths = Vec::new();
        for _ in 0..2 {
            match fx.next_kind("message").await {
                GatewayEvent::Message(data) => {
                    assert_eq!(data.text, "[Sent an image]");
                    assert_eq!(data.media_type.as_deref(), Some("image"));
                    paths.push(data.media_path.unwrap());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(paths[0], paths[1]);
        assert_eq!(std::fs::read_dir(&fx.media_dir).unwrap().count(), 1);

        let (_, rest) = fx.finish().await;
        assert!(rest.iter().all(|e| e.kind() != "message"));
    }

    #[tokio::test(start_paused = true)]
    async fn rotated_credentials_are_persisted() {
        let mut fx = Fixture::start(None, None).await;
        let mut record = registered();
        record.creds = json!({"rotated": 2});

        fx.adapter
            .inject(AdapterEvent::CredentialsUpdated {
                record: record.clone(),
            })
            .await;
        fx.adapter.inject(AdapterEvent::Connecting).await;
        // Connecting is emitted at start and again for the injected event.
        fx.status(ConnectionStatus::Connecting).await;
        fx.status(ConnectionStatus::Connecting).await;

        assert_eq!(fx.store.load().await.unwrap(), Some(record));
    }

    #[tokio::test(start_paused = true)]
    async fn resweep_refreshes_snapshot_while_open() {
        let mut fx = Fixture::start(None, Some(registered())).await;
        fx.adapter.inject(AdapterEvent::Connected { identity: None }).await;
        fx.status(ConnectionStatus::Open).await;
        fx.next_kind("contacts").await;

        fx.adapter
            .set_cached_contacts(vec![contact("444@s.whatsapp.net", Some("Dana"))]);
        tokio::time::sleep(Duration::from_secs(301)).await;

        match fx.next_kind("contacts").await {
            GatewayEvent::Contacts { data } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].name.as_deref(), Some("Dana"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn control_phrases_are_case_insensitive() {
        let control = ControlConfig::default();
        assert_eq!(control_action(&control, "START ORBIT"), Some(ControlAction::Start));
        assert_eq!(control_action(&control, "stop orbit now"), None);
    }
}
