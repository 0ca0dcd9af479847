//! Outbound command execution.
//!
//! Commands run strictly one at a time, in arrival order, with a fixed pause
//! after every attempt so the network never sees a burst. Each command ends
//! in exactly one `ack` or `error` event carrying its id.
//!
//! Only [`AdapterError::is_transient`] failures are retried, and only up to
//! the configured attempt budget. A command issued while the session is not
//! open fails at once instead of waiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use orbit_gateway_protocol::{GatewayCommand, GatewayEvent, SendMessageData};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, ChatPresence, OutboundContent, SessionAdapter};
use crate::address::{Address, AddressError};
use crate::config::QueueConfig;
use crate::ipc::EventSink;
use crate::lifecycle::ConnectionState;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("not connected")]
    NotConnected,

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Adapter(#[from] AdapterError),

    #[error("gateway is shutting down")]
    Unavailable,
}

/// Requests the worker makes of the supervisor.
#[derive(Debug)]
pub enum ControlRequest {
    /// Emit the full contact snapshot; replies with the exposed count.
    FlushContacts { reply: oneshot::Sender<usize> },
}

// ============================================================================
// CommandQueue
// ============================================================================

/// Producer side of the FIFO.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<GatewayCommand>,
    depth: Arc<AtomicUsize>,
}

impl CommandQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GatewayCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                depth: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Enqueue. Returns `false` if the worker is gone.
    pub fn push(&self, command: GatewayCommand) -> bool {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(command).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Commands waiting to run.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn dequeued(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// CommandWorker
// ============================================================================

pub struct CommandWorker {
    adapter: Arc<dyn SessionAdapter>,
    state: watch::Receiver<ConnectionState>,
    events: EventSink,
    control: mpsc::Sender<ControlRequest>,
    config: QueueConfig,
}

impl CommandWorker {
    pub fn new(
        adapter: Arc<dyn SessionAdapter>,
        state: watch::Receiver<ConnectionState>,
        events: EventSink,
        control: mpsc::Sender<ControlRequest>,
        config: QueueConfig,
    ) -> Self {
        Self {
            adapter,
            state,
            events,
            control,
            config,
        }
    }

    /// Drain the queue until it closes or `cancel` fires.
    ///
    /// On cancel, the command in flight and everything still queued end in
    /// an `error` event, so no id goes unanswered.
    pub fn spawn(
        self,
        queue: CommandQueue,
        mut rx: mpsc::UnboundedReceiver<GatewayCommand>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(command) => command,
                        None => break,
                    },
                };
                queue.dequeued();

                let id = command.id().clone();
                let event = tokio::select! {
                    event = self.execute(command) => event,
                    _ = cancel.cancelled() => {
                        GatewayEvent::command_error(id, CommandError::Unavailable.to_string())
                    }
                };
                self.events.emit(event).await;
            }

            rx.close();
            while let Ok(command) = rx.try_recv() {
                queue.dequeued();
                self.events
                    .emit(GatewayEvent::command_error(
                        command.id().clone(),
                        CommandError::Unavailable.to_string(),
                    ))
                    .await;
            }
            debug!("Command worker stopped");
        })
    }

    /// Run one command to its single terminal event.
    pub async fn execute(&self, command: GatewayCommand) -> GatewayEvent {
        let id = command.id().clone();
        let kind = command.kind();
        match self.run(&command).await {
            Ok(()) => {
                debug!(kind, id = %id, "Command succeeded");
                GatewayEvent::ack(id)
            }
            Err(e) => {
                warn!(kind, id = %id, error = %e, "Command failed");
                GatewayEvent::command_error(id, e.to_string())
            }
        }
    }

    async fn run(&self, command: &GatewayCommand) -> Result<(), CommandError> {
        let (to, content) = match command {
            GatewayCommand::GetContacts(_) => return self.flush_contacts().await,
            GatewayCommand::SendMessage(data) => (Address::parse(&data.to)?, send_content(data)?),
            GatewayCommand::React(data) => (
                Address::parse(&data.to)?,
                OutboundContent::Reaction {
                    message_id: data.message_id.clone(),
                    emoji: data.emoji.clone(),
                },
            ),
            GatewayCommand::DeleteMessage(data) => (
                Address::parse(&data.to)?,
                OutboundContent::Revoke {
                    message_id: data.message_id.clone(),
                },
            ),
        };

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if !self.state.borrow().is_open() {
                return Err(CommandError::NotConnected);
            }

            let result = self.attempt(&to, &content).await;
            tokio::time::sleep(self.config.pause()).await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    info!(attempt, max_attempts, error = %e, "Transient failure, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn attempt(&self, to: &Address, content: &OutboundContent) -> Result<(), AdapterError> {
        let presence = self.config.presence && matches!(content, OutboundContent::Text { .. });
        if presence {
            self.presence(to, ChatPresence::Composing).await;
        }
        let result = self.adapter.send(to, content).await;
        if presence {
            self.presence(to, ChatPresence::Paused).await;
        }
        result.map(|sent| debug!(to = %to, message_id = %sent.id, "Sent"))
    }

    /// Best effort; failures are only logged.
    async fn presence(&self, to: &Address, presence: ChatPresence) {
        if let Err(e) = self.adapter.send_presence(to, presence).await {
            debug!(to = %to, error = %e, "Presence update failed");
        }
    }

    async fn flush_contacts(&self) -> Result<(), CommandError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlRequest::FlushContacts { reply })
            .await
            .map_err(|_| CommandError::Unavailable)?;
        let count = rx.await.map_err(|_| CommandError::Unavailable)?;
        debug!(count, "Contacts flushed on request");
        Ok(())
    }
}

fn send_content(data: &SendMessageData) -> Result<OutboundContent, CommandError> {
    let text = data.text.as_deref().filter(|t| !t.is_empty());
    match (&data.media, text) {
        (Some(source), caption) => {
            let media_type = data.media_type.clone().ok_or_else(|| {
                CommandError::InvalidPayload("media requires mediaType".to_string())
            })?;
            Ok(OutboundContent::Media {
                source: source.clone(),
                media_type,
                caption: caption.map(str::to_string),
            })
        }
        (None, Some(text)) => Ok(OutboundContent::Text {
            text: text.to_string(),
        }),
        (None, None) => Err(CommandError::InvalidPayload(
            "send_message needs text or media".to_string(),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;
    use orbit_gateway_protocol::{CommandId, DeleteMessageData, GetContactsData, ReactData};
    use std::time::Duration;
    use tokio::time::Instant;

    struct Harness {
        adapter: Arc<MockAdapter>,
        state: watch::Sender<ConnectionState>,
        worker: CommandWorker,
        control_rx: mpsc::Receiver<ControlRequest>,
    }

    fn harness() -> Harness {
        let adapter = Arc::new(MockAdapter::new());
        let (state, state_rx) = watch::channel(ConnectionState::Open);
        let (events, _events_rx) = EventSink::channel(16);
        let (control, control_rx) = mpsc::channel(4);
        let worker = CommandWorker::new(
            adapter.clone(),
            state_rx,
            events,
            control,
            QueueConfig::default(),
        );
        Harness {
            adapter,
            state,
            worker,
            control_rx,
        }
    }

    fn send(id: i64, text: &str) -> GatewayCommand {
        GatewayCommand::SendMessage(SendMessageData {
            id: CommandId::from(id),
            to: "15550001111".to_string(),
            text: Some(text.to_string()),
            media: None,
            media_type: None,
        })
    }

    fn is_ack(event: &GatewayEvent) -> bool {
        matches!(event, GatewayEvent::Ack(_))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_budget() {
        let h = harness();
        h.adapter
            .script_send_failures([AdapterError::RateLimited, AdapterError::Timeout(Duration::from_secs(1))]);

        let start = Instant::now();
        let event = h.worker.execute(send(1, "hi")).await;
        assert!(is_ack(&event));
        assert_eq!(h.adapter.send_calls(), 3);
        // Pause after every attempt.
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(h.adapter.sent()[0].0.as_str(), "15550001111@s.whatsapp.net");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_bounded() {
        let h = harness();
        h.adapter.script_send_failures([
            AdapterError::ConnectionClosed,
            AdapterError::ConnectionClosed,
            AdapterError::ConnectionClosed,
            AdapterError::ConnectionClosed,
        ]);

        let event = h.worker.execute(send(7, "hi")).await;
        match event {
            GatewayEvent::Error(data) => {
                assert_eq!(data.id, Some(CommandId::from(7)));
                assert!(data.message.contains("connection closed"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(h.adapter.send_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let h = harness();
        h.adapter
            .script_send_failures([AdapterError::Rejected("not on network".to_string())]);
        let event = h.worker.execute(send(1, "hi")).await;
        assert!(matches!(event, GatewayEvent::Error(_)));
        assert_eq!(h.adapter.send_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_fast_when_not_open() {
        let h = harness();
        h.state.send_replace(ConnectionState::Closed);
        let event = h.worker.execute(send(1, "hi")).await;
        match event {
            GatewayEvent::Error(data) => assert_eq!(data.message, "not connected"),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(h.adapter.send_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_wraps_text_and_failures_are_swallowed() {
        let h = harness();
        assert!(is_ack(&h.worker.execute(send(1, "hi")).await));
        assert_eq!(
            h.adapter.presence(),
            vec![ChatPresence::Composing, ChatPresence::Paused]
        );

        h.adapter
            .fail_presence
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(is_ack(&h.worker.execute(send(2, "again")).await));
    }

    #[tokio::test(start_paused = true)]
    async fn react_and_delete_map_to_outbound_content() {
        let h = harness();
        let react = GatewayCommand::React(ReactData {
            id: CommandId::from(1),
            to: "1@s.whatsapp.net".to_string(),
            message_id: "M1".to_string(),
            emoji: "👍".to_string(),
        });
        let delete = GatewayCommand::DeleteMessage(DeleteMessageData {
            id: CommandId::from(2),
            to: "1@s.whatsapp.net".to_string(),
            message_id: "M1".to_string(),
        });
        assert!(is_ack(&h.worker.execute(react).await));
        assert!(is_ack(&h.worker.execute(delete).await));

        let sent = h.adapter.sent();
        assert!(matches!(sent[0].1, OutboundContent::Reaction { .. }));
        assert!(matches!(sent[1].1, OutboundContent::Revoke { .. }));
        // No typing indicator for reactions or revokes.
        assert!(h.adapter.presence().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_payloads_are_reported() {
        let h = harness();
        let empty = GatewayCommand::SendMessage(SendMessageData {
            id: CommandId::from(1),
            to: "1@s.whatsapp.net".to_string(),
            text: None,
            media: None,
            media_type: None,
        });
        let bad_address = GatewayCommand::SendMessage(SendMessageData {
            id: CommandId::from(2),
            to: "nobody".to_string(),
            text: Some("hi".to_string()),
            media: None,
            media_type: None,
        });
        let media_without_type = GatewayCommand::SendMessage(SendMessageData {
            id: CommandId::from(3),
            to: "1@s.whatsapp.net".to_string(),
            text: None,
            media: Some("/tmp/a.jpg".to_string()),
            media_type: None,
        });

        for command in [empty, bad_address, media_without_type] {
            assert!(matches!(h.worker.execute(command).await, GatewayEvent::Error(_)));
        }
        assert_eq!(h.adapter.send_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn get_contacts_goes_through_supervisor() {
        let h = harness();
        let mut control_rx = h.control_rx;
        let responder = tokio::spawn(async move {
            let Some(ControlRequest::FlushContacts { reply }) = control_rx.recv().await else {
                panic!("expected flush request");
            };
            reply.send(3).unwrap();
        });

        let event = h
            .worker
            .execute(GatewayCommand::GetContacts(GetContactsData {
                id: CommandId::from("c1"),
            }))
            .await;
        assert!(is_ack(&event));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn worker_drains_in_order_after_failures() {
        let h = harness();
        let (events, mut events_rx) = EventSink::channel(16);
        let worker = CommandWorker { events, ..h.worker };
        let (queue, rx) = CommandQueue::channel();
        let cancel = CancellationToken::new();
        let handle = worker.spawn(queue.clone(), rx, cancel.clone());

        h.state.send_replace(ConnectionState::Closed);
        queue.push(send(1, "a"));
        queue.push(send(2, "b"));
        let first = events_rx.recv().await.unwrap();
        let second = events_rx.recv().await.unwrap();
        assert!(matches!(first, GatewayEvent::Error(ref d) if d.id == Some(CommandId::from(1))));
        assert!(matches!(second, GatewayEvent::Error(ref d) if d.id == Some(CommandId::from(2))));

        h.state.send_replace(ConnectionState::Open);
        queue.push(send(3, "c"));
        let third = events_rx.recv().await.unwrap();
        assert!(matches!(third, GatewayEvent::Ack(ref d) if d.id == CommandId::from(3)));
        assert_eq!(queue.depth(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_answers_every_queued_command() {
        let h = harness();
        let (events, mut events_rx) = EventSink::channel(16);
        let worker = CommandWorker { events, ..h.worker };
        let (queue, rx) = CommandQueue::channel();
        let cancel = CancellationToken::new();
        let handle = worker.spawn(queue.clone(), rx, cancel.clone());

        for id in 1..=3 {
            queue.push(send(id, "x"));
        }
        cancel.cancel();
        handle.await.unwrap();

        let mut ids = Vec::new();
        while let Some(event) = events_rx.recv().await {
            match event {
                GatewayEvent::Ack(d) => ids.push(d.id),
                GatewayEvent::Error(d) => ids.push(d.id.unwrap()),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(ids, vec![CommandId::from(1), CommandId::from(2), CommandId::from(3)]);
        assert!(!queue.push(send(4, "late")));
    }
}
