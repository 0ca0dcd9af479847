//! JSON Lines transport to the orchestrator.
//!
//! Events are written by a single task so lines never interleave. An input
//! line that fails to parse never takes the gateway down. If it carries an
//! `id`, the sender gets an `error` for it; otherwise it is logged and
//! skipped.

use orbit_gateway_protocol::{
    GatewayCommand, GatewayEvent, decode_command, encode_event, reject_command,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::CommandQueue;

/// Outbound event buffer.
pub const EVENT_BUFFER: usize = 1024;

/// Cloneable handle for emitting events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<GatewayEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<GatewayEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: GatewayEvent) {
        let kind = event.kind();
        if self.tx.send(event).await.is_err() {
            warn!(kind, "Event writer gone, dropping event");
        }
    }
}

/// Write events as JSON lines until every sink is dropped.
pub fn spawn_writer<W>(mut rx: mpsc::Receiver<GatewayEvent>, mut writer: W) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let line = match encode_event(&event) {
                Ok(line) => line,
                Err(e) => {
                    error!(kind = event.kind(), error = %e, "Failed to encode event");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!(error = %e, "Failed to write event, stopping writer");
                break;
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, "Failed to flush events, stopping writer");
                break;
            }
        }
        debug!("Event writer stopped");
    })
}

/// Read command lines and enqueue them until input closes.
///
/// Lines that are not valid commands are answered on `events` when they
/// name an `id`.
pub fn spawn_reader<R>(reader: R, queue: CommandQueue, events: EventSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Command input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read command input");
                    break;
                }
            };

            match decode_command(&line) {
                Ok(Some(command)) => enqueue(&queue, command),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, line = %truncate(&line, 200), "Rejecting malformed command");
                    if let Some(reply) = reject_command(&line, &e) {
                        events.emit(reply).await;
                    }
                }
            }
        }
    })
}

fn enqueue(queue: &CommandQueue, command: GatewayCommand) {
    debug!(kind = command.kind(), id = %command.id(), "Command received");
    if !queue.push(command) {
        warn!("Command queue closed, dropping command");
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
