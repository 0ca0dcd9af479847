//! Scripted adapter for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{
    AdapterError, AdapterEvent, AdapterResult, ChatPresence, ConnectRequest, ContactInfo,
    MediaHandle, OutboundContent, SentMessage, SessionAdapter,
};
use crate::address::Address;

pub(crate) struct MockAdapter {
    events_tx: mpsc::Sender<AdapterEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<AdapterEvent>>>,
    connects: AtomicUsize,
    send_calls: AtomicUsize,
    /// Results for successive sends. Empty means success.
    send_script: Mutex<VecDeque<AdapterError>>,
    sent: Mutex<Vec<(Address, OutboundContent)>>,
    presence: Mutex<Vec<ChatPresence>>,
    pub(crate) fail_presence: AtomicBool,
    pub(crate) pairing_code: Mutex<String>,
    cached: Mutex<Vec<ContactInfo>>,
    media: Mutex<HashMap<String, Bytes>>,
    unsubscribed: AtomicBool,
    closed: AtomicBool,
    pub(crate) last_request: Mutex<Option<(bool, Option<String>)>>,
}

impl MockAdapter {
    pub(crate) fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(4096);
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connects: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            send_script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            presence: Mutex::new(Vec::new()),
            fail_presence: AtomicBool::new(false),
            pairing_code: Mutex::new("ABCD-1234".to_string()),
            cached: Mutex::new(Vec::new()),
            media: Mutex::new(HashMap::new()),
            unsubscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_request: Mutex::new(None),
        }
    }

    /// Queue an event as if the library had emitted it.
    pub(crate) async fn inject(&self, event: AdapterEvent) {
        self.events_tx.send(event).await.unwrap();
    }

    /// Make the next sends fail with these errors, in order.
    pub(crate) fn script_send_failures(&self, errors: impl IntoIterator<Item = AdapterError>) {
        self.send_script.lock().unwrap().extend(errors);
    }

    pub(crate) fn set_cached_contacts(&self, contacts: Vec<ContactInfo>) {
        *self.cached.lock().unwrap() = contacts;
    }

    pub(crate) fn add_media(&self, id: &str, data: &[u8]) {
        self.media
            .lock()
            .unwrap()
            .insert(id.to_string(), Bytes::copy_from_slice(data));
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<(Address, OutboundContent)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn presence(&self) -> Vec<ChatPresence> {
        self.presence.lock().unwrap().clone()
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst) && self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionAdapter for MockAdapter {
    async fn connect(&self, request: ConnectRequest) -> AdapterResult<mpsc::Receiver<AdapterEvent>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some((request.credentials.is_some(), request.phone));
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AdapterError::Protocol("already connected".to_string()))
    }

    async fn request_pairing_code(&self, _phone: &str) -> AdapterResult<String> {
        Ok(self.pairing_code.lock().unwrap().clone())
    }

    async fn send(&self, to: &Address, content: &OutboundContent) -> AdapterResult<SentMessage> {
        let n = self.send_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.send_script.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push((to.clone(), content.clone()));
        Ok(SentMessage {
            id: format!("SENT{}", n),
        })
    }

    async fn send_presence(&self, _to: &Address, presence: ChatPresence) -> AdapterResult<()> {
        if self.fail_presence.load(Ordering::SeqCst) {
            return Err(AdapterError::Rejected("presence unavailable".to_string()));
        }
        self.presence.lock().unwrap().push(presence);
        Ok(())
    }

    async fn download_media(&self, media: &MediaHandle) -> AdapterResult<Bytes> {
        self.media
            .lock()
            .unwrap()
            .get(&media.id)
            .cloned()
            .ok_or_else(|| AdapterError::Rejected(format!("no media {}", media.id)))
    }

    async fn cached_contacts(&self) -> AdapterResult<Vec<ContactInfo>> {
        Ok(self.cached.lock().unwrap().clone())
    }

    async fn unsubscribe_all(&self) {
        self.unsubscribed.store(true, Ordering::SeqCst);
    }

    async fn close(&self) -> AdapterResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
