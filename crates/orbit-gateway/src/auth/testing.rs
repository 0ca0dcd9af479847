//! Test doubles for credential storage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use serde_json::json;
use url::Url;

use super::{
    AuthStore, CredentialRecord, FileAuthStore, KeyCategory, KeyMap, KeyWrites, RemoteAuthStore,
    StorageError, StorageResult,
};

const BUCKET: &str = "auth";

// ============================================================================
// Mock object store server
// ============================================================================

#[derive(Default)]
struct MockState {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    list_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    max_delete_batch: AtomicUsize,
    fail_reads: AtomicBool,
    token: Mutex<Option<String>>,
}

/// In-process object storage server speaking the JSON object API.
pub(crate) struct MockObjectStore {
    base_url: Url,
    state: Arc<MockState>,
}

impl MockObjectStore {
    pub(crate) async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: Url::parse(&format!("http://{}/", addr)).unwrap(),
            state,
        }
    }

    pub(crate) fn store(&self, prefix: &str) -> RemoteAuthStore {
        RemoteAuthStore::new(
            Client::new(),
            self.base_url.clone(),
            BUCKET.to_string(),
            prefix.to_string(),
        )
    }

    pub(crate) fn object_count_under(&self, prefix: &str) -> usize {
        self.state
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.state.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn delete_calls(&self) -> usize {
        self.state.delete_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_delete_batch(&self) -> usize {
        self.state.max_delete_batch.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.state.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn require_token(&self, token: &str) {
        *self.state.token.lock().unwrap() = Some(token.to_string());
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let required = state.token.lock().unwrap().clone();
    if let Some(token) = required {
        let expected = format!("Bearer {}", token);
        let given = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if given != expected {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }

    let path = uri.path().trim_start_matches('/');
    let list_route = format!("object/list/{}", BUCKET);
    let bucket_route = format!("object/{}", BUCKET);
    let object_prefix = format!("object/{}/", BUCKET);

    if method == Method::POST && path == list_route {
        state.list_calls.fetch_add(1, Ordering::SeqCst);
        let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let prefix = format!("{}/", request["prefix"].as_str().unwrap_or(""));
        let limit = request["limit"].as_u64().unwrap_or(100) as usize;
        let offset = request["offset"].as_u64().unwrap_or(0) as usize;
        let names: Vec<serde_json::Value> = state
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .skip(offset)
            .take(limit)
            .map(|name| json!({"name": name, "id": name}))
            .collect();
        return (StatusCode::OK, axum::Json(names)).into_response();
    }

    if method == Method::DELETE && path == bucket_route {
        state.delete_calls.fetch_add(1, Ordering::SeqCst);
        let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let prefixes = request["prefixes"].as_array().cloned().unwrap_or_default();
        state
            .max_delete_batch
            .fetch_max(prefixes.len(), Ordering::SeqCst);
        let mut objects = state.objects.lock().unwrap();
        for p in prefixes {
            if let Some(p) = p.as_str() {
                objects.remove(p);
            }
        }
        return (StatusCode::OK, axum::Json(json!([]))).into_response();
    }

    let Some(key) = path.strip_prefix(&object_prefix) else {
        return (StatusCode::NOT_FOUND, "no route").into_response();
    };

    match method {
        Method::GET => {
            if state.fail_reads.load(Ordering::SeqCst) {
                return (StatusCode::INTERNAL_SERVER_ERROR, "backend down").into_response();
            }
            match state.objects.lock().unwrap().get(key) {
                Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
                None => (
                    StatusCode::BAD_REQUEST,
                    axum::Json(json!({
                        "statusCode": "404",
                        "error": "not_found",
                        "message": "Object not found"
                    })),
                )
                    .into_response(),
            }
        }
        Method::POST | Method::PUT => {
            state
                .objects
                .lock()
                .unwrap()
                .insert(key.to_string(), body.to_vec());
            (StatusCode::OK, axum::Json(json!({"Key": key}))).into_response()
        }
        _ => (StatusCode::METHOD_NOT_ALLOWED, "").into_response(),
    }
}

// ============================================================================
// Flaky store
// ============================================================================

/// File store whose operations can be made to fail on demand.
pub(crate) struct FlakyStore {
    inner: FileAuthStore,
    pub(crate) fail_saves: AtomicBool,
    pub(crate) fail_loads: AtomicBool,
    pub(crate) saves: AtomicUsize,
    pub(crate) clears: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new(inner: FileAuthStore) -> Self {
        Self {
            inner,
            fail_saves: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
        }
    }

    fn outage() -> StorageError {
        StorageError::Api {
            status: 503,
            message: "storage unavailable".to_string(),
        }
    }
}

#[async_trait]
impl AuthStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn load(&self) -> StorageResult<Option<CredentialRecord>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.load().await
    }

    async fn save(&self, record: &CredentialRecord) -> StorageResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.save(record).await
    }

    async fn get_keys(&self, category: KeyCategory, ids: &[String]) -> StorageResult<KeyMap> {
        self.inner.get_keys(category, ids).await
    }

    async fn set_keys(&self, category: KeyCategory, writes: KeyWrites) -> StorageResult<()> {
        self.inner.set_keys(category, writes).await
    }

    async fn clear(&self) -> StorageResult<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear().await
    }
}
