//! Remote object-storage credential backend.
//!
//! Objects live under `<bucket>/<prefix>/` and are addressed with the same
//! names as the filesystem backend. The HTTP surface is the JSON object API:
//!
//! - `GET    /object/{bucket}/{path}`: download
//! - `POST   /object/{bucket}/{path}`: upload (`x-upsert: true`)
//! - `POST   /object/list/{bucket}`: paginated listing of a prefix
//! - `DELETE /object/{bucket}`: batch delete (`{"prefixes": [...]}`)

use std::path::Path;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::file::DEFAULT_WRITE_CONCURRENCY;
use super::{
    AuthStore, CREDS_OBJECT, CredentialRecord, KeyCategory, KeyMap, KeyWrites, StorageError,
    StorageResult, key_object_name,
};
use crate::config::RemoteAuthConfig;

/// Credential store backed by a remote bucket.
#[derive(Debug, Clone)]
pub struct RemoteAuthStore {
    client: Client,
    base_url: Url,
    bucket: String,
    token: Option<String>,
    prefix: String,
    delete_batch_size: usize,
    list_page_size: usize,
    write_concurrency: usize,
}

impl RemoteAuthStore {
    pub fn new(client: Client, base_url: Url, bucket: String, prefix: String) -> Self {
        Self {
            client,
            base_url,
            bucket,
            token: None,
            prefix: prefix.trim_matches('/').to_string(),
            delete_batch_size: RemoteAuthConfig::DEFAULT_DELETE_BATCH,
            list_page_size: RemoteAuthConfig::DEFAULT_LIST_PAGE,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }

    /// Build from configuration. The key prefix defaults to the auth
    /// directory's base name so each account gets its own folder.
    pub fn from_config(config: &RemoteAuthConfig, auth_dir: &Path) -> StorageResult<Self> {
        let raw_url = config
            .url
            .as_deref()
            .ok_or_else(|| StorageError::Config("remote backend requires a url".to_string()))?;
        let base_url = Url::parse(raw_url)
            .map_err(|e| StorageError::Config(format!("invalid url {:?}: {}", raw_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StorageError::Config(format!(
                "url {:?} cannot be a base",
                raw_url
            )));
        }

        let prefix = config
            .prefix
            .clone()
            .or_else(|| {
                auth_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "default".to_string());

        let mut store = Self::new(Client::new(), base_url, config.bucket.clone(), prefix)
            .with_batch_limits(config.delete_batch_size, config.list_page_size);
        store.token = config.token.clone();
        Ok(store)
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_batch_limits(mut self, delete_batch_size: usize, list_page_size: usize) -> Self {
        self.delete_batch_size = delete_batch_size.max(1);
        self.list_page_size = list_page_size.max(1);
        self
    }

    #[must_use]
    pub fn with_write_concurrency(mut self, limit: usize) -> Self {
        self.write_concurrency = limit.max(1);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn object_path(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Build an endpoint URL from path segments, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            for segment in segments {
                for part in segment.split('/') {
                    path.push(part);
                }
            }
        }
        url
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder
                .header("Authorization", format!("Bearer {}", token))
                .header("apikey", token),
            None => builder,
        }
    }

    async fn get_object(&self, name: &str) -> StorageResult<Option<serde_json::Value>> {
        let path = self.object_path(name);
        let url = self.endpoint(&["object", &self.bucket, &path]);
        let response = self.authorize(self.client.get(url)).send().await?;

        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await?;
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }

        let message = response.text().await.unwrap_or_default();
        if is_not_found(status, &message) {
            return Ok(None);
        }
        Err(StorageError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn put_object(&self, name: &str, value: &serde_json::Value) -> StorageResult<()> {
        let path = self.object_path(name);
        let url = self.endpoint(&["object", &self.bucket, &path]);
        let body = serde_json::to_vec(value)?;
        let response = self
            .authorize(self.client.post(url))
            .header("Content-Type", "application/json")
            .header("x-upsert", "true")
            .body(body)
            .send()
            .await?;
        check_status(response).await
    }

    /// List every object name under the prefix, one page at a time.
    async fn list_all(&self) -> StorageResult<Vec<String>> {
        let url = self.endpoint(&["object", "list", &self.bucket]);
        let mut names = Vec::new();
        let mut offset = 0;

        loop {
            let request = ListRequest {
                prefix: &self.prefix,
                limit: self.list_page_size,
                offset,
                sort_by: SortBy {
                    column: "name",
                    order: "asc",
                },
            };
            let response = self
                .authorize(self.client.post(url.clone()))
                .json(&request)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(StorageError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let page: Vec<ListedObject> = response.json().await?;
            let page_len = page.len();
            names.extend(page.into_iter().map(|o| self.object_path(&o.name)));

            if page_len < self.list_page_size {
                break;
            }
            offset += page_len;
        }

        Ok(names)
    }

    /// Delete object paths in batches of at most `delete_batch_size`.
    async fn delete_paths(&self, paths: &[String]) -> StorageResult<()> {
        let url = self.endpoint(&["object", &self.bucket]);
        for chunk in paths.chunks(self.delete_batch_size) {
            debug!(count = chunk.len(), prefix = %self.prefix, "Deleting auth objects");
            let response = self
                .authorize(self.client.delete(url.clone()))
                .json(&DeleteRequest { prefixes: chunk })
                .send()
                .await?;
            check_status(response).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuthStore for RemoteAuthStore {
    fn backend(&self) -> &'static str {
        "remote"
    }

    async fn load(&self) -> StorageResult<Option<CredentialRecord>> {
        match self.get_object(CREDS_OBJECT).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &CredentialRecord) -> StorageResult<()> {
        let value = serde_json::to_value(record)?;
        self.put_object(CREDS_OBJECT, &value).await
    }

    async fn get_keys(&self, category: KeyCategory, ids: &[String]) -> StorageResult<KeyMap> {
        let found: Vec<(String, Option<serde_json::Value>)> = stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let value = self.get_object(&key_object_name(category, &id)).await?;
                Ok::<_, StorageError>((id, value))
            })
            .buffer_unordered(self.write_concurrency)
            .try_collect()
            .await?;

        Ok(found
            .into_iter()
            .filter_map(|(id, value)| value.map(|v| (id, v)))
            .collect())
    }

    async fn set_keys(&self, category: KeyCategory, writes: KeyWrites) -> StorageResult<()> {
        let mut deletes = Vec::new();
        let mut uploads = Vec::new();
        for (id, value) in writes {
            let name = key_object_name(category, &id);
            match value {
                Some(value) => uploads.push((name, value)),
                None => deletes.push(self.object_path(&name)),
            }
        }

        stream::iter(uploads)
            .map(|(name, value)| async move { self.put_object(&name, &value).await })
            .buffer_unordered(self.write_concurrency)
            .try_collect::<Vec<()>>()
            .await?;

        if !deletes.is_empty() {
            self.delete_paths(&deletes).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        // Listing completes before any delete so offsets never shift under us.
        let paths = self.list_all().await?;
        if paths.is_empty() {
            return Ok(());
        }
        debug!(count = paths.len(), prefix = %self.prefix, "Clearing remote auth state");
        self.delete_paths(&paths).await
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: usize,
    offset: usize,
    sort_by: SortBy,
}

#[derive(Serialize)]
struct SortBy {
    column: &'static str,
    order: &'static str,
}

#[derive(Deserialize)]
struct ListedObject {
    name: String,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    prefixes: &'a [String],
}

// ============================================================================
// Helpers
// ============================================================================

/// Object APIs report a missing object either as 404, or as 400 with a
/// `not_found` error body.
fn is_not_found(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::NOT_FOUND {
        return true;
    }
    if status == StatusCode::BAD_REQUEST
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
    {
        let error = value.get("error").and_then(|e| e.as_str()).unwrap_or("");
        let code = value
            .get("statusCode")
            .map(|c| c.to_string().trim_matches('"').to_string())
            .unwrap_or_default();
        return error.eq_ignore_ascii_case("not_found") || code == "404";
    }
    false
}

async fn check_status(response: reqwest::Response) -> StorageResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let message = response.text().await.unwrap_or_default();
    Err(StorageError::Api {
        status: status.as_u16(),
        message,
    })
}
