//! Filesystem credential backend.
//!
//! One JSON file per object inside the auth directory:
//! - `creds.json` for the credential record
//! - `<category>-<id>.json` for each key
//!
//! Every write goes through [`replace_file`], so a crash mid-write never
//! leaves a truncated key behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{
    AuthStore, CREDS_OBJECT, CredentialRecord, KeyCategory, KeyMap, KeyWrites, StorageError,
    StorageResult, key_object_name,
};

/// Default cap on simultaneous key writes.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 20;

/// Credential store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FileAuthStore {
    dir: PathBuf,
    write_concurrency: usize,
}

impl FileAuthStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }

    #[must_use]
    pub fn with_write_concurrency(mut self, limit: usize) -> Self {
        self.write_concurrency = limit.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read_object(&self, name: &str) -> StorageResult<Option<serde_json::Value>> {
        let path = self.dir.join(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) => match StorageError::file_io(&path, e) {
                StorageError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn write_object(&self, name: &str, value: &serde_json::Value) -> StorageResult<()> {
        let data = serde_json::to_vec(value)?;
        replace_file(&self.dir.join(name), &data).await
    }

    async fn remove_object(&self, name: &str) -> StorageResult<()> {
        let path = self.dir.join(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) => match StorageError::file_io(&path, e) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}

#[async_trait]
impl AuthStore for FileAuthStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn load(&self) -> StorageResult<Option<CredentialRecord>> {
        match self.read_object(CREDS_OBJECT).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &CredentialRecord) -> StorageResult<()> {
        let value = serde_json::to_value(record)?;
        self.write_object(CREDS_OBJECT, &value).await
    }

    async fn get_keys(&self, category: KeyCategory, ids: &[String]) -> StorageResult<KeyMap> {
        let found: Vec<(String, Option<serde_json::Value>)> = stream::iter(ids.iter().cloned())
            .map(|id| async move {
                let value = self.read_object(&key_object_name(category, &id)).await?;
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
        stream::iter(writes)
            .map(|(id, value)| async move {
                let name = key_object_name(category, &id);
                match value {
                    Some(value) => self.write_object(&name, &value).await,
                    None => self.remove_object(&name).await,
                }
            })
            .buffer_unordered(self.write_concurrency)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::file_io(&self.dir, e)),
        };

        // List everything first, then delete.
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::file_io(&self.dir, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        stream::iter(names)
            .map(|name| async move { self.remove_object(&name).await })
            .buffer_unordered(self.write_concurrency)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }
}

/// Replace `path` with `data` so readers see either the old or the new
/// contents, never a torn write.
///
/// Missing parent directories are created. The bytes are staged in a hidden
/// sibling (`.<ulid>.partial`), synced, then renamed over `path`. A failed
/// attempt removes its staging file and reports the destination path.
pub(crate) async fn replace_file(path: &Path, data: &[u8]) -> StorageResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .await
        .map_err(|e| StorageError::file_io(dir, e))?;

    let staging = dir.join(format!(".{}.partial", ulid::Ulid::new()));
    let written = async {
        let mut file = fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&staging, path).await
    }
    .await;

    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&staging).await
            && cleanup.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %staging.display(), error = %cleanup, "Failed to remove staging file");
        }
        return Err(StorageError::file_io(path, e));
    }
    Ok(())
}
