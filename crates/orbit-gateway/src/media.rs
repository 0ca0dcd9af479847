//! Content-addressed attachment storage.
//!
//! Files are named `<sha256-hex>.<ext>`. Storing bytes whose digest already
//! has a file reuses it without writing, so re-delivered attachments cost
//! nothing. Blobs are immutable and never deleted here.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::auth::StorageError;
use crate::auth::file::replace_file;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media directory error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write media: {0}")]
    Write(#[from] StorageError),
}

/// A stored attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    pub path: PathBuf,
    pub digest: String,
    /// An identical blob was already on disk.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    dir: PathBuf,
}

impl MediaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn store(&self, data: &[u8], mimetype: Option<&str>) -> Result<StoredMedia, MediaError> {
        let digest = hex_digest(data);

        if let Some(path) = self.find_existing(&digest).await? {
            debug!(digest = %digest, "Reusing stored media");
            return Ok(StoredMedia {
                path,
                digest,
                reused: true,
            });
        }

        let path = self
            .dir
            .join(format!("{}.{}", digest, extension_for(mimetype)));
        replace_file(&path, data).await?;
        debug!(digest = %digest, bytes = data.len(), "Stored media");

        Ok(StoredMedia {
            path,
            digest,
            reused: false,
        })
    }

    async fn find_existing(&self, digest: &str) -> Result<Option<PathBuf>, MediaError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(MediaError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        while let Some(entry) = entries.next_entry().await.map_err(|source| MediaError::Io {
            path: self.dir.clone(),
            source,
        })? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name
                .strip_prefix(digest)
                .is_some_and(|rest| rest.starts_with('.'))
            {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

fn hex_digest(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// File extension for a content type. Parameters (`; codecs=opus`) are ignored.
pub fn extension_for(mimetype: Option<&str>) -> &'static str {
    let essence = mimetype
        .and_then(|m| m.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match essence.as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/aac" => "m4a",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}
