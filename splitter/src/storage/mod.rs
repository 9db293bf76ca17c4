//! Object storage for separated stems.
//!
//! Stems are published under `<stem>_<source stem>.wav`, where the source stem is the last path
//! segment of the source URL without its extension. Keys carry no request-specific component, so
//! two sources sharing a file name (or the same source submitted twice) map to the same objects;
//! with `upsert` enabled the later upload overwrites the earlier one.

pub mod local;
pub mod supabase;

use crate::config::{StorageBackend, StorageConfig};
use crate::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use url::Url;

/// MIME type stems are uploaded with.
pub const STEM_CONTENT_TYPE: &str = "audio/wav";

/// MIME types a bootstrapped bucket accepts.
pub const ALLOWED_MIME_TYPES: [&str; 2] = ["audio/wav", "audio/x-wav"];

/// Trait for object storage backends
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `content` under `key` in the configured bucket
    async fn upload(&self, key: &str, content: Bytes, content_type: &str) -> Result<()>;

    /// Publicly reachable URL of the object stored under `key`
    async fn public_url(&self, key: &str) -> Result<String>;

    /// Create the configured bucket if it does not exist. Returns whether it was created.
    async fn ensure_bucket(&self) -> Result<bool>;
}

/// Build the configured storage backend.
///
/// Missing credentials are not an error here; they surface on the first storage call.
pub fn build_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config.backend {
        StorageBackend::Supabase => Ok(Arc::new(supabase::SupabaseStorage::new(config)?)),
        StorageBackend::Local => Ok(Arc::new(local::LocalObjectStore::new(config)?)),
    }
}

/// Last path segment of `source_url` with its final extension removed.
///
/// Query strings and fragments are ignored. Falls back to `"audio"` when nothing usable remains.
pub fn source_stem(source_url: &str) -> String {
    let last_segment = match Url::parse(source_url) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .unwrap_or_default(),
        Err(_) => source_url.rsplit('/').next().unwrap_or_default().to_string(),
    };

    let decoded = percent_decode(&last_segment);
    let stem = Path::new(&decoded)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    if stem.is_empty() { "audio".to_string() } else { stem }
}

/// Object key a stem of `source_url` is stored under.
pub fn object_key(stem_name: &str, source_url: &str) -> String {
    format!("{}_{}.wav", stem_name, source_stem(source_url))
}

fn percent_decode(segment: &str) -> String {
    url::form_urlencoded::parse(format!("s={}", segment.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| segment.to_string())
}
