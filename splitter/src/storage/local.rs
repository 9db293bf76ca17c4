//! Local filesystem object store.
//!
//! Objects are written to `<local_root>/<bucket>/<key>` and published as
//! `<public_base_url>/<bucket>/<key>`. The application serves `local_root` itself when this
//! backend is selected. Useful for development and testing.

use super::ObjectStore;
use crate::config::StorageConfig;
use crate::errors::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use url::Url;

pub struct LocalObjectStore {
    bucket_path: PathBuf,
    public_base_url: Url,
    bucket: String,
    upsert: bool,
}

impl LocalObjectStore {
    pub fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        Ok(Self {
            bucket_path: config.local_root.join(&config.bucket),
            public_base_url: Url::parse(&config.public_base_url)?,
            bucket: config.bucket.clone(),
            upsert: config.upsert,
        })
    }

    /// Keys are flat file names; anything that could escape the bucket directory is refused.
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(Error::Storage {
                message: format!("invalid object key {key:?}"),
            });
        }
        Ok(self.bucket_path.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, key: &str, content: Bytes, _content_type: &str) -> Result<()> {
        let path = self.object_path(key)?;

        if !fs::try_exists(&self.bucket_path).await? {
            return Err(Error::Storage {
                message: format!("bucket {} not found", self.bucket),
            });
        }

        if !self.upsert && fs::try_exists(&path).await? {
            return Err(Error::Storage {
                message: format!("object {key} already exists in bucket {}", self.bucket),
            });
        }

        let mut file = fs::File::create(&path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;

        Ok(())
    }

    async fn public_url(&self, key: &str) -> Result<String> {
        let mut url = self.public_base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Storage {
                message: format!("public base URL {} cannot be a base", self.public_base_url),
            })?
            .pop_if_empty()
            .push(&self.bucket)
            .push(key);
        Ok(url.to_string())
    }

    async fn ensure_bucket(&self) -> Result<bool> {
        if fs::try_exists(&self.bucket_path).await? {
            return Ok(false);
        }
        fs::create_dir_all(&self.bucket_path).await?;
        Ok(true)
    }
}
