//! Download -> separate -> upload, for one source URL.

use crate::download::Downloader;
use crate::errors::{Error, Result};
use crate::separation::SeparationEngine;
use crate::storage::{ObjectStore, STEM_CONTENT_TYPE, object_key};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

/// Stem name -> public URL.
pub type StemUrls = BTreeMap<String, String>;

/// Sequential processing pipeline shared by all requests.
///
/// Every step completes before the next starts and nothing is retried. Each call works in a
/// fresh temporary directory which is removed when the call returns, fails, or is dropped.
#[derive(Clone)]
pub struct Pipeline {
    downloader: Downloader,
    engine: SeparationEngine,
    store: Arc<dyn ObjectStore>,
    work_dir: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(downloader: Downloader, engine: SeparationEngine, store: Arc<dyn ObjectStore>, work_dir: Option<PathBuf>) -> Self {
        Self {
            downloader,
            engine,
            store,
            work_dir,
        }
    }

    /// Stems produced for every successful request
    pub fn stems(&self) -> Vec<String> {
        self.engine.stems()
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    #[instrument(skip(self), err)]
    pub async fn process(&self, url: &str) -> Result<StemUrls> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("splitter-");
        let workdir = match &self.work_dir {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };

        self.process_in(url, workdir.path()).await
    }

    async fn process_in(&self, url: &str, workdir: &Path) -> Result<StemUrls> {
        let input = self.downloader.download(url, workdir).await.inspect_err(|e| {
            if matches!(e, Error::DownloadFailed { .. }) {
                crate::metrics::record_download_failure();
            }
        })?;

        let output_dir = workdir.join("output");
        tokio::fs::create_dir_all(&output_dir).await?;

        let stems = self.engine.separate(&input, &output_dir).await?;

        let mut keys = Vec::with_capacity(stems.len());
        for stem in stems {
            let content = tokio::fs::read(&stem.path).await?;
            let key = object_key(&stem.name, url);

            self.store.upload(&key, content.into(), STEM_CONTENT_TYPE).await?;
            crate::metrics::record_stem_uploaded(&stem.name);
            keys.push((stem.name, key));
        }

        let mut urls = StemUrls::new();
        for (name, key) in keys {
            urls.insert(name, self.store.public_url(&key).await?);
        }

        info!("Published {} stems", urls.len());
        Ok(urls)
    }
}
