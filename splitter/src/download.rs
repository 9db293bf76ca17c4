//! Fetching the source audio into a request's working directory.

use crate::config::DownloadConfig;
use crate::errors::{Error, Result};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use url::Url;

/// Downloads source audio over HTTP.
///
/// One GET per call, whole body buffered in memory, no retries. Anything other than a `200 OK`
/// (after redirects) counts as a failed download, as do transport errors and unparseable URLs.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
    input_name: String,
    default_extension: String,
}

impl Downloader {
    pub fn new(config: &DownloadConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: crate::http_client(config.timeout)?,
            input_name: config.input_name.clone(),
            default_extension: config.default_extension.clone(),
        })
    }

    /// Download `url` into `dir`, returning the path of the written file.
    #[instrument(skip(self, dir), err)]
    pub async fn download(&self, url: &str, dir: &Path) -> Result<PathBuf> {
        let failed = |reason: String| Error::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let response = self.client.get(url).send().await.map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(failed(format!("HTTP {status}")));
        }

        let body = response.bytes().await.map_err(|e| failed(format!("Failed to read response body: {e}")))?;
        debug!("Downloaded {} bytes", body.len());

        let path = dir.join(self.input_file_name(url));
        tokio::fs::write(&path, &body).await?;

        Ok(path)
    }

    /// Name of the staged input file: the configured base name plus the source URL's extension.
    fn input_file_name(&self, url: &str) -> String {
        let extension = Url::parse(url)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .and_then(|name| Path::new(&name).extension().map(|e| e.to_string_lossy().to_lowercase()))
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| self.default_extension.clone());

        format!("{}.{}", self.input_name, extension)
    }
}
