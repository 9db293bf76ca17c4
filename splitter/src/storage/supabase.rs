//! Supabase-compatible storage REST backend.
//!
//! Endpoints used (relative to the project URL):
//!
//! - `POST /storage/v1/object/{bucket}/{key}` - upload, `x-upsert` controls overwriting
//! - `GET /storage/v1/object/public/{bucket}/{key}` - public object URL (formed, not fetched)
//! - `GET /storage/v1/bucket` - list buckets
//! - `POST /storage/v1/bucket` - create bucket

use super::{ALLOWED_MIME_TYPES, ObjectStore};
use crate::config::StorageConfig;
use crate::errors::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

#[derive(Debug, Deserialize)]
struct BucketSummary {
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateBucketRequest<'a> {
    id: &'a str,
    name: &'a str,
    public: bool,
    allowed_mime_types: &'a [&'a str],
}

pub struct SupabaseStorage {
    client: Client,
    base_url: Option<String>,
    service_key: Option<String>,
    bucket: String,
    upsert: bool,
}

impl SupabaseStorage {
    pub fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: crate::http_client(config.timeout)?,
            base_url: config.url.clone(),
            service_key: config.service_key.clone(),
            bucket: config.bucket.clone(),
            upsert: config.upsert,
        })
    }

    /// `<project url>/storage/v1/<segments...>`, with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let base = self.base_url.as_deref().ok_or_else(|| Error::Storage {
            message: "storage URL is not configured (set SUPABASE_URL)".to_string(),
        })?;
        let mut url = Url::parse(base).map_err(|e| Error::Storage {
            message: format!("invalid storage URL {base:?}: {e}"),
        })?;

        url.path_segments_mut()
            .map_err(|_| Error::Storage {
                message: format!("storage URL {base:?} cannot be a base"),
            })?
            .pop_if_empty()
            .extend(["storage", "v1"])
            .extend(segments);

        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let key = self.service_key.as_deref().ok_or_else(|| Error::Storage {
            message: "storage service key is not configured (set SUPABASE_SERVICE_KEY)".to_string(),
        })?;
        Ok(request.bearer_auth(key).header("apikey", key))
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Response> {
        let response = self.authorized(request)?.send().await.map_err(|e| Error::Storage {
            message: format!("{operation} failed: {e}"),
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::error!("Storage API returned {} for {}: {}", status, operation, body);
        Err(Error::Storage {
            message: format!("{operation} failed with {status}: {body}"),
        })
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    #[instrument(skip(self, content), fields(bytes = content.len()), err)]
    async fn upload(&self, key: &str, content: Bytes, content_type: &str) -> Result<()> {
        let url = self.endpoint(&["object", &self.bucket, key])?;
        debug!("Uploading to {}", url);

        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", if self.upsert { "true" } else { "false" })
            .body(content);

        self.send(request, &format!("upload of {key}")).await?;
        Ok(())
    }

    async fn public_url(&self, key: &str) -> Result<String> {
        Ok(self.endpoint(&["object", "public", &self.bucket, key])?.to_string())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket), err)]
    async fn ensure_bucket(&self) -> Result<bool> {
        let buckets: Vec<BucketSummary> = self
            .send(self.client.get(self.endpoint(&["bucket"])?), "list buckets")
            .await?
            .json()
            .await
            .map_err(|e| Error::Storage {
                message: format!("list buckets returned an unexpected body: {e}"),
            })?;

        if buckets.iter().any(|b| b.name == self.bucket) {
            info!("Bucket {} already exists", self.bucket);
            return Ok(false);
        }

        let body = CreateBucketRequest {
            id: &self.bucket,
            name: &self.bucket,
            public: true,
            allowed_mime_types: &ALLOWED_MIME_TYPES,
        };
        self.send(self.client.post(self.endpoint(&["bucket"])?).json(&body), "create bucket")
            .await?;

        info!("Created bucket {}", self.bucket);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage(base_url: Option<String>, upsert: bool) -> SupabaseStorage {
        let config = StorageConfig {
            url: base_url,
            service_key: Some("service-key".to_string()),
            upsert,
            ..Default::default()
        };
        SupabaseStorage::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_upload_sends_object_with_credentials() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/processed/vocals_song.wav"))
            .and(header("authorization", "Bearer service-key"))
            .and(header("apikey", "service-key"))
            .and(header("content-type", "audio/wav"))
            .and(header("x-upsert", "true"))
            .and(body_bytes(b"RIFF".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"Key": "processed/vocals_song.wav"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        storage(Some(mock_server.uri()), true)
            .upload("vocals_song.wav", Bytes::from_static(b"RIFF"), "audio/wav")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_rejection_is_storage_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-upsert", "false"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "statusCode": "409",
                "error": "Duplicate",
                "message": "The resource already exists"
            })))
            .mount(&mock_server)
            .await;

        let err = storage(Some(mock_server.uri()), false)
            .upload("vocals_song.wav", Bytes::from_static(b"RIFF"), "audio/wav")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Storage { .. }));
        assert!(err.user_message().contains("Duplicate"));
    }

    #[tokio::test]
    async fn test_missing_url_fails_lazily() {
        let storage = storage(None, true);

        let err = storage
            .upload("vocals_song.wav", Bytes::from_static(b"RIFF"), "audio/wav")
            .await
            .unwrap_err();
        assert!(err.user_message().contains("SUPABASE_URL"));
    }

    #[tokio::test]
    async fn test_public_url_encodes_key() {
        let storage = storage(Some("https://project.supabase.co/".to_string()), true);

        assert_eq!(
            storage.public_url("vocals_My Song.wav").await.unwrap(),
            "https://project.supabase.co/storage/v1/object/public/processed/vocals_My%20Song.wav"
        );
    }

    #[tokio::test]
    async fn test_ensure_bucket_creates_missing_bucket() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/bucket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": "avatars", "name": "avatars"}])))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/bucket"))
            .and(body_json(serde_json::json!({
                "id": "processed",
                "name": "processed",
                "public": true,
                "allowed_mime_types": ["audio/wav", "audio/x-wav"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "processed"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        assert!(storage(Some(mock_server.uri()), true).ensure_bucket().await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_bucket_skips_existing_bucket() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/bucket"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": "processed", "name": "processed"}])))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&mock_server)
            .await;

        assert!(!storage(Some(mock_server.uri()), true).ensure_bucket().await.unwrap());
    }
}
