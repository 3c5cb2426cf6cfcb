//! Google Cloud Storage backend over the JSON API.
//!
//! Provides [`GcsBackend`], a [`StorageBackend`] implementation, and
//! [`GcsMetadataSource`], a [`BucketMetadataSource`] that reads a bucket's
//! requester-pays billing flag.
//!
//! This module is only compiled when the `gcp` feature is enabled:
//!
//! ```toml
//! [dependencies]
//! cirro-core = { version = "0.1", features = ["gcp"] }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use gcp_auth::TokenProvider;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::location::BucketMetadataSource;
use crate::storage::{ObjectKey, ObjectMeta, RequestOptions, StorageBackend};

const API_ROOT: &str = "https://storage.googleapis.com/storage/v1";
const UPLOAD_ROOT: &str = "https://storage.googleapis.com/upload/storage/v1";
const SCOPES: &[&str] = &["https://www.googleapis.com/auth/devstorage.read_write"];

/// Characters escaped in object names used as path segments.
const OBJECT_NAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Shared authenticated HTTP client for the storage JSON API.
#[derive(Clone)]
struct GcsClient {
    token_provider: Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

impl GcsClient {
    async fn new() -> Result<Self> {
        let token_provider = gcp_auth::provider()
            .await
            .map_err(|e| Error::storage_with_source("failed to initialize GCP auth", e))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::storage_with_source("failed to create HTTP client", e))?;

        Ok(Self {
            token_provider,
            client,
        })
    }

    async fn access_token(&self) -> Result<String> {
        let token = self
            .token_provider
            .token(SCOPES)
            .await
            .map_err(|e| Error::storage_with_source("failed to get GCP access token", e))?;
        Ok(token.as_str().to_string())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.access_token().await?;
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::storage_with_source("storage API request failed", e))
    }
}

/// Storage API error response.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

async fn api_error(context: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());

    if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(&body) {
        return Error::storage(format!(
            "{context}: {} ({})",
            parsed.error.message, parsed.error.code
        ));
    }
    Error::storage(format!("{context}: {status} - {body}"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    bucket: String,
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    generation: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

impl ObjectResource {
    fn into_meta(self) -> ObjectMeta {
        ObjectMeta {
            key: ObjectKey::new(self.bucket, &self.name),
            size: self.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            generation: self.generation.unwrap_or_default(),
            content_type: self.content_type,
            updated: self.updated,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

fn object_url(key: &ObjectKey) -> String {
    format!(
        "{API_ROOT}/b/{}/o/{}",
        key.bucket,
        utf8_percent_encode(&key.name, OBJECT_NAME)
    )
}

fn billing_query(options: &RequestOptions) -> Vec<(&'static str, String)> {
    options
        .user_project
        .iter()
        .map(|p| ("userProject", p.clone()))
        .collect()
}

/// Google Cloud Storage backend.
#[derive(Clone)]
pub struct GcsBackend {
    client: GcsClient,
}

impl std::fmt::Debug for GcsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsBackend")
            .field("token_provider", &"<TokenProvider>")
            .finish_non_exhaustive()
    }
}

impl GcsBackend {
    /// Creates a backend using application default credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if GCP authentication cannot be initialized.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            client: GcsClient::new().await?,
        })
    }
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn get(&self, key: &ObjectKey, options: &RequestOptions) -> Result<Bytes> {
        let request = self
            .client
            .client
            .get(object_url(key))
            .query(&[("alt", "media")])
            .query(&billing_query(options));
        let response = self.client.send(request).await?;

        match response.status() {
            s if s.is_success() => response
                .bytes()
                .await
                .map_err(|e| Error::storage_with_source("failed to read object body", e)),
            reqwest::StatusCode::NOT_FOUND => {
                Err(Error::NotFound(format!("object not found: {key}")))
            }
            _ => Err(api_error("object read failed", response).await),
        }
    }

    async fn put(
        &self,
        key: &ObjectKey,
        data: Bytes,
        options: &RequestOptions,
    ) -> Result<ObjectMeta> {
        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let request = self
            .client
            .client
            .post(format!("{UPLOAD_ROOT}/b/{}/o", key.bucket))
            .query(&[("uploadType", "media"), ("name", key.name.as_str())])
            .query(&billing_query(options))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data);
        let response = self.client.send(request).await?;

        if !response.status().is_success() {
            return Err(api_error("object write failed", response).await);
        }
        let resource: ObjectResource = response
            .json()
            .await
            .map_err(|e| Error::storage_with_source("failed to parse upload response", e))?;
        Ok(resource.into_meta())
    }

    async fn delete(&self, key: &ObjectKey, options: &RequestOptions) -> Result<()> {
        let request = self
            .client
            .client
            .delete(object_url(key))
            .query(&billing_query(options));
        let response = self.client.send(request).await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Ok(()),
            _ => Err(api_error("object delete failed", response).await),
        }
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        options: &RequestOptions,
    ) -> Result<Vec<ObjectMeta>> {
        let mut listed = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .client
                .get(format!("{API_ROOT}/b/{bucket}/o"))
                .query(&[("prefix", prefix)])
                .query(&billing_query(options));
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = self.client.send(request).await?;
            if !response.status().is_success() {
                return Err(api_error("object listing failed", response).await);
            }
            let page: ObjectList = response
                .json()
                .await
                .map_err(|e| Error::storage_with_source("failed to parse listing", e))?;

            listed.extend(page.items.into_iter().map(ObjectResource::into_meta));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }

    async fn head(&self, key: &ObjectKey, options: &RequestOptions) -> Result<Option<ObjectMeta>> {
        let request = self
            .client
            .client
            .get(object_url(key))
            .query(&billing_query(options));
        let response = self.client.send(request).await?;

        match response.status() {
            s if s.is_success() => {
                let resource: ObjectResource = response.json().await.map_err(|e| {
                    Error::storage_with_source("failed to parse object metadata", e)
                })?;
                Ok(Some(resource.into_meta()))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            _ => Err(api_error("object metadata lookup failed", response).await),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketResource {
    #[serde(default)]
    billing: Option<Billing>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Billing {
    #[serde(default)]
    requester_pays: bool,
}

/// Reads bucket billing configuration from the storage JSON API.
#[derive(Clone)]
pub struct GcsMetadataSource {
    client: GcsClient,
    billing_project: Option<String>,
}

impl std::fmt::Debug for GcsMetadataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsMetadataSource")
            .field("billing_project", &self.billing_project)
            .finish_non_exhaustive()
    }
}

impl GcsMetadataSource {
    /// Creates a metadata source using application default credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if GCP authentication cannot be initialized.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            client: GcsClient::new().await?,
            billing_project: None,
        })
    }

    /// Sets the project billed for the metadata lookup itself.
    ///
    /// Reading metadata of a requester-pays bucket needs a billed project.
    #[must_use]
    pub fn with_billing_project(mut self, project: impl Into<String>) -> Self {
        self.billing_project = Some(project.into());
        self
    }
}

#[async_trait]
impl BucketMetadataSource for GcsMetadataSource {
    async fn requester_pays(&self, bucket: &str) -> Result<bool> {
        let mut request = self
            .client
            .client
            .get(format!("{API_ROOT}/b/{bucket}"))
            .query(&[("fields", "billing")]);
        if let Some(project) = &self.billing_project {
            request = request.query(&[("userProject", project.as_str())]);
        }
        let response = self.client.send(request).await?;

        match response.status() {
            s if s.is_success() => {
                let resource: BucketResource = response.json().await.map_err(|e| {
                    Error::storage_with_source("failed to parse bucket metadata", e)
                })?;
                Ok(resource.billing.is_some_and(|b| b.requester_pays))
            }
            reqwest::StatusCode::NOT_FOUND => {
                Err(Error::NotFound(format!("bucket not found: {bucket}")))
            }
            _ => Err(api_error("bucket metadata lookup failed", response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_escapes_slashes() {
        let key = ObjectKey::new("bucket", "wf/call/glob-ab.list");
        assert_eq!(
            object_url(&key),
            "https://storage.googleapis.com/storage/v1/b/bucket/o/wf%2Fcall%2Fglob-ab.list"
        );
    }

    #[test]
    fn billing_query_only_when_project_set() {
        assert!(billing_query(&RequestOptions::default()).is_empty());
        let opts = RequestOptions::default().with_user_project("p");
        assert_eq!(billing_query(&opts), vec![("userProject", "p".to_string())]);
    }

    #[test]
    fn bucket_resource_parses_requester_pays() {
        let parsed: BucketResource =
            serde_json::from_str(r#"{"billing":{"requesterPays":true}}"#).unwrap_or(BucketResource {
                billing: None,
            });
        assert!(parsed.billing.is_some_and(|b| b.requester_pays));

        let empty: BucketResource =
            serde_json::from_str("{}").unwrap_or(BucketResource { billing: None });
        assert!(empty.billing.is_none());
    }
}
