use crate::error::{CatalogFetchError, Result};
use async_trait::async_trait;
use bulksync::errors::Result as SyncResult;
use bulksync::service::BlobStore;
use reqwest::StatusCode;
use std::path::Path;

/// Blob store reachable over plain HTTP: `GET` and `PUT` on `{base_url}/{key}`.
#[derive(Clone, Debug)]
pub struct HttpBlobStore {
    http_client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch(&self, remote_key: &str, local_path: &Path) -> Result<bool> {
        let response = self
            .authorize(self.http_client.get(self.url(remote_key)))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(CatalogFetchError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        let bytes = response.bytes().await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &bytes).await?;
        log::debug!("Downloaded {} ({} bytes)", remote_key, bytes.len());
        Ok(true)
    }

    async fn store(&self, local_path: &Path, remote_key: &str) -> Result<()> {
        let body = tokio::fs::read(local_path).await?;
        let response = self
            .authorize(self.http_client.put(self.url(remote_key)))
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogFetchError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        log::debug!("Uploaded {} to {}", local_path.display(), remote_key);
        Ok(())
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn download(&self, remote_key: &str, local_path: &Path) -> SyncResult<bool> {
        Ok(self.fetch(remote_key, local_path).await?)
    }

    async fn upload(&self, local_path: &Path, remote_key: &str) -> SyncResult<()> {
        Ok(self.store(local_path, remote_key).await?)
    }
}
