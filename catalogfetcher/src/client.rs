//! HTTP client for the catalog's REST API.
//!
//! Endpoints:
//! - `POST   /api/entities/bulk?mode=`         upsert a batch
//! - `POST   /api/search`                      paged search (`from`/`size`)
//! - `GET    /api/entities/guid/{guid}`        point lookup
//! - `DELETE /api/entities/bulk?guid=&deleteType=` bulk delete

use crate::error::{CatalogFetchError, Result};
use async_trait::async_trait;
use bulksync::config::UpsertMode;
use bulksync::errors::Result as SyncResult;
use bulksync::models::Entity;
use bulksync::service::{CatalogService, DeleteMode, SearchRequest, UpsertOptions, UpsertResponse};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub page_size: usize,
}

impl ClientSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(60),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PagedSearch<'a> {
    #[serde(flatten)]
    request: &'a SearchRequest,
    from: usize,
    size: usize,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SearchPage {
    entities: Vec<Entity>,
    approximate_count: Option<usize>,
}

#[derive(Serialize)]
struct BulkUpsert<'a> {
    entities: &'a [Entity],
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DeleteResponse {
    deleted: Vec<String>,
}

/// `CatalogService` backed by the catalog's REST API.
#[derive(Clone, Debug)]
pub struct HttpCatalogClient {
    http_client: reqwest::Client,
    settings: ClientSettings,
}

impl HttpCatalogClient {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        if settings.base_url.trim().is_empty() {
            return Err(CatalogFetchError::InvalidParam("catalog base url is empty".into()));
        }
        if settings.page_size == 0 {
            return Err(CatalogFetchError::InvalidParam("page size must be positive".into()));
        }
        let http_client = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            http_client,
            settings,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.settings.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Sends a request and decodes its JSON body. `None` on 404.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CatalogFetchError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(Some(response.json().await?))
    }

    async fn search_all(&self, request: &SearchRequest) -> Result<Vec<Entity>> {
        let size = self.settings.page_size;
        let mut found = Vec::new();
        let mut from = 0;
        loop {
            let body = PagedSearch { request, from, size };
            let page: SearchPage = self
                .send(self.http_client.post(self.url("api/search")).json(&body))
                .await?
                .unwrap_or_default();
            let received = page.entities.len();
            found.extend(page.entities);
            from += received;
            let exhausted = page.approximate_count.is_some_and(|total| from >= total);
            if received < size || exhausted {
                break;
            }
        }
        log::debug!("Search {:?} returned {} entities", request.type_names, found.len());
        Ok(found)
    }

    async fn upsert_batch(&self, entities: &[Entity], options: UpsertOptions) -> Result<UpsertResponse> {
        let mode = match options.mode {
            UpsertMode::Upsert => "upsert",
            UpsertMode::UpdateOnly => "update_only",
        };
        let request = self
            .http_client
            .post(self.url("api/entities/bulk"))
            .query(&[("mode", mode)])
            .json(&BulkUpsert { entities });
        self.send(request).await?.ok_or_else(|| CatalogFetchError::Status {
            status: StatusCode::NOT_FOUND,
            body: "bulk endpoint not found".into(),
        })
    }

    async fn delete_batch(&self, guids: &[String], mode: DeleteMode) -> Result<Vec<String>> {
        let delete_type = match mode {
            DeleteMode::Soft => "SOFT",
            DeleteMode::Purge => "PURGE",
        };
        let mut query: Vec<(&str, &str)> = guids.iter().map(|g| ("guid", g.as_str())).collect();
        query.push(("deleteType", delete_type));
        let request = self
            .http_client
            .delete(self.url("api/entities/bulk"))
            .query(&query);
        let response: Option<DeleteResponse> = self.send(request).await?;
        Ok(response.map(|r| r.deleted).unwrap_or_default())
    }
}

#[async_trait]
impl CatalogService for HttpCatalogClient {
    async fn search(&self, request: &SearchRequest) -> SyncResult<Vec<Entity>> {
        Ok(self.search_all(request).await?)
    }

    async fn upsert(&self, entities: Vec<Entity>, options: UpsertOptions) -> SyncResult<UpsertResponse> {
        Ok(self.upsert_batch(&entities, options).await?)
    }

    async fn delete(&self, guids: &[String], mode: DeleteMode) -> SyncResult<Vec<String>> {
        if guids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.delete_batch(guids, mode).await?)
    }

    async fn get_by_guid(&self, guid: &str) -> SyncResult<Option<Entity>> {
        let path = format!("api/entities/guid/{guid}");
        Ok(self.send(self.http_client.get(self.url(&path))).await?)
    }
}
