use crate::errors::Result;
use crate::models::Entity;
use crate::service::{
    CatalogService, DeleteMode, SearchRequest, UpsertOptions, UpsertResponse,
};
use async_trait::async_trait;

/// A catalog with nothing in it. Unit tests use it where only local cache state matters.
pub struct EmptyCatalog;

#[async_trait]
impl CatalogService for EmptyCatalog {
    async fn search(&self, _request: &SearchRequest) -> Result<Vec<Entity>> {
        Ok(Vec::new())
    }

    async fn upsert(&self, _entities: Vec<Entity>, _options: UpsertOptions) -> Result<UpsertResponse> {
        Ok(UpsertResponse::default())
    }

    async fn delete(&self, _guids: &[String], _mode: DeleteMode) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_by_guid(&self, _guid: &str) -> Result<Option<Entity>> {
        Ok(None)
    }
}
