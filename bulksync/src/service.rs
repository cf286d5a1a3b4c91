use crate::config::{RemovalPolicy, UpsertMode};
use crate::errors::Result;
use crate::models::{Entity, EntityKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A single filter clause of a catalog search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Attribute (or `qualifiedName`/`typeName`/`guid`) equals the given text.
    Eq { attribute: String, value: String },
    /// Attribute starts with the given text.
    Prefix { attribute: String, prefix: String },
    /// A singular reference attribute points at the given guid.
    RefGuid { attribute: String, guid: String },
    /// The attribute is absent or null.
    Missing { attribute: String },
}

impl Condition {
    pub fn eq(attribute: &str, value: impl Into<String>) -> Self {
        Condition::Eq {
            attribute: attribute.to_string(),
            value: value.into(),
        }
    }

    pub fn prefix(attribute: &str, prefix: impl Into<String>) -> Self {
        Condition::Prefix {
            attribute: attribute.to_string(),
            prefix: prefix.into(),
        }
    }

    pub fn ref_guid(attribute: &str, guid: impl Into<String>) -> Self {
        Condition::RefGuid {
            attribute: attribute.to_string(),
            guid: guid.into(),
        }
    }

    pub fn missing(attribute: &str) -> Self {
        Condition::Missing {
            attribute: attribute.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    /// Empty means any type.
    pub type_names: Vec<String>,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub include_archived: bool,
}

impl SearchRequest {
    pub fn for_type(type_name: &str) -> Self {
        Self {
            type_names: vec![type_name.to_string()],
            ..Default::default()
        }
    }

    pub fn with(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOptions {
    pub mode: UpsertMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFailure {
    pub key: EntityKey,
    pub reason: String,
}

/// Outcome of one upsert call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpsertResponse {
    pub created: Vec<Entity>,
    pub updated: Vec<Entity>,
    pub restored: Vec<Entity>,
    pub skipped: Vec<EntityKey>,
    pub failures: Vec<EntityFailure>,
    /// Guid submitted (placeholder or durable) → durable guid.
    pub resolved_ids: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteMode {
    Soft,
    Purge,
}

impl From<RemovalPolicy> for DeleteMode {
    fn from(policy: RemovalPolicy) -> Self {
        match policy {
            RemovalPolicy::Archive => DeleteMode::Soft,
            RemovalPolicy::Purge => DeleteMode::Purge,
        }
    }
}

/// The remote catalog. It is the only source of durable guids.
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Entity>>;

    async fn upsert(&self, entities: Vec<Entity>, options: UpsertOptions) -> Result<UpsertResponse>;

    /// Returns the guids actually deleted.
    async fn delete(&self, guids: &[String], mode: DeleteMode) -> Result<Vec<String>>;

    async fn get_by_guid(&self, guid: &str) -> Result<Option<Entity>>;
}

/// Object storage used to stage files between runs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Downloads `remote_key` to `local_path`; returns `false` when the key does not exist.
    async fn download(&self, remote_key: &str, local_path: &Path) -> Result<bool>;

    async fn upload(&self, local_path: &Path, remote_key: &str) -> Result<()>;
}
