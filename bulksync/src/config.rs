use crate::errors::{Result, SyncError};
use crate::registry::FieldSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the catalog should treat entities that do not exist yet.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpsertMode {
    /// Create missing entities, update existing ones.
    #[default]
    Upsert,
    /// Only update existing entities; missing ones are skipped.
    UpdateOnly,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// Every row of the current file is (re)loaded.
    #[default]
    All,
    /// Only rows whose checksum changed since the previous run are loaded.
    ChangesOnly,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Soft-delete: the entity is archived and can be restored.
    #[default]
    Archive,
    /// Hard-delete, including descendants not listed in the current file.
    Purge,
}

/// Bounded exponential backoff for remote point lookups.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 250,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before the given retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DeltaConfig {
    pub reload_policy: ReloadPolicy,
    pub removal_policy: RemovalPolicy,
    /// Only entities of these types are ever removed by a delta.
    pub deletable_types: Vec<String>,
    /// Deletions are restricted to qualified names starting with this prefix.
    pub qualified_name_prefix: Option<String>,
    /// Columns excluded from row checksums.
    pub volatile_columns: Vec<String>,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            reload_policy: ReloadPolicy::All,
            removal_policy: RemovalPolicy::Archive,
            deletable_types: Vec::new(),
            qualified_name_prefix: None,
            volatile_columns: ["guid", "createTime", "updateTime", "createdBy", "updatedBy"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ImportConfig {
    /// Maximum number of primary entities per upsert call.
    pub batch_size: usize,
    /// Maximum number of related entities (readmes, links) per upsert call.
    pub related_batch_size: usize,
    /// Number of chunks processed in parallel; defaults to available parallelism.
    pub parallelism: Option<usize>,
    pub field_separator: char,
    pub upsert_mode: UpsertMode,
    /// Treat an unresolvable reference as a row failure instead of dropping it.
    pub fail_fast: bool,
    /// Whether the embedding process should exit non-zero when anything failed.
    pub fail_on_errors: bool,
    /// Attributes for which a blank cell clears the value instead of leaving it unchanged.
    pub attributes_to_overwrite: Vec<String>,
    /// Bulk-load glossary, category, term and domain caches before the first lookup.
    pub preload_caches: bool,
    pub retry: RetryPolicy,
    pub delta: DeltaConfig,
    /// Tenant recorded in the persistent side-cache.
    pub tenant: String,
    /// Additional (type, field) definitions on top of the standard registry.
    pub extra_fields: Vec<FieldSpec>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            related_batch_size: 10,
            parallelism: None,
            field_separator: ',',
            upsert_mode: UpsertMode::Upsert,
            fail_fast: true,
            fail_on_errors: false,
            attributes_to_overwrite: Vec::new(),
            preload_caches: false,
            retry: RetryPolicy::default(),
            delta: DeltaConfig::default(),
            tenant: "default".to_string(),
            extra_fields: Vec::new(),
        }
    }
}

impl ImportConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ImportConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.related_batch_size == 0 {
            return Err(SyncError::Config("batch sizes must be greater than zero".into()));
        }
        if self.parallelism == Some(0) {
            return Err(SyncError::Config("parallelism must be greater than zero".into()));
        }
        if !self.field_separator.is_ascii() {
            return Err(SyncError::Config(format!(
                "field separator '{}' must be a single ASCII character",
                self.field_separator
            )));
        }
        Ok(())
    }

    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn separator_byte(&self) -> u8 {
        self.field_separator as u8
    }
}
