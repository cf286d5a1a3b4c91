pub mod batcher;
pub mod blob;
pub mod cache;
pub mod codec;
pub mod config;
pub mod delta;
pub mod errors;
pub mod importer;
pub mod kinds;
pub mod models;
pub mod registry;
pub mod row;
pub mod service;
pub mod side_cache;
pub mod utils;

#[cfg(test)]
mod test_support;

use crate::config::ImportConfig;
use crate::delta::DeltaProcessor;
use crate::errors::Result;
use crate::importer::{ImportResults, Importer};
use crate::kinds::ASSET;
use crate::models::Entity;
use crate::row::{ExportRow, Header, RowGenerator};
use crate::service::{BlobStore, CatalogService, Condition, SearchRequest};
use crate::side_cache::AssetInventory;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// The main entry point for the `bulksync` library.
///
/// `BulkSync` ties together everything needed to keep a catalog in step with
/// tabular files:
/// - An `Importer` that loads a file in dependency-ordered, chunk-parallel passes.
/// - A `DeltaProcessor` that compares a file with the previous run's copy.
/// - A `RowGenerator` for exporting catalog entities back into the same layout.
/// - The persistent side-cache (`AssetInventory`) shared through a `BlobStore`.
///
/// # Example
///
/// ```rust,no_run
/// use bulksync::{BulkSync, config::ImportConfig, service::CatalogService};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// async fn run(service: Arc<dyn CatalogService>) -> bulksync::errors::Result<()> {
///     let sync = BulkSync::new(ImportConfig::default(), service)?;
///     let results = sync.import(Path::new("assets.csv")).await?;
///     println!("{} created", results.created());
///     Ok(())
/// }
/// ```
pub struct BulkSync {
    pub config: ImportConfig,
    pub service: Arc<dyn CatalogService>,
    pub importer: Importer,
}

impl BulkSync {
    pub fn new(config: ImportConfig, service: Arc<dyn CatalogService>) -> Result<Self> {
        let importer = Importer::new(config.clone(), Arc::clone(&service))?;
        Ok(Self {
            config,
            service,
            importer,
        })
    }

    pub async fn import(&self, path: &Path) -> Result<ImportResults> {
        self.importer.import(path).await
    }

    /// Imports `current`, using the file of the previous run to skip unchanged
    /// rows and remove entities that disappeared.
    pub async fn import_delta(&self, current: &Path, previous: Option<&Path>) -> Result<ImportResults> {
        let processor = DeltaProcessor::new(self.config.delta.clone(), self.config.separator_byte())
            .with_retry(self.config.retry.clone());
        let delta = processor.calculate(current, previous)?;
        self.importer.import_with_delta(current, Some(&delta)).await
    }

    /// Writes every entity matching `request` to `path`, one row each.
    pub async fn export(&self, path: &Path, request: &SearchRequest, columns: &[String]) -> Result<usize> {
        let codec = self.importer.codec();
        let header = Header::new(columns.iter().map(String::as_str))?;
        let related_fields: Vec<(String, &'static str)> = header
            .columns()
            .iter()
            .filter_map(|column| {
                codec
                    .registry()
                    .field("", column)
                    .and_then(|def| def.related_kind())
                    .map(|kind| (column.clone(), kind.type_name()))
            })
            .collect();

        let mut rows = Vec::new();
        for entity in self.service.search(request).await? {
            let related = match &entity.guid {
                Some(guid) if !related_fields.is_empty() => self.related_of(guid, &related_fields).await?,
                _ => BTreeMap::new(),
            };
            rows.push(ExportRow { entity, related });
        }

        RowGenerator::new(codec, header)
            .write_file(path, &rows, self.config.separator_byte())
            .await
    }

    async fn related_of(
        &self,
        owner_guid: &str,
        fields: &[(String, &'static str)],
    ) -> Result<BTreeMap<String, Vec<Entity>>> {
        let mut related = BTreeMap::new();
        for (field, type_name) in fields {
            let request = SearchRequest::for_type(type_name).with(Condition::ref_guid(ASSET, owner_guid));
            let found = self.service.search(&request).await?;
            if !found.is_empty() {
                related.insert(field.clone(), found);
            }
        }
        Ok(related)
    }

    /// Records the outcome of an import in the shared side-cache.
    pub async fn sync_inventory(
        &self,
        store: &dyn BlobStore,
        remote_key: &str,
        local_path: &Path,
        results: &ImportResults,
    ) -> Result<AssetInventory> {
        AssetInventory::sync_with_blob(
            store,
            remote_key,
            local_path,
            &results.inventory(),
            &results.removed,
        )
        .await
    }
}
