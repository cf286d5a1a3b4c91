//! Multi-pass, chunk-parallel import of a tabular file into the catalog.
//!
//! One file runs as a sequence of passes so that rows can reference, by
//! identity string, rows of the same file that an earlier pass created:
//! glossaries, then domains level by level, then categories level by level,
//! then terms, then every other type. Each pass runs the same steps:
//! split, build and submit, flush, same-kind references, resolve related,
//! deferred deletions.

use crate::batcher::{BatchResults, Batcher};
use crate::cache::CacheContext;
use crate::codec::CellCodec;
use crate::config::{ImportConfig, UpsertMode};
use crate::delta::{DeletionReport, DeltaProcessor, DeltaResult};
use crate::errors::{Result, SyncError};
use crate::kinds::{
    ASSET, CacheKind, DATA_DOMAIN, GLOSSARY, GLOSSARY_CATEGORY, GLOSSARY_TERM, PARENT_CATEGORY,
    PARENT_DOMAIN, hierarchy_depth,
};
use crate::models::{Entity, EntityKey, EntityRef, Value};
use crate::registry::{CONNECTION_QUALIFIED_NAME, FieldRegistry};
use crate::row::{Header, RowDeserializer, TypeFilter, include_row};
use crate::service::{CatalogService, Condition, DeleteMode, SearchRequest, UpsertOptions};
use crate::side_cache::InventoryEntry;
use crate::utils::retry::retry_with_backoff;
use csv::StringRecord;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Outcome counts of one kind of submission, with the keys behind each count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    pub created: Vec<EntityKey>,
    pub updated: Vec<EntityKey>,
    pub restored: Vec<EntityKey>,
    pub skipped: Vec<EntityKey>,
    /// Failure reason → failed keys.
    pub failures: BTreeMap<String, Vec<EntityKey>>,
}

impl Tally {
    fn record_batches(&mut self, results: &BatchResults) {
        self.created.extend(results.created.iter().map(Entity::key));
        self.updated.extend(results.updated.iter().map(Entity::key));
        self.restored.extend(results.restored.iter().map(Entity::key));
        self.skipped.extend(results.skipped.iter().cloned());
        for failure in &results.failures {
            self.fail(&failure.reason, failure.key.clone());
        }
    }

    fn fail(&mut self, reason: &str, key: EntityKey) {
        self.failures.entry(reason.to_string()).or_default().push(key);
    }

    fn merge(&mut self, other: &Tally) {
        self.created.extend(other.created.iter().cloned());
        self.updated.extend(other.updated.iter().cloned());
        self.restored.extend(other.restored.iter().cloned());
        self.skipped.extend(other.skipped.iter().cloned());
        for (reason, keys) in &other.failures {
            self.failures
                .entry(reason.clone())
                .or_default()
                .extend(keys.iter().cloned());
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassResults {
    pub label: String,
    /// Rows of the file that took part in this pass.
    pub rows: usize,
    pub primary: Tally,
    pub related: Tally,
    /// Related entities removed because their cell was blank and cleared.
    pub related_removed: usize,
    /// Chunks that could not be processed at all.
    pub chunk_errors: Vec<String>,
    /// Side-cache records for every primary entity persisted by this pass.
    pub inventory: Vec<InventoryEntry>,
}

impl PassResults {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub fn has_failures(&self) -> bool {
        self.primary.failed() > 0 || self.related.failed() > 0 || !self.chunk_errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportResults {
    pub passes: Vec<PassResults>,
    pub deletions: Option<DeletionReport>,
    /// Keys removed from the catalog by the delta, for the side-cache.
    pub removed: Vec<EntityKey>,
}

impl ImportResults {
    fn primary_totals(&self) -> Tally {
        let mut totals = Tally::default();
        for pass in &self.passes {
            totals.merge(&pass.primary);
        }
        totals
    }

    pub fn created(&self) -> usize {
        self.passes.iter().map(|p| p.primary.created.len()).sum()
    }

    pub fn updated(&self) -> usize {
        self.passes.iter().map(|p| p.primary.updated.len()).sum()
    }

    pub fn restored(&self) -> usize {
        self.passes.iter().map(|p| p.primary.restored.len()).sum()
    }

    pub fn skipped(&self) -> usize {
        self.passes.iter().map(|p| p.primary.skipped.len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.passes.iter().map(|p| p.primary.failed()).sum()
    }

    /// Every failure of the run, primary and related, by reason.
    pub fn failure_buckets(&self) -> BTreeMap<String, Vec<EntityKey>> {
        let mut all = self.primary_totals();
        for pass in &self.passes {
            all.merge(&pass.related);
        }
        all.failures
    }

    pub fn has_failures(&self) -> bool {
        self.passes.iter().any(PassResults::has_failures)
    }

    pub fn inventory(&self) -> Vec<InventoryEntry> {
        self.passes
            .iter()
            .flat_map(|p| p.inventory.iter().cloned())
            .collect()
    }

    pub fn log_summary(&self) {
        log::info!(
            "Import finished: {} created, {} updated, {} restored, {} skipped, {} failed",
            self.created(),
            self.updated(),
            self.restored(),
            self.skipped(),
            self.failed()
        );
        for (reason, keys) in self.failure_buckets() {
            log::error!("{} failed ({}):", keys.len(), reason);
            for key in keys {
                log::error!("  {}", key);
            }
        }
        if let Some(report) = &self.deletions {
            log::info!(
                "Delta removed {} of {} entities",
                report.deleted.len(),
                report.requested.len()
            );
        }
    }
}

/// Restricts a pass to one level of a hierarchy.
#[derive(Debug, Clone, PartialEq)]
struct LevelFilter {
    kind: CacheKind,
    parent_column: &'static str,
    level: usize,
}

impl LevelFilter {
    fn accepts(&self, record: &StringRecord, header: &Header) -> bool {
        row_level(self.kind, self.parent_column, record, header) == self.level
    }
}

/// Depth of the row's parent reference plus one; rows without a parent are level 1.
fn row_level(kind: CacheKind, parent_column: &str, record: &StringRecord, header: &Header) -> usize {
    let parent = header
        .position(parent_column)
        .and_then(|idx| record.get(idx))
        .map(str::trim)
        .unwrap_or_default();
    if parent.is_empty() {
        1
    } else {
        hierarchy_depth(kind, parent) + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Pass {
    label: String,
    filter: TypeFilter,
    level: Option<LevelFilter>,
}

impl Pass {
    fn of_type(type_name: &str) -> Self {
        Self {
            label: type_name.to_string(),
            filter: TypeFilter::only([type_name]),
            level: None,
        }
    }

    fn level(type_name: &str, kind: CacheKind, parent_column: &'static str, level: usize) -> Self {
        Self {
            label: format!("{type_name} level {level}"),
            filter: TypeFilter::only([type_name]),
            level: Some(LevelFilter {
                kind,
                parent_column,
                level,
            }),
        }
    }

    fn accepts(&self, record: &StringRecord, header: &Header, delta: Option<&DeltaResult>) -> bool {
        include_row(record, header.type_idx(), header.qn_idx(), &self.filter, delta)
            && self
                .level
                .as_ref()
                .is_none_or(|level| level.accepts(record, header))
    }
}

/// Work held back until its owner has a durable guid.
#[derive(Debug, Clone)]
struct HeldWork {
    owner: EntityKey,
    related: BTreeMap<String, Vec<Entity>>,
    fields_to_null: Vec<String>,
    deferred: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    held: Vec<HeldWork>,
    failures: Vec<(String, EntityKey)>,
    /// Related entities of rows that failed to build.
    related_skipped: Vec<EntityKey>,
}

/// The passes of one file, plus rows no pass can take.
#[derive(Debug, Default)]
struct Plan {
    passes: Vec<Pass>,
    rejected: Vec<(String, EntityKey)>,
}

const UNREADABLE_ROW: &str = "unreadable row";
const INVALID_VALUE: &str = "invalid value";

/// Short, stable reason used to bucket row-level failures.
fn failure_reason(err: &SyncError) -> &'static str {
    match err {
        SyncError::IdentityNotFound { .. } => "unresolved reference",
        SyncError::AncestorMissing { .. } => "missing ancestor",
        SyncError::UnsupportedField { .. } => "unsupported field",
        SyncError::InvalidValue { .. } => INVALID_VALUE,
        _ => "row could not be built",
    }
}

pub struct Importer {
    config: ImportConfig,
    service: Arc<dyn CatalogService>,
    registry: Arc<FieldRegistry>,
    caches: Arc<CacheContext>,
}

impl Importer {
    pub fn new(config: ImportConfig, service: Arc<dyn CatalogService>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(FieldRegistry::with_extra_fields(&config.extra_fields)?);
        let caches = Arc::new(CacheContext::new(
            Arc::clone(&service),
            config.retry.clone(),
            config.preload_caches,
        ));
        Ok(Self {
            config,
            service,
            registry,
            caches,
        })
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<CacheContext> {
        &self.caches
    }

    pub fn codec(&self) -> CellCodec {
        CellCodec::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.caches),
            self.config.fail_fast,
        )
    }

    pub async fn import(&self, path: &Path) -> Result<ImportResults> {
        self.import_with_delta(path, None).await
    }

    /// Imports `path`. With a delta, unchanged rows may be skipped and removed
    /// entities are deleted once every pass has run.
    pub async fn import_with_delta(
        &self,
        path: &Path,
        delta: Option<&DeltaResult>,
    ) -> Result<ImportResults> {
        let header = self.read_header(path)?;
        if self.config.preload_caches {
            self.caches.preload_all().await?;
        }

        let plan = self.plan_passes(path, &header)?;
        let mut results = ImportResults::default();
        if !plan.rejected.is_empty() {
            let mut rejected = PassResults::new("rejected rows");
            rejected.rows = plan.rejected.len();
            for (reason, key) in plan.rejected {
                log::warn!("Row {} rejected: {}", key, reason);
                rejected.primary.fail(&reason, key);
            }
            results.passes.push(rejected);
        }
        for pass in plan.passes {
            let outcome = self.run_pass(path, &header, &pass, delta).await?;
            if outcome.rows > 0 {
                log::info!(
                    "Pass '{}': {} rows, {} created, {} updated, {} skipped, {} failed",
                    outcome.label,
                    outcome.rows,
                    outcome.primary.created.len(),
                    outcome.primary.updated.len(),
                    outcome.primary.skipped.len(),
                    outcome.primary.failed()
                );
            }
            results.passes.push(outcome);
        }

        if let Some(delta) = delta.filter(|d| d.has_deletions()) {
            let processor = DeltaProcessor::new(self.config.delta.clone(), self.config.separator_byte())
                .with_retry(self.config.retry.clone());
            let report = processor.apply_deletions(delta, self.service.as_ref()).await?;
            for guid in &report.deleted {
                self.caches.forget(guid);
            }
            results.removed = delta
                .to_delete
                .iter()
                .filter(|key| !report.not_found.contains(key))
                .cloned()
                .collect();
            results.deletions = Some(report);
        }

        results.log_summary();
        Ok(results)
    }

    fn open_reader(&self, path: &Path) -> Result<csv::Reader<std::fs::File>> {
        Ok(csv::ReaderBuilder::new()
            .delimiter(self.config.separator_byte())
            .flexible(true)
            .from_path(path)?)
    }

    fn read_header(&self, path: &Path) -> Result<Header> {
        let mut reader = self.open_reader(path)?;
        Header::from_record(reader.headers()?)
    }

    /// Glossaries, domains by level, categories by level, terms, then the rest.
    ///
    /// Rows that cannot be read or lack an identity are rejected here, once.
    fn plan_passes(&self, path: &Path, header: &Header) -> Result<Plan> {
        let (type_idx, qn_idx) = (header.type_idx(), header.qn_idx());
        let (mut max_domain, mut max_category) = (0, 0);
        let mut rejected = Vec::new();
        let mut reader = self.open_reader(path)?;
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(err) if err.is_io_error() => return Err(err.into()),
                Err(err) => {
                    let line = err.position().map(|pos| pos.line()).unwrap_or_default();
                    log::warn!("Line {} of {} is unreadable: {}", line, path.display(), err);
                    rejected.push((
                        UNREADABLE_ROW.to_string(),
                        EntityKey::new("", format!("line {line}")),
                    ));
                    continue;
                }
            };
            let type_name = record.get(type_idx).unwrap_or_default().trim();
            let qualified_name = record.get(qn_idx).unwrap_or_default().trim();
            if type_name.is_empty() || qualified_name.is_empty() {
                rejected.push((
                    INVALID_VALUE.to_string(),
                    EntityKey::new(type_name, qualified_name),
                ));
                continue;
            }
            match type_name {
                DATA_DOMAIN => {
                    max_domain = max_domain.max(row_level(CacheKind::Domain, PARENT_DOMAIN, &record, header))
                }
                GLOSSARY_CATEGORY => {
                    max_category = max_category.max(row_level(
                        CacheKind::Category,
                        PARENT_CATEGORY,
                        &record,
                        header,
                    ))
                }
                _ => {}
            }
        }

        let mut passes = vec![Pass::of_type(GLOSSARY)];
        passes.extend(
            (1..=max_domain).map(|level| Pass::level(DATA_DOMAIN, CacheKind::Domain, PARENT_DOMAIN, level)),
        );
        passes.extend((1..=max_category).map(|level| {
            Pass::level(GLOSSARY_CATEGORY, CacheKind::Category, PARENT_CATEGORY, level)
        }));
        passes.push(Pass::of_type(GLOSSARY_TERM));
        passes.push(Pass {
            label: "assets".to_string(),
            filter: TypeFilter::except([GLOSSARY, DATA_DOMAIN, GLOSSARY_CATEGORY, GLOSSARY_TERM]),
            level: None,
        });
        Ok(Plan { passes, rejected })
    }

    /// Writes the rows of a pass into contiguous, balanced chunk files.
    fn split(
        &self,
        path: &Path,
        header: &Header,
        pass: &Pass,
        delta: Option<&DeltaResult>,
        dir: &Path,
    ) -> Result<(usize, Vec<PathBuf>)> {
        let mut rows = Vec::new();
        let mut reader = self.open_reader(path)?;
        // Unreadable rows were rejected while planning.
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(err) if err.is_io_error() => return Err(err.into()),
                Err(_) => continue,
            };
            if pass.accepts(&record, header, delta) {
                rows.push(record);
            }
        }
        if rows.is_empty() {
            return Ok((0, Vec::new()));
        }

        let chunks = self.config.effective_parallelism().min(rows.len());
        let (base, extra) = (rows.len() / chunks, rows.len() % chunks);
        let mut files = Vec::with_capacity(chunks);
        let mut remaining = rows.iter();
        for chunk in 0..chunks {
            let size = base + usize::from(chunk < extra);
            let file = dir.join(format!("chunk_{chunk:03}.csv"));
            let mut writer = csv::WriterBuilder::new()
                .delimiter(self.config.separator_byte())
                .from_path(&file)?;
            writer.write_record(header.columns())?;
            for record in remaining.by_ref().take(size) {
                writer.write_record(record)?;
            }
            writer.flush()?;
            files.push(file);
        }
        Ok((rows.len(), files))
    }

    async fn run_pass(
        &self,
        path: &Path,
        header: &Header,
        pass: &Pass,
        delta: Option<&DeltaResult>,
    ) -> Result<PassResults> {
        let mut results = PassResults::new(&pass.label);

        // Split
        let workdir = tempfile::tempdir()?;
        let (rows, chunk_files) = self.split(path, header, pass, delta, workdir.path())?;
        results.rows = rows;
        if rows == 0 {
            return Ok(results);
        }
        log::debug!("Pass '{}': {} rows in {} chunks", pass.label, rows, chunk_files.len());

        // Build and submit
        let options = UpsertOptions {
            mode: self.config.upsert_mode,
        };
        let primary = Arc::new(Batcher::new(
            Arc::clone(&self.service),
            options,
            self.config.batch_size,
            self.config.retry.clone(),
        ));
        let deserializer = Arc::new(RowDeserializer::new(
            self.codec(),
            self.config.attributes_to_overwrite.iter().cloned(),
        ));
        let skip_columns: Arc<HashSet<String>> =
            Arc::new(self.config.delta.volatile_columns.iter().cloned().collect());
        let header = Arc::new(header.clone());

        let mut tasks = JoinSet::new();
        for file in chunk_files {
            let primary = Arc::clone(&primary);
            let deserializer = Arc::clone(&deserializer);
            let skip_columns = Arc::clone(&skip_columns);
            let header = Arc::clone(&header);
            let separator = self.config.separator_byte();
            tasks.spawn(async move {
                let outcome =
                    build_chunk(&file, separator, &header, &deserializer, &skip_columns, &primary).await;
                (file, outcome)
            });
        }
        let mut held = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    for (reason, key) in outcome.failures {
                        results.primary.fail(&reason, key);
                    }
                    results.related.skipped.extend(outcome.related_skipped);
                    held.extend(outcome.held);
                }
                Ok((file, Err(err))) => {
                    log::error!("Chunk {} could not be processed: {}", file.display(), err);
                    results.chunk_errors.push(err.to_string());
                }
                Err(err) => {
                    log::error!("Chunk worker panicked: {}", err);
                    results.chunk_errors.push(err.to_string());
                }
            }
        }

        // Flush primary; nothing related starts before this point.
        primary.flush().await;
        let submitted = primary.results().await;
        results.primary.record_batches(&submitted);
        for entity in submitted.persisted() {
            self.caches.remember(entity);
            results.inventory.push(self.inventory_entry(entity));
        }
        for key in &submitted.skipped {
            log::info!("Skipped {} ({:?})", key, self.config.upsert_mode);
        }

        let unresolved = primary.unresolved_keys().await;

        // Same-kind references, now that every entity of the pass is cached
        let references = Batcher::new(
            Arc::clone(&self.service),
            options,
            self.config.batch_size,
            self.config.retry.clone(),
        );
        for item in held.iter().filter(|item| !item.deferred.is_empty()) {
            if unresolved.contains(&item.owner) {
                continue;
            }
            let Some(owner_guid) = primary.resolved_guid(&item.owner).await else {
                continue;
            };
            match deserializer
                .decode_deferred(&item.owner.type_name, &item.deferred)
                .await
            {
                Ok(values) => {
                    let mut update = Entity::new(&item.owner.type_name, &item.owner.qualified_name);
                    update.guid = Some(owner_guid);
                    update.attributes = values;
                    references.add(update).await;
                }
                Err(err) => {
                    log::warn!("References of {} failed: {}", item.owner, err);
                    results.primary.fail(failure_reason(&err), item.owner.clone());
                }
            }
        }
        references.flush().await;
        for failure in references.results().await.failures {
            results.primary.fail(&failure.reason, failure.key);
        }

        // Resolve related
        let related = Batcher::new(
            Arc::clone(&self.service),
            UpsertOptions {
                mode: UpsertMode::Upsert,
            },
            self.config.related_batch_size,
            self.config.retry.clone(),
        );
        let mut deferred = Vec::new();
        for item in held {
            let owner_guid = match primary.resolved_guid(&item.owner).await {
                Some(guid) if !unresolved.contains(&item.owner) => guid,
                _ => {
                    for entity in item.related.values().flatten() {
                        log::info!("Skipping {} because {} was not persisted", entity.key(), item.owner);
                        results.related.skipped.push(entity.key());
                    }
                    continue;
                }
            };
            for mut entity in item.related.into_values().flatten() {
                entity.attributes.insert(
                    ASSET.to_string(),
                    Value::Ref(EntityRef::by_guid(&item.owner.type_name, &owner_guid)),
                );
                related.add(entity).await;
            }
            if !item.fields_to_null.is_empty() {
                deferred.push((item.owner, owner_guid, item.fields_to_null));
            }
        }
        related.flush().await;
        results.related.record_batches(&related.results().await);

        // Deferred deletions
        for (owner, owner_guid, fields) in deferred {
            match self.remove_related(&owner_guid, &fields).await {
                Ok(removed) => results.related_removed += removed,
                Err(err) => {
                    log::warn!("Could not clear {:?} of {}: {}", fields, owner, err);
                    results.related.fail("related removal failed", owner);
                }
            }
        }

        Ok(results)
    }

    /// Archives the related entities of `fields` attached to an owner.
    async fn remove_related(&self, owner_guid: &str, fields: &[String]) -> Result<usize> {
        let service = &self.service;
        let owner = retry_with_backoff(&self.config.retry, "owner lookup", || {
            service.get_by_guid(owner_guid)
        })
        .await?;
        let Some(owner) = owner else {
            return Ok(0);
        };

        let mut guids = Vec::new();
        for field in fields {
            let Some(kind) = self
                .registry
                .field(&owner.type_name, field)
                .and_then(|def| def.related_kind())
            else {
                continue;
            };
            let request = SearchRequest::for_type(kind.type_name())
                .with(Condition::ref_guid(ASSET, owner_guid));
            let found = retry_with_backoff(&self.config.retry, "related search", || {
                service.search(&request)
            })
            .await?;
            guids.extend(found.into_iter().filter_map(|entity| entity.guid));
        }
        if guids.is_empty() {
            return Ok(0);
        }
        let deleted = retry_with_backoff(&self.config.retry, "related delete", || {
            service.delete(&guids, DeleteMode::Soft)
        })
        .await?;
        log::debug!("Removed {} related entities of {}", deleted.len(), owner.key());
        Ok(deleted.len())
    }

    fn inventory_entry(&self, entity: &Entity) -> InventoryEntry {
        InventoryEntry {
            type_name: entity.type_name.clone(),
            qualified_name: entity.qualified_name.clone(),
            connection_qualified_name: entity
                .attribute(CONNECTION_QUALIFIED_NAME)
                .and_then(Value::as_text)
                .map(String::from),
            name: entity.name().map(String::from),
            order_hint: match entity.attribute("order") {
                Some(Value::Integer(order)) => Some(*order),
                _ => None,
            },
            tenant: self.config.tenant.clone(),
        }
    }
}

/// Builds every row of one chunk in file order, submitting primaries as it goes.
async fn build_chunk(
    file: &Path,
    separator: u8,
    header: &Header,
    deserializer: &RowDeserializer,
    skip_columns: &HashSet<String>,
    primary: &Batcher,
) -> Result<ChunkOutcome> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(separator)
        .flexible(true)
        .from_path(file)?;
    let (type_idx, qn_idx) = (header.type_idx(), header.qn_idx());
    let mut outcome = ChunkOutcome::default();

    for record in reader.records() {
        let record = record?;
        let key = EntityKey::new(
            record.get(type_idx).unwrap_or_default().trim(),
            record.get(qn_idx).unwrap_or_default().trim(),
        );
        match deserializer
            .build_from_row(&record, header, type_idx, qn_idx, skip_columns)
            .await
        {
            Ok(build) => {
                primary.add(build.primary).await;
                if !build.related.is_empty() || !build.fields_to_null.is_empty() || !build.deferred.is_empty() {
                    outcome.held.push(HeldWork {
                        owner: key,
                        related: build.related,
                        fields_to_null: build.fields_to_null.into_iter().collect(),
                        deferred: build.deferred,
                    });
                }
            }
            Err(err) => {
                log::warn!("Row {} failed: {}", key, err);
                let related = deserializer.related_keys(&record, header, type_idx, qn_idx);
                if !related.is_empty() {
                    log::info!("Skipping {} related entities of {}", related.len(), key);
                }
                outcome.related_skipped.extend(related);
                outcome.failures.push((failure_reason(&err).to_string(), key));
            }
        }
    }
    Ok(outcome)
}
