use crate::config::{DeltaConfig, ReloadPolicy, RemovalPolicy, RetryPolicy};
use crate::errors::Result;
use crate::models::{EntityKey, QUALIFIED_NAME};
use crate::row::Header;
use crate::service::{CatalogService, Condition, DeleteMode, SearchRequest};
use crate::utils::retry::retry_with_backoff;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

const DELETE_BATCH: usize = 100;

/// Row checksums of one file, keyed by entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    checksums: BTreeMap<EntityKey, String>,
}

impl Snapshot {
    pub fn from_file(path: &Path, separator: u8, volatile_columns: &[String]) -> Result<Self> {
        let reader = csv::ReaderBuilder::new()
            .delimiter(separator)
            .flexible(true)
            .from_path(path)?;
        Self::from_reader(reader, volatile_columns)
    }

    pub fn from_reader<R: std::io::Read>(
        mut reader: csv::Reader<R>,
        volatile_columns: &[String],
    ) -> Result<Self> {
        let header = Header::from_record(reader.headers()?)?;
        let (type_idx, qn_idx) = (header.type_idx(), header.qn_idx());
        let volatile: HashSet<&str> = volatile_columns.iter().map(String::as_str).collect();

        let mut checksums = BTreeMap::new();
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(err) if err.is_io_error() => return Err(err.into()),
                Err(err) => {
                    log::warn!("Leaving an unreadable row out of the snapshot: {}", err);
                    continue;
                }
            };
            let type_name = record.get(type_idx).unwrap_or_default().trim();
            let qualified_name = record.get(qn_idx).unwrap_or_default().trim();
            if type_name.is_empty() || qualified_name.is_empty() {
                continue;
            }
            // Short rows hash as if their missing trailing cells were blank.
            let mut pairs: Vec<(&str, &str)> = header
                .columns()
                .iter()
                .enumerate()
                .filter(|(_, column)| !volatile.contains(column.as_str()))
                .map(|(idx, column)| (column.as_str(), record.get(idx).unwrap_or_default()))
                .collect();
            pairs.sort();
            checksums.insert(EntityKey::new(type_name, qualified_name), checksum(&pairs));
        }
        Ok(Self { checksums })
    }

    pub fn get(&self, key: &EntityKey) -> Option<&str> {
        self.checksums.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.checksums.keys()
    }

    pub fn len(&self) -> usize {
        self.checksums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checksums.is_empty()
    }
}

/// SHA-256 over `column=cell` lines, hex encoded.
pub fn checksum(pairs: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();
    for (column, cell) in pairs {
        hasher.update(column.as_bytes());
        hasher.update(b"=");
        hasher.update(cell.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeltaResult {
    pub to_delete: BTreeSet<EntityKey>,
    pub to_reload: BTreeSet<EntityKey>,
    /// Every key in the current file; purges never touch these.
    pub current: BTreeSet<EntityKey>,
    pub reload_policy: ReloadPolicy,
    pub removal_policy: RemovalPolicy,
}

impl DeltaResult {
    pub fn new(reload_policy: ReloadPolicy, removal_policy: RemovalPolicy) -> Self {
        Self {
            to_delete: BTreeSet::new(),
            to_reload: BTreeSet::new(),
            current: BTreeSet::new(),
            reload_policy,
            removal_policy,
        }
    }

    pub fn should_reload(&self, key: &EntityKey) -> bool {
        match self.reload_policy {
            ReloadPolicy::All => true,
            ReloadPolicy::ChangesOnly => self.to_reload.contains(key),
        }
    }

    pub fn has_deletions(&self) -> bool {
        !self.to_delete.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionReport {
    /// Guids sent for deletion.
    pub requested: Vec<String>,
    /// Guids the catalog confirmed.
    pub deleted: Vec<String>,
    /// Candidates no longer present in the catalog.
    pub not_found: Vec<EntityKey>,
}

/// Whether a qualified name lies at or below `prefix`, one path segment at a time.
fn within_prefix(qualified_name: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || qualified_name == prefix
        || qualified_name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub struct DeltaProcessor {
    config: DeltaConfig,
    separator: u8,
    retry: RetryPolicy,
}

impl DeltaProcessor {
    pub fn new(config: DeltaConfig, separator: u8) -> Self {
        Self {
            config,
            separator,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Compares the current file with the file of the previous run, if any.
    pub fn calculate(&self, current: &Path, previous: Option<&Path>) -> Result<DeltaResult> {
        let current = Snapshot::from_file(current, self.separator, &self.config.volatile_columns)?;
        let previous = match previous {
            Some(path) if path.exists() => Some(Snapshot::from_file(
                path,
                self.separator,
                &self.config.volatile_columns,
            )?),
            Some(path) => {
                log::info!("No previous file at {}, treating every row as new", path.display());
                None
            }
            None => None,
        };
        Ok(self.compare(&current, previous.as_ref()))
    }

    pub fn compare(&self, current: &Snapshot, previous: Option<&Snapshot>) -> DeltaResult {
        let mut result = DeltaResult::new(self.config.reload_policy, self.config.removal_policy);
        result.current = current.keys().cloned().collect();

        for key in current.keys() {
            let changed = match previous.and_then(|p| p.get(key)) {
                Some(before) => Some(before) != current.get(key),
                None => true,
            };
            if changed || self.config.reload_policy == ReloadPolicy::All {
                result.to_reload.insert(key.clone());
            }
        }

        if let Some(previous) = previous {
            result.to_delete = previous
                .keys()
                .filter(|key| current.get(key).is_none())
                .filter(|key| self.is_deletable(key))
                .cloned()
                .collect();
        }

        log::info!(
            "Delta: {} to reload, {} to delete ({:?} / {:?})",
            result.to_reload.len(),
            result.to_delete.len(),
            result.reload_policy,
            result.removal_policy
        );
        result
    }

    /// An empty type list places no restriction on types.
    fn is_deletable(&self, key: &EntityKey) -> bool {
        let type_ok = self.config.deletable_types.is_empty()
            || self.config.deletable_types.contains(&key.type_name);
        let prefix_ok = self
            .config
            .qualified_name_prefix
            .as_deref()
            .is_none_or(|prefix| within_prefix(&key.qualified_name, prefix));
        type_ok && prefix_ok
    }

    /// Resolves every delete candidate to a guid and removes it from the catalog.
    pub async fn apply_deletions(
        &self,
        delta: &DeltaResult,
        service: &dyn CatalogService,
    ) -> Result<DeletionReport> {
        let mut report = DeletionReport::default();
        if !delta.has_deletions() {
            return Ok(report);
        }
        let mode = DeleteMode::from(delta.removal_policy);
        let mut guids = BTreeSet::new();

        for key in &delta.to_delete {
            let request = SearchRequest::for_type(&key.type_name)
                .with(Condition::eq(QUALIFIED_NAME, key.qualified_name.clone()));
            let found =
                retry_with_backoff(&self.retry, "delete lookup", || service.search(&request)).await?;
            if found.is_empty() {
                report.not_found.push(key.clone());
            }
            guids.extend(found.into_iter().filter_map(|entity| entity.guid));

            if mode == DeleteMode::Purge {
                let descendants = SearchRequest {
                    include_archived: true,
                    ..Default::default()
                }
                .with(Condition::prefix(QUALIFIED_NAME, format!("{}/", key.qualified_name)));
                let found = retry_with_backoff(&self.retry, "descendant search", || {
                    service.search(&descendants)
                })
                .await?;
                for entity in found {
                    if delta.current.contains(&entity.key()) {
                        continue;
                    }
                    if let Some(guid) = entity.guid {
                        guids.insert(guid);
                    }
                }
            }
        }

        report.requested = guids.into_iter().collect();
        for batch in report.requested.chunks(DELETE_BATCH) {
            let deleted =
                retry_with_backoff(&self.retry, "delete", || service.delete(batch, mode)).await?;
            report.deleted.extend(deleted);
        }
        log::info!(
            "Removed {} of {} entities ({:?})",
            report.deleted.len(),
            report.requested.len(),
            mode
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyncError;
    use crate::models::Entity;
    use crate::service::{UpsertOptions, UpsertResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first call of every operation with a transient error.
    #[derive(Default)]
    struct FlakyCatalog {
        searches: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl CatalogService for FlakyCatalog {
        async fn search(&self, request: &SearchRequest) -> Result<Vec<Entity>> {
            if self.searches.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SyncError::Transient("search timed out".into()));
            }
            let mut found = Entity::new(&request.type_names[0], "B");
            found.guid = Some("guid-b".into());
            Ok(vec![found])
        }

        async fn upsert(&self, _entities: Vec<Entity>, _options: UpsertOptions) -> Result<UpsertResponse> {
            Ok(UpsertResponse::default())
        }

        async fn delete(&self, guids: &[String], _mode: DeleteMode) -> Result<Vec<String>> {
            if self.deletes.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SyncError::Transient("delete timed out".into()));
            }
            Ok(guids.to_vec())
        }

        async fn get_by_guid(&self, _guid: &str) -> Result<Option<Entity>> {
            Ok(None)
        }
    }

    fn snapshot(csv_text: &str) -> Snapshot {
        let reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(csv_text.as_bytes());
        Snapshot::from_reader(reader, &DeltaConfig::default().volatile_columns).unwrap()
    }

    fn key(qn: &str) -> EntityKey {
        EntityKey::new("Table", qn)
    }

    const PREVIOUS: &str = "typeName,qualifiedName,description,updateTime\n\
        Table,A,first,1\n\
        Table,B,second,1\n\
        Table,C,third,1\n";
    const CURRENT: &str = "typeName,qualifiedName,description,updateTime\n\
        Table,A,first,2\n\
        Table,C,third changed,2\n\
        Table,D,fourth,2\n";

    #[test]
    fn test_changes_only_reloads_new_and_changed() {
        let processor = DeltaProcessor::new(
            DeltaConfig {
                reload_policy: ReloadPolicy::ChangesOnly,
                ..Default::default()
            },
            b',',
        );
        let delta = processor.compare(&snapshot(CURRENT), Some(&snapshot(PREVIOUS)));
        assert_eq!(delta.to_delete, BTreeSet::from([key("B")]));
        assert_eq!(delta.to_reload, BTreeSet::from([key("C"), key("D")]));
        assert!(!delta.should_reload(&key("A")));
    }

    #[test]
    fn test_reload_all_includes_unchanged() {
        let processor = DeltaProcessor::new(DeltaConfig::default(), b',');
        let delta = processor.compare(&snapshot(CURRENT), Some(&snapshot(PREVIOUS)));
        assert_eq!(delta.to_reload, BTreeSet::from([key("A"), key("C"), key("D")]));
        assert_eq!(delta.to_delete, BTreeSet::from([key("B")]));
    }

    #[test]
    fn test_volatile_columns_do_not_change_checksum() {
        let a = snapshot("typeName,qualifiedName,updateTime\nTable,A,1\n");
        let b = snapshot("typeName,qualifiedName,updateTime\nTable,A,2\n");
        assert_eq!(a.get(&key("A")), b.get(&key("A")));
    }

    #[test]
    fn test_deletions_restricted_by_type_and_prefix() {
        let processor = DeltaProcessor::new(
            DeltaConfig {
                deletable_types: vec!["Column".to_string()],
                qualified_name_prefix: Some("default/pg".to_string()),
                ..Default::default()
            },
            b',',
        );
        let previous = snapshot(
            "typeName,qualifiedName\nTable,default/pg/t1\nColumn,default/pg/t1/c1\nColumn,other/c2\n",
        );
        let current = snapshot("typeName,qualifiedName\n");
        let delta = processor.compare(&current, Some(&previous));
        assert_eq!(
            delta.to_delete,
            BTreeSet::from([EntityKey::new("Column", "default/pg/t1/c1")])
        );
    }

    #[test]
    fn test_prefix_does_not_reach_sibling_paths() {
        let processor = DeltaProcessor::new(
            DeltaConfig {
                qualified_name_prefix: Some("default/pg/".to_string()),
                ..Default::default()
            },
            b',',
        );
        let previous = snapshot(
            "typeName,qualifiedName\nTable,default/pg2/orders\nTable,default/pg/orders\nTable,default/pg\n",
        );
        let current = snapshot("typeName,qualifiedName\n");
        let delta = processor.compare(&current, Some(&previous));
        assert_eq!(
            delta.to_delete,
            BTreeSet::from([key("default/pg"), key("default/pg/orders")])
        );
        assert!(within_prefix("default/pg/a/b", "default/pg"));
        assert!(!within_prefix("default/pgx", "default/pg"));
    }

    #[test]
    fn test_missing_trailing_cells_hash_as_blank() {
        let short = snapshot("typeName,qualifiedName,description,owner\nTable,A,x\n");
        let padded = snapshot("typeName,qualifiedName,description,owner\nTable,A,x,\n");
        assert_eq!(short.get(&key("A")), padded.get(&key("A")));
    }

    #[tokio::test]
    async fn test_deletions_retry_transient_failures() {
        let processor = DeltaProcessor::new(DeltaConfig::default(), b',').with_retry(RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 2,
        });
        let delta = processor.compare(&snapshot(CURRENT), Some(&snapshot(PREVIOUS)));
        let catalog = FlakyCatalog::default();
        let report = processor.apply_deletions(&delta, &catalog).await.unwrap();
        assert_eq!(report.deleted, vec!["guid-b".to_string()]);
        assert_eq!(catalog.searches.load(Ordering::SeqCst), 2);
        assert_eq!(catalog.deletes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_first_run_has_nothing_to_delete() {
        let processor = DeltaProcessor::new(DeltaConfig::default(), b',');
        let delta = processor.compare(&snapshot(CURRENT), None);
        assert!(!delta.has_deletions());
        assert_eq!(delta.to_reload.len(), 3);
    }
}
