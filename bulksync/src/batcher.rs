use crate::config::RetryPolicy;
use crate::errors::Result;
use crate::models::{Entity, EntityKey};
use crate::service::{CatalogService, EntityFailure, UpsertOptions, UpsertResponse};
use crate::utils::id::PlaceholderIds;
use crate::utils::retry::retry_with_backoff;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What happened to everything a batcher submitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResults {
    pub created: Vec<Entity>,
    pub updated: Vec<Entity>,
    pub restored: Vec<Entity>,
    pub skipped: Vec<EntityKey>,
    pub failures: Vec<EntityFailure>,
    pub calls: usize,
}

impl BatchResults {
    pub fn persisted(&self) -> impl Iterator<Item = &Entity> {
        self.created
            .iter()
            .chain(self.updated.iter())
            .chain(self.restored.iter())
    }

    fn absorb(&mut self, response: UpsertResponse) {
        self.created.extend(response.created);
        self.updated.extend(response.updated);
        self.restored.extend(response.restored);
        self.skipped.extend(response.skipped);
        self.failures.extend(response.failures);
    }
}

#[derive(Default)]
struct BatchState {
    buffer: Vec<Entity>,
    placeholders: HashMap<EntityKey, String>,
    resolved: HashMap<EntityKey, String>,
    results: BatchResults,
}

/// Accumulates entities of one pass and submits them in bounded upserts.
///
/// Each key gets one placeholder guid for the whole pass; adding the same key
/// again merges into the buffered entity, or resubmits under the guid the key
/// already resolved to.
pub struct Batcher {
    service: Arc<dyn CatalogService>,
    options: UpsertOptions,
    batch_size: usize,
    retry: RetryPolicy,
    ids: PlaceholderIds,
    state: Mutex<BatchState>,
}

impl Batcher {
    pub fn new(
        service: Arc<dyn CatalogService>,
        options: UpsertOptions,
        batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service,
            options,
            batch_size: batch_size.max(1),
            retry,
            ids: PlaceholderIds::default(),
            state: Mutex::new(BatchState::default()),
        }
    }

    /// Buffers an entity and returns the guid it was submitted under.
    pub async fn add(&self, mut entity: Entity) -> String {
        let key = entity.key();
        let (guid, full) = {
            let mut state = self.state.lock().await;
            let known = state
                .resolved
                .get(&key)
                .or_else(|| state.placeholders.get(&key))
                .cloned();
            let guid = match known {
                Some(existing) => existing,
                None => {
                    let guid = entity
                        .guid
                        .clone()
                        .unwrap_or_else(|| self.ids.next());
                    state.placeholders.insert(key.clone(), guid.clone());
                    guid
                }
            };
            entity.guid = Some(guid.clone());

            match state.buffer.iter_mut().find(|queued| queued.key() == key) {
                Some(queued) => {
                    log::debug!("Merging repeated {} into the pending batch", key);
                    queued.attributes.extend(entity.attributes);
                }
                None => state.buffer.push(entity),
            }

            let full = if state.buffer.len() >= self.batch_size {
                Some(std::mem::take(&mut state.buffer))
            } else {
                None
            };
            (guid, full)
        };

        if let Some(batch) = full {
            self.submit(batch).await;
        }
        guid
    }

    /// Submits whatever is still buffered.
    pub async fn flush(&self) {
        let batch = std::mem::take(&mut self.state.lock().await.buffer);
        if !batch.is_empty() {
            self.submit(batch).await;
        }
    }

    async fn submit(&self, batch: Vec<Entity>) {
        let keys: Vec<EntityKey> = batch.iter().map(Entity::key).collect();
        let submitted: Vec<(EntityKey, String)> = batch
            .iter()
            .filter_map(|entity| entity.guid.clone().map(|guid| (entity.key(), guid)))
            .collect();
        let service = &self.service;
        let options = self.options;
        let outcome: Result<UpsertResponse> = retry_with_backoff(&self.retry, "upsert", || {
            service.upsert(batch.clone(), options)
        })
        .await;

        let mut state = self.state.lock().await;
        state.results.calls += 1;
        match outcome {
            Ok(response) => {
                // The id map is authoritative; returned entities only fill its gaps.
                for (key, guid) in submitted {
                    if let Some(durable) = response.resolved_ids.get(&guid) {
                        state.resolved.insert(key, durable.clone());
                    }
                }
                for entity in response
                    .created
                    .iter()
                    .chain(response.updated.iter())
                    .chain(response.restored.iter())
                {
                    if let Some(guid) = &entity.guid {
                        state.resolved.entry(entity.key()).or_insert_with(|| guid.clone());
                    }
                }
                log::debug!(
                    "Upserted {} entities: {} created, {} updated, {} restored, {} skipped, {} failed",
                    keys.len(),
                    response.created.len(),
                    response.updated.len(),
                    response.restored.len(),
                    response.skipped.len(),
                    response.failures.len()
                );
                state.results.absorb(response);
            }
            Err(err) => {
                log::error!("Batch of {} entities failed: {}", keys.len(), err);
                let reason = err.to_string();
                state
                    .results
                    .failures
                    .extend(keys.into_iter().map(|key| EntityFailure {
                        key,
                        reason: reason.clone(),
                    }));
            }
        }
    }

    /// Durable guid a key resolved to, once its batch has been submitted.
    pub async fn resolved_guid(&self, key: &EntityKey) -> Option<String> {
        self.state.lock().await.resolved.get(key).cloned()
    }

    /// Keys that were skipped or failed.
    pub async fn unresolved_keys(&self) -> HashSet<EntityKey> {
        let state = self.state.lock().await;
        state
            .results
            .skipped
            .iter()
            .cloned()
            .chain(state.results.failures.iter().map(|f| f.key.clone()))
            .collect()
    }

    /// Results so far. Call after `flush`.
    pub async fn results(&self) -> BatchResults {
        self.state.lock().await.results.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyncError;
    use crate::models::{Value, is_placeholder};
    use crate::service::{DeleteMode, SearchRequest};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Creates everything it is sent, recording batch sizes.
    #[derive(Default)]
    struct RecordingCatalog {
        batches: StdMutex<Vec<Vec<Entity>>>,
        fail: bool,
        /// Echo entities back with an upper-cased qualified name.
        normalise: bool,
    }

    #[async_trait]
    impl CatalogService for RecordingCatalog {
        async fn search(&self, _request: &SearchRequest) -> Result<Vec<Entity>> {
            Ok(Vec::new())
        }

        async fn upsert(&self, entities: Vec<Entity>, _options: UpsertOptions) -> Result<UpsertResponse> {
            if self.fail {
                return Err(SyncError::Remote("catalog rejected the request".into()));
            }
            self.batches.lock().unwrap().push(entities.clone());
            let mut response = UpsertResponse::default();
            for mut entity in entities {
                let durable = format!("guid-{}", entity.qualified_name);
                if let Some(placeholder) = entity.guid.replace(durable.clone()) {
                    response.resolved_ids.insert(placeholder, durable);
                }
                if self.normalise {
                    entity.qualified_name = entity.qualified_name.to_uppercase();
                }
                response.created.push(entity);
            }
            Ok(response)
        }

        async fn delete(&self, _guids: &[String], _mode: DeleteMode) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn get_by_guid(&self, _guid: &str) -> Result<Option<Entity>> {
            Ok(None)
        }
    }

    fn table(qn: &str) -> Entity {
        Entity::new("Table", qn)
    }

    #[tokio::test]
    async fn test_full_buffer_triggers_upsert() {
        let catalog = Arc::new(RecordingCatalog::default());
        let batcher = Batcher::new(catalog.clone(), UpsertOptions::default(), 2, RetryPolicy::default());
        for qn in ["a", "b", "c"] {
            assert!(is_placeholder(&batcher.add(table(qn)).await));
        }
        assert_eq!(catalog.batches.lock().unwrap().len(), 1);
        batcher.flush().await;

        let sizes: Vec<usize> = catalog.batches.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(batcher.results().await.created.len(), 3);
        assert_eq!(
            batcher.resolved_guid(&EntityKey::new("Table", "c")).await.as_deref(),
            Some("guid-c")
        );
    }

    #[tokio::test]
    async fn test_repeated_key_reuses_placeholder() {
        let catalog = Arc::new(RecordingCatalog::default());
        let batcher = Batcher::new(catalog.clone(), UpsertOptions::default(), 10, RetryPolicy::default());
        let first = batcher
            .add(table("a").with_attribute("description", Value::Text("one".into())))
            .await;
        let second = batcher
            .add(table("a").with_attribute("name", Value::Text("a".into())))
            .await;
        assert_eq!(first, second);
        batcher.flush().await;

        let batches = catalog.batches.lock().unwrap();
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].attributes.len(), 2);
        drop(batches);
        assert_eq!(
            batcher.resolved_guid(&EntityKey::new("Table", "a")).await.as_deref(),
            Some("guid-a")
        );
    }

    #[tokio::test]
    async fn test_guids_follow_the_id_map_not_echoed_names() {
        let catalog = Arc::new(RecordingCatalog {
            normalise: true,
            ..Default::default()
        });
        let batcher = Batcher::new(catalog, UpsertOptions::default(), 5, RetryPolicy::default());
        batcher.add(table("orders")).await;
        batcher.flush().await;

        let key = EntityKey::new("Table", "orders");
        assert_eq!(batcher.resolved_guid(&key).await.as_deref(), Some("guid-orders"));
        assert!(!batcher.unresolved_keys().await.contains(&key));
    }

    #[tokio::test]
    async fn test_failed_batch_is_recorded_per_entity() {
        let catalog = Arc::new(RecordingCatalog {
            fail: true,
            ..Default::default()
        });
        let batcher = Batcher::new(catalog, UpsertOptions::default(), 5, RetryPolicy::default());
        batcher.add(table("a")).await;
        batcher.add(table("b")).await;
        batcher.flush().await;

        let results = batcher.results().await;
        assert_eq!(results.failures.len(), 2);
        assert_eq!(batcher.unresolved_keys().await.len(), 2);
    }
}
