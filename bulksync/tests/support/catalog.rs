//! An in-memory catalog used to drive the importer end to end.
//!
//! Entities are matched on `(typeName, qualifiedName)`, placeholders are
//! swapped for fresh uuids, and references submitted by placeholder or
//! qualified name are stored resolved to durable guids.

use async_trait::async_trait;
use bulksync::config::UpsertMode;
use bulksync::errors::{Result, SyncError};
use bulksync::models::{Entity, EntityKey, EntityRef, EntityStatus, NAME, QUALIFIED_NAME, TYPE_NAME, Value, is_placeholder};
use bulksync::service::{
    CatalogService, Condition, DeleteMode, EntityFailure, SearchRequest, UpsertOptions,
    UpsertResponse,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Store {
    entities: BTreeMap<String, Entity>,
    by_key: HashMap<EntityKey, String>,
    creations: HashMap<EntityKey, usize>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    store: Mutex<Store>,
    pub upsert_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    /// Artificial latency added to every search.
    pub search_delay: Option<Duration>,
}

#[allow(dead_code)]
impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_delay(delay: Duration) -> Self {
        Self {
            search_delay: Some(delay),
            ..Default::default()
        }
    }

    /// Stores an entity directly, as if an earlier run had created it.
    pub fn seed(&self, mut entity: Entity) -> String {
        let mut store = self.store.lock().unwrap();
        let guid = Uuid::new_v4().to_string();
        entity.guid = Some(guid.clone());
        store.by_key.insert(entity.key(), guid.clone());
        store.entities.insert(guid.clone(), entity);
        guid
    }

    pub fn get(&self, type_name: &str, qualified_name: &str) -> Option<Entity> {
        let store = self.store.lock().unwrap();
        let guid = store.by_key.get(&EntityKey::new(type_name, qualified_name))?;
        store.entities.get(guid).cloned()
    }

    pub fn all_of_type(&self, type_name: &str) -> Vec<Entity> {
        let store = self.store.lock().unwrap();
        store
            .entities
            .values()
            .filter(|e| e.type_name == type_name)
            .cloned()
            .collect()
    }

    /// How many times the key was created.
    pub fn creations(&self, type_name: &str, qualified_name: &str) -> usize {
        let store = self.store.lock().unwrap();
        store
            .creations
            .get(&EntityKey::new(type_name, qualified_name))
            .copied()
            .unwrap_or_default()
    }

    pub fn upserts(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

fn resolve_ref(reference: &mut EntityRef, store: &Store, placeholders: &HashMap<String, String>) {
    if let Some(guid) = &reference.guid {
        if let Some(durable) = placeholders.get(guid) {
            reference.guid = Some(durable.clone());
        }
    } else if let Some(qn) = &reference.qualified_name {
        if let Some(guid) = store.by_key.get(&EntityKey::new(&reference.type_name, qn)) {
            reference.guid = Some(guid.clone());
        }
    }
}

fn resolve_value(value: &mut Value, store: &Store, placeholders: &HashMap<String, String>) {
    match value {
        Value::Ref(reference) => resolve_ref(reference, store, placeholders),
        Value::List(items) | Value::Set(items) => {
            for item in items {
                resolve_value(item, store, placeholders);
            }
        }
        _ => {}
    }
}

fn text_of<'a>(entity: &'a Entity, attribute: &str) -> Option<&'a str> {
    match attribute {
        TYPE_NAME => Some(&entity.type_name),
        QUALIFIED_NAME => Some(&entity.qualified_name),
        "guid" => entity.guid.as_deref(),
        _ => entity.attribute(attribute).and_then(Value::as_text),
    }
}

fn matches(entity: &Entity, condition: &Condition) -> bool {
    match condition {
        Condition::Eq { attribute, value } => text_of(entity, attribute) == Some(value.as_str()),
        Condition::Prefix { attribute, prefix } => {
            text_of(entity, attribute).is_some_and(|text| text.starts_with(prefix.as_str()))
        }
        Condition::RefGuid { attribute, guid } => entity.ref_guid(attribute) == Some(guid.as_str()),
        Condition::Missing { attribute } => entity.attribute(attribute).is_none_or(Value::is_null),
    }
}

#[async_trait]
impl CatalogService for MemoryCatalog {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Entity>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.search_delay {
            tokio::time::sleep(delay).await;
        }
        let store = self.store.lock().unwrap();
        Ok(store
            .entities
            .values()
            .filter(|e| request.type_names.is_empty() || request.type_names.contains(&e.type_name))
            .filter(|e| request.include_archived || e.status == EntityStatus::Active)
            .filter(|e| request.conditions.iter().all(|c| matches(e, c)))
            .cloned()
            .collect())
    }

    async fn upsert(&self, entities: Vec<Entity>, options: UpsertOptions) -> Result<UpsertResponse> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut store = self.store.lock().unwrap();
        let mut response = UpsertResponse::default();

        // Durable guids for the whole batch first, so entities can refer to each other.
        let mut placeholders = HashMap::new();
        for entity in &entities {
            let Some(submitted) = entity.guid.clone() else {
                continue;
            };
            let durable = match store.by_key.get(&entity.key()) {
                Some(existing) => existing.clone(),
                None if is_placeholder(&submitted) => Uuid::new_v4().to_string(),
                None => submitted.clone(),
            };
            placeholders.insert(submitted, durable);
        }

        for mut incoming in entities {
            let key = incoming.key();
            if key.qualified_name.is_empty() {
                response.failures.push(EntityFailure {
                    key,
                    reason: "qualifiedName is required".into(),
                });
                continue;
            }
            for value in incoming.attributes.values_mut() {
                resolve_value(value, &store, &placeholders);
            }

            match store.by_key.get(&key).cloned() {
                Some(guid) => {
                    let Some(existing) = store.entities.get_mut(&guid) else {
                        return Err(SyncError::Remote(format!("index out of sync for {key}")));
                    };
                    for (name, value) in incoming.attributes {
                        if value.is_null() {
                            existing.attributes.remove(&name);
                        } else {
                            existing.attributes.insert(name, value);
                        }
                    }
                    let restored = existing.status == EntityStatus::Archived;
                    existing.status = EntityStatus::Active;
                    let stored = existing.clone();
                    if let Some(submitted) = incoming.guid {
                        response.resolved_ids.insert(submitted, guid);
                    }
                    if restored {
                        response.restored.push(stored);
                    } else {
                        response.updated.push(stored);
                    }
                }
                None if options.mode == UpsertMode::UpdateOnly => response.skipped.push(key),
                None => {
                    let submitted = incoming.guid.clone().unwrap_or_default();
                    let guid = placeholders
                        .get(&submitted)
                        .cloned()
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    incoming.attributes.retain(|_, value| !value.is_null());
                    incoming.guid = Some(guid.clone());
                    incoming.status = EntityStatus::Active;
                    if !incoming.attributes.contains_key(NAME) {
                        let name = key.qualified_name.rsplit('/').next().unwrap_or_default();
                        incoming.attributes.insert(NAME.to_string(), Value::Text(name.to_string()));
                    }
                    *store.creations.entry(key.clone()).or_default() += 1;
                    store.by_key.insert(key, guid.clone());
                    store.entities.insert(guid.clone(), incoming.clone());
                    if !submitted.is_empty() {
                        response.resolved_ids.insert(submitted, guid);
                    }
                    response.created.push(incoming);
                }
            }
        }
        Ok(response)
    }

    async fn delete(&self, guids: &[String], mode: DeleteMode) -> Result<Vec<String>> {
        let mut store = self.store.lock().unwrap();
        let mut deleted = Vec::new();
        for guid in guids {
            match mode {
                DeleteMode::Soft => {
                    if let Some(entity) = store.entities.get_mut(guid) {
                        entity.status = EntityStatus::Archived;
                        deleted.push(guid.clone());
                    }
                }
                DeleteMode::Purge => {
                    if let Some(entity) = store.entities.remove(guid) {
                        store.by_key.remove(&entity.key());
                        deleted.push(guid.clone());
                    }
                }
            }
        }
        Ok(deleted)
    }

    async fn get_by_guid(&self, guid: &str) -> Result<Option<Entity>> {
        let store = self.store.lock().unwrap();
        Ok(store.entities.get(guid).cloned())
    }
}
