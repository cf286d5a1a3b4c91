//! Per-run identity caches.
//!
//! Every entity kind with its own identity convention gets one store mapping
//! identity → guid and guid → (identity, minimal entity), plus an ignore set of
//! identities already known to be unresolvable in this run. All stores live in
//! a [`CacheContext`] that is built once per run and shared by the parallel
//! workers; the maps are concurrent so callers never lock anything themselves.
//!
//! Hierarchical identities (categories, domains) embed the identity of every
//! ancestor. An entity's identity is always derived from entries that are
//! already cached *before* the entity itself is written, so deriving an
//! identity never waits on a write in progress.

use crate::config::RetryPolicy;
use crate::errors::{Result, SyncError};
use crate::kinds::{
    ANCHOR, CacheKind, GLOSSARY, GLOSSARY_DELIMITER, PARENT_CATEGORY, PARENT_DOMAIN,
    PATH_DELIMITER, TYPE_DELIMITER, split_asset_identity, split_category_identity,
    split_term_identity,
};
use crate::models::{Entity, NAME, QUALIFIED_NAME, is_placeholder};
use crate::service::{CatalogService, Condition, SearchRequest};
use crate::utils::retry::retry_with_backoff;
use dashmap::{DashMap, DashSet};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::OnceCell;
use tokio::task::JoinSet;

/// Ancestor chains deeper than this are treated as corrupt.
const MAX_HIERARCHY_DEPTH: usize = 64;

/// Result of resolving an identity or guid.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Entity),
    NotFound,
    /// The catalog kept failing; the identity is ignored for the rest of the run.
    RetryExhausted,
}

impl Lookup {
    pub fn found(self) -> Option<Entity> {
        match self {
            Lookup::Found(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    identity: String,
    entity: Entity,
}

#[derive(Default)]
struct IdentityStore {
    by_identity: DashMap<String, String>,
    by_guid: DashMap<String, CachedEntry>,
    ignored: DashSet<String>,
    preloaded: OnceCell<()>,
}

/// All identity caches of one run, plus the catalog they fall back to.
pub struct CacheContext {
    service: Arc<dyn CatalogService>,
    retry: RetryPolicy,
    preload_enabled: bool,
    stores: [IdentityStore; 5],
    remote_calls: AtomicUsize,
}

fn slot(kind: CacheKind) -> usize {
    match kind {
        CacheKind::Glossary => 0,
        CacheKind::Term => 1,
        CacheKind::Category => 2,
        CacheKind::Domain => 3,
        CacheKind::Asset => 4,
    }
}

impl CacheContext {
    pub fn new(service: Arc<dyn CatalogService>, retry: RetryPolicy, preload_enabled: bool) -> Self {
        Self {
            service,
            retry,
            preload_enabled,
            stores: Default::default(),
            remote_calls: AtomicUsize::new(0),
        }
    }

    pub fn cache(self: &Arc<Self>, kind: CacheKind) -> IdentityCache {
        IdentityCache {
            ctx: Arc::clone(self),
            kind,
        }
    }

    pub fn service(&self) -> &Arc<dyn CatalogService> {
        &self.service
    }

    /// Number of remote searches and point lookups issued through the caches.
    pub fn remote_calls(&self) -> usize {
        self.remote_calls.load(Ordering::Relaxed)
    }

    /// Bulk-loads every preloadable kind, ancestors before descendants.
    pub async fn preload_all(self: &Arc<Self>) -> Result<()> {
        for kind in [
            CacheKind::Glossary,
            CacheKind::Domain,
            CacheKind::Category,
            CacheKind::Term,
        ] {
            self.cache(kind).preload().await?;
        }
        Ok(())
    }

    /// Caches an entity the catalog just persisted, under the kind its type maps to.
    pub fn remember(self: &Arc<Self>, entity: &Entity) {
        let kind = CacheKind::for_type(&entity.type_name);
        if let Err(err) = self.cache(kind).add(entity) {
            log::warn!("Unable to cache {}: {}", entity.key(), err);
        }
    }

    /// Forgets a deleted entity in whichever store holds it.
    pub fn forget(&self, guid: &str) {
        for store in &self.stores {
            if let Some((_, entry)) = store.by_guid.remove(guid) {
                store.by_identity.remove(&entry.identity);
            }
        }
    }

    fn store(&self, kind: CacheKind) -> &IdentityStore {
        &self.stores[slot(kind)]
    }

    async fn remote_search(&self, request: &SearchRequest) -> Option<Vec<Entity>> {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
        let service = &self.service;
        match retry_with_backoff(&self.retry, "catalog search", || service.search(request)).await {
            Ok(found) => Some(found),
            Err(err) => {
                log::warn!(
                    "Giving up on search for {:?} {:?}: {}",
                    request.type_names,
                    request.conditions,
                    err
                );
                None
            }
        }
    }

    /// `None` when retries were exhausted, `Some(None)` when the guid does not exist.
    async fn fetch_by_guid(&self, guid: &str) -> Option<Option<Entity>> {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
        let service = &self.service;
        match retry_with_backoff(&self.retry, "catalog lookup", || service.get_by_guid(guid)).await {
            Ok(found) => Some(found),
            Err(err) => {
                log::warn!("Giving up on lookup of guid {}: {}", guid, err);
                None
            }
        }
    }
}

/// A handle on the cache of one entity kind.
#[derive(Clone)]
pub struct IdentityCache {
    ctx: Arc<CacheContext>,
    kind: CacheKind,
}

impl IdentityCache {
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    fn store(&self) -> &IdentityStore {
        self.ctx.store(self.kind)
    }

    pub fn len(&self) -> usize {
        self.store().by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_ignored(&self, identity: &str) -> bool {
        self.store().ignored.contains(identity)
    }

    pub fn add_to_ignore_set(&self, identity: &str) {
        self.store().ignored.insert(identity.to_string());
    }

    /// Identity of an already-cached guid. Never goes remote.
    pub fn identity_for_guid(&self, guid: &str) -> Option<String> {
        self.store()
            .by_guid
            .get(guid)
            .map(|entry| entry.identity.clone())
    }

    fn cached_by_identity(&self, identity: &str) -> Option<Entity> {
        let guid = self.store().by_identity.get(identity)?.value().clone();
        self.store()
            .by_guid
            .get(&guid)
            .map(|entry| entry.entity.clone())
    }

    /// Caches an entity with a durable guid and returns its identity.
    ///
    /// The identity (and therefore every ancestor it depends on) is computed
    /// from the current cache contents before anything is written.
    pub fn add(&self, entity: &Entity) -> Result<String> {
        let guid = match entity.guid.as_deref() {
            Some(guid) if !is_placeholder(guid) => guid.to_string(),
            _ => {
                return Err(SyncError::InvalidArg(format!(
                    "refusing to cache {} without a durable guid",
                    entity.key()
                )));
            }
        };
        let identity = self.derive_identity(entity)?;

        let store = self.store();
        let previous = store.by_guid.insert(
            guid.clone(),
            CachedEntry {
                identity: identity.clone(),
                entity: minimal(entity),
            },
        );
        if let Some(previous) = previous {
            if previous.identity != identity {
                store.by_identity.remove(&previous.identity);
            }
        }
        store.by_identity.insert(identity.clone(), guid);
        store.ignored.remove(&identity);
        Ok(identity)
    }

    /// Computes the identity string of an entity of this kind.
    pub fn derive_identity(&self, entity: &Entity) -> Result<String> {
        match self.kind {
            CacheKind::Glossary => Ok(require_name(entity)?.to_string()),
            CacheKind::Term => {
                let name = require_name(entity)?;
                let glossary = self.anchor_identity(entity, name)?;
                Ok(format!("{name}{GLOSSARY_DELIMITER}{glossary}"))
            }
            CacheKind::Category => {
                let name = require_name(entity)?;
                let path = match entity.ref_guid(PARENT_CATEGORY) {
                    Some(parent_guid) => {
                        let parent = self
                            .identity_for_guid(parent_guid)
                            .ok_or_else(|| ancestor_missing(entity, name))?;
                        let (segments, _) = split_category_identity(&parent)
                            .ok_or_else(|| ancestor_missing(entity, &parent))?;
                        format!("{}{PATH_DELIMITER}{name}", segments.join(PATH_DELIMITER))
                    }
                    None => name.to_string(),
                };
                let glossary = self.anchor_identity(entity, &path)?;
                Ok(format!("{path}{GLOSSARY_DELIMITER}{glossary}"))
            }
            CacheKind::Domain => {
                let name = require_name(entity)?;
                match entity.ref_guid(PARENT_DOMAIN) {
                    Some(parent_guid) => {
                        let parent = self
                            .identity_for_guid(parent_guid)
                            .ok_or_else(|| ancestor_missing(entity, name))?;
                        Ok(format!("{parent}{PATH_DELIMITER}{name}"))
                    }
                    None => Ok(name.to_string()),
                }
            }
            CacheKind::Asset => Ok(format!(
                "{}{TYPE_DELIMITER}{}",
                entity.type_name, entity.qualified_name
            )),
        }
    }

    fn anchor_identity(&self, entity: &Entity, partial_path: &str) -> Result<String> {
        entity
            .ref_guid(ANCHOR)
            .and_then(|guid| self.ctx.cache(CacheKind::Glossary).identity_for_guid(guid))
            .ok_or_else(|| ancestor_missing(entity, partial_path))
    }

    /// Resolves an identity, going to the catalog on a miss.
    pub async fn get_by_identity(&self, identity: &str) -> Result<Lookup> {
        if let Some(hit) = self.precheck(identity).await? {
            return Ok(hit);
        }
        let outcome = match self.kind {
            CacheKind::Glossary => self.lookup_glossary(identity).await?,
            CacheKind::Term => self.lookup_term(identity).await?,
            CacheKind::Category | CacheKind::Domain => self.lookup_hierarchy(identity).await?,
            CacheKind::Asset => self.lookup_asset(identity).await?,
        };
        Ok(self.settle(identity, outcome))
    }

    /// Resolves a guid, going to the catalog on a miss.
    pub async fn get_by_guid(&self, guid: &str) -> Result<Lookup> {
        if let Some(entry) = self.store().by_guid.get(guid) {
            return Ok(Lookup::Found(entry.entity.clone()));
        }
        if is_placeholder(guid) {
            return Ok(Lookup::NotFound);
        }
        let entity = match self.ctx.fetch_by_guid(guid).await {
            None => return Ok(Lookup::RetryExhausted),
            Some(None) => return Ok(Lookup::NotFound),
            Some(Some(entity)) => entity,
        };
        if self.kind != CacheKind::Asset && CacheKind::for_type(&entity.type_name) != self.kind {
            log::warn!(
                "Guid {} resolved to {} which is not a {}",
                guid,
                entity.type_name,
                self.kind
            );
            return Ok(Lookup::NotFound);
        }
        self.ensure_ancestors(&entity).await?;
        self.add(&entity)?;
        Ok(Lookup::Found(minimal(&entity)))
    }

    /// Identity for a guid, resolving it remotely if needed.
    pub async fn identity_of_guid(&self, guid: &str) -> Result<Option<String>> {
        Ok(match self.get_by_guid(guid).await? {
            Lookup::Found(_) => self.identity_for_guid(guid),
            _ => None,
        })
    }

    /// Bulk-loads this kind once per run. Anchored kinds load glossaries first.
    pub async fn preload(&self) -> Result<()> {
        if self.kind.anchor_attribute().is_some() {
            self.ctx.cache(CacheKind::Glossary).preload_own().await?;
        }
        self.preload_own().await
    }

    async fn preload_own(&self) -> Result<()> {
        if !self.kind.is_preloadable() {
            return Ok(());
        }
        self.store()
            .preloaded
            .get_or_try_init(|| self.load_all())
            .await
            .map(|_| ())
    }

    async fn load_all(&self) -> Result<()> {
        let Some(type_name) = self.kind.type_name() else {
            return Ok(());
        };
        let entities = self
            .ctx
            .remote_search(&SearchRequest::for_type(type_name))
            .await
            .ok_or_else(|| {
                SyncError::Transient(format!("preload of the {} cache exhausted its retries", self.kind))
            })?;
        log::info!("Preloading {} {} entities", entities.len(), self.kind);

        match self.kind.parent_attribute() {
            None => self.add_level(entities).await,
            Some(parent_attribute) => {
                // Each level must be fully cached before the next one starts.
                for (depth, level) in order_by_level(entities, parent_attribute)
                    .into_iter()
                    .enumerate()
                {
                    log::debug!(
                        "Preloading level {} of the {} cache ({} entities)",
                        depth + 1,
                        self.kind,
                        level.len()
                    );
                    self.add_level(level).await?;
                }
                Ok(())
            }
        }
    }

    /// Adds one level of entities using parallel workers.
    async fn add_level(&self, level: Vec<Entity>) -> Result<()> {
        if level.is_empty() {
            return Ok(());
        }
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let chunk_size = level.len().div_ceil(workers).max(1);

        let mut tasks = JoinSet::new();
        let mut remaining = level;
        while !remaining.is_empty() {
            let rest = remaining.split_off(chunk_size.min(remaining.len()));
            let chunk = std::mem::replace(&mut remaining, rest);
            let cache = self.clone();
            tasks.spawn(async move {
                for entity in &chunk {
                    if let Err(err) = cache.add(entity) {
                        log::warn!("Skipping {} during preload: {}", entity.key(), err);
                    }
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|err| SyncError::Other(err.into()))?;
        }
        Ok(())
    }

    async fn precheck(&self, identity: &str) -> Result<Option<Lookup>> {
        if let Some(entity) = self.cached_by_identity(identity) {
            return Ok(Some(Lookup::Found(entity)));
        }
        if self.is_ignored(identity) {
            return Ok(Some(Lookup::NotFound));
        }
        if self.ctx.preload_enabled && self.kind.is_preloadable() {
            self.preload().await?;
            return Ok(Some(match self.cached_by_identity(identity) {
                Some(entity) => Lookup::Found(entity),
                None => {
                    self.add_to_ignore_set(identity);
                    Lookup::NotFound
                }
            }));
        }
        Ok(None)
    }

    fn settle(&self, identity: &str, outcome: Lookup) -> Lookup {
        if !outcome.is_found() {
            log::debug!("No {} found for identity '{}' ({:?})", self.kind, identity, outcome);
            self.add_to_ignore_set(identity);
        }
        outcome
    }

    /// Resolves a glossary identity to its guid; the error side carries the failed outcome.
    async fn glossary_guid(&self, identity: &str) -> Result<std::result::Result<String, Lookup>> {
        let outcome = match self.precheck(identity).await? {
            Some(hit) => hit,
            None => {
                let outcome = self.lookup_glossary(identity).await?;
                self.settle(identity, outcome)
            }
        };
        Ok(match outcome {
            Lookup::Found(entity) => entity.guid.ok_or(Lookup::NotFound),
            other => Err(other),
        })
    }

    async fn first_match(&self, request: SearchRequest) -> Result<Lookup> {
        let Some(found) = self.ctx.remote_search(&request).await else {
            return Ok(Lookup::RetryExhausted);
        };
        if found.len() > 1 {
            log::warn!(
                "{} {} entities match {:?}, using the first",
                found.len(),
                self.kind,
                request.conditions
            );
        }
        match found.into_iter().next() {
            Some(entity) => {
                self.add(&entity)?;
                Ok(Lookup::Found(minimal(&entity)))
            }
            None => Ok(Lookup::NotFound),
        }
    }

    async fn lookup_glossary(&self, identity: &str) -> Result<Lookup> {
        self.first_match(SearchRequest::for_type(GLOSSARY).with(Condition::eq(NAME, identity)))
            .await
    }

    async fn lookup_term(&self, identity: &str) -> Result<Lookup> {
        let Some((name, glossary)) = split_term_identity(identity) else {
            log::warn!("Malformed term identity '{}'", identity);
            return Ok(Lookup::NotFound);
        };
        let glossary_guid = match self.ctx.cache(CacheKind::Glossary).glossary_guid(glossary).await? {
            Ok(guid) => guid,
            Err(outcome) => return Ok(outcome),
        };
        let request = SearchRequest::for_type(crate::kinds::GLOSSARY_TERM)
            .with(Condition::eq(NAME, name))
            .with(Condition::ref_guid(ANCHOR, glossary_guid));
        self.first_match(request).await
    }

    async fn lookup_asset(&self, identity: &str) -> Result<Lookup> {
        let Some((type_name, qualified_name)) = split_asset_identity(identity) else {
            log::warn!("Malformed asset reference '{}'", identity);
            return Ok(Lookup::NotFound);
        };
        let request =
            SearchRequest::for_type(type_name).with(Condition::eq(QUALIFIED_NAME, qualified_name));
        self.first_match(request).await
    }

    /// Walks a category or domain path from the root, caching each level on the way down.
    async fn lookup_hierarchy(&self, identity: &str) -> Result<Lookup> {
        let (Some(type_name), Some(parent_attribute)) =
            (self.kind.type_name(), self.kind.parent_attribute())
        else {
            return Ok(Lookup::NotFound);
        };
        let (segments, glossary): (Vec<&str>, Option<&str>) = match self.kind {
            CacheKind::Category => match split_category_identity(identity) {
                Some((segments, glossary)) => (segments, Some(glossary)),
                None => {
                    log::warn!("Malformed category identity '{}'", identity);
                    return Ok(Lookup::NotFound);
                }
            },
            _ => (identity.split(PATH_DELIMITER).collect(), None),
        };

        let mut anchor = None;
        if let Some(glossary) = glossary {
            match self.ctx.cache(CacheKind::Glossary).glossary_guid(glossary).await? {
                Ok(guid) => anchor = Some(Condition::ref_guid(ANCHOR, guid)),
                Err(outcome) => return Ok(outcome),
            }
        }

        let mut parent_guid: Option<String> = None;
        let mut found = None;
        for depth in 1..=segments.len() {
            let partial = compose_identity(&segments[..depth], glossary);
            if let Some(entity) = self.cached_by_identity(&partial) {
                parent_guid = entity.guid.clone();
                found = Some(entity);
                continue;
            }
            if self.is_ignored(&partial) {
                return Ok(Lookup::NotFound);
            }

            let mut request =
                SearchRequest::for_type(type_name).with(Condition::eq(NAME, segments[depth - 1]));
            if let Some(anchor) = &anchor {
                request = request.with(anchor.clone());
            }
            request = request.with(match &parent_guid {
                Some(parent) => Condition::ref_guid(parent_attribute, parent.clone()),
                None => Condition::missing(parent_attribute),
            });

            match self.first_match(request).await? {
                Lookup::Found(entity) => {
                    parent_guid = entity.guid.clone();
                    found = Some(entity);
                }
                other => return Ok(self.settle(&partial, other)),
            }
        }
        Ok(found.map(Lookup::Found).unwrap_or(Lookup::NotFound))
    }

    /// Makes sure the glossary and every ancestor of a fetched entity are cached.
    async fn ensure_ancestors(&self, entity: &Entity) -> Result<()> {
        if let Some(anchor_attribute) = self.kind.anchor_attribute() {
            if let Some(glossary_guid) = entity.ref_guid(anchor_attribute) {
                let glossaries = self.ctx.cache(CacheKind::Glossary);
                if glossaries.identity_for_guid(glossary_guid).is_none() {
                    if let Some(Some(glossary)) = self.ctx.fetch_by_guid(glossary_guid).await {
                        glossaries.add(&glossary)?;
                    }
                }
            }
        }

        let Some(parent_attribute) = self.kind.parent_attribute() else {
            return Ok(());
        };
        let mut pending = Vec::new();
        let mut visited = HashSet::new();
        let mut next = entity.ref_guid(parent_attribute).map(str::to_string);
        while let Some(guid) = next.take() {
            if self.identity_for_guid(&guid).is_some()
                || !visited.insert(guid.clone())
                || visited.len() > MAX_HIERARCHY_DEPTH
            {
                break;
            }
            if let Some(Some(parent)) = self.ctx.fetch_by_guid(&guid).await {
                next = parent.ref_guid(parent_attribute).map(str::to_string);
                pending.push(parent);
            }
        }
        for ancestor in pending.iter().rev() {
            self.add(ancestor)?;
        }
        Ok(())
    }
}

fn compose_identity(segments: &[&str], glossary: Option<&str>) -> String {
    let path = segments.join(PATH_DELIMITER);
    match glossary {
        Some(glossary) => format!("{path}{GLOSSARY_DELIMITER}{glossary}"),
        None => path,
    }
}

fn require_name(entity: &Entity) -> Result<&str> {
    entity
        .name()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| SyncError::InvalidValue {
            field: NAME.to_string(),
            reason: format!("{} has no name to derive an identity from", entity.key()),
        })
}

fn ancestor_missing(entity: &Entity, partial_path: &str) -> SyncError {
    SyncError::AncestorMissing {
        type_name: entity.type_name.clone(),
        partial_path: partial_path.to_string(),
    }
}

/// The subset of an entity the caches keep.
fn minimal(entity: &Entity) -> Entity {
    let mut kept = Entity::new(&entity.type_name, &entity.qualified_name);
    kept.guid = entity.guid.clone();
    kept.status = entity.status;
    for attribute in [NAME, ANCHOR, PARENT_CATEGORY, PARENT_DOMAIN] {
        if let Some(value) = entity.attribute(attribute) {
            kept.attributes.insert(attribute.to_string(), value.clone());
        }
    }
    kept
}

/// Groups a hierarchy into levels: entities without a parent (in this set) first,
/// then their children, and so on. Entities on a cycle are dropped.
fn order_by_level(entities: Vec<Entity>, parent_attribute: &str) -> Vec<Vec<Entity>> {
    let guids: HashSet<String> = entities.iter().filter_map(|e| e.guid.clone()).collect();
    let mut children: HashMap<String, Vec<Entity>> = HashMap::new();
    let mut current = Vec::new();
    for entity in entities {
        match entity.ref_guid(parent_attribute) {
            Some(parent) if guids.contains(parent) => {
                children.entry(parent.to_string()).or_default().push(entity);
            }
            _ => current.push(entity),
        }
    }
    // Entities with no parent at all before those whose parent lies outside the set.
    current.sort_by_key(|e| e.ref_guid(parent_attribute).is_some());

    let mut levels = Vec::new();
    while !current.is_empty() {
        let mut next = Vec::new();
        for entity in &current {
            if let Some(guid) = &entity.guid {
                if let Some(kids) = children.remove(guid) {
                    next.extend(kids);
                }
            }
        }
        levels.push(std::mem::replace(&mut current, next));
    }
    if !children.is_empty() {
        log::warn!(
            "{} entities could not be placed in the hierarchy (cycle in {})",
            children.values().map(Vec::len).sum::<usize>(),
            parent_attribute
        );
    }
    levels
}
