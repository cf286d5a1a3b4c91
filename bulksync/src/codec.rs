use crate::cache::{CacheContext, Lookup};
use crate::errors::{Result, SyncError};
use crate::kinds::{
    ASSET, CacheKind, LINK, LINK_URL, README, README_CONTENT, RelatedKind, TYPE_DELIMITER,
    split_asset_identity,
};
use crate::models::{Entity, EntityRef, NAME, Propagation, TagAttachment, Value};
use crate::registry::{Cardinality, FieldDef, FieldRegistry, FieldShape};
use crate::utils::id::{link_qualified_name, readme_qualified_name};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const ITEM_DELIMITER: char = '\n';
const PROPAGATION_DELIMITER: &str = ">>";
const SOURCE_OPEN: &str = "{{";
const SOURCE_CLOSE: &str = "}}";

/// One line of a `links` cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCell {
    pub name: String,
    pub url: String,
}

/// Converts between cell strings and typed attribute values.
///
/// Scalar shapes are handled locally. References go through the identity
/// caches of the current run.
#[derive(Clone)]
pub struct CellCodec {
    registry: Arc<FieldRegistry>,
    caches: Arc<CacheContext>,
    fail_fast: bool,
}

impl CellCodec {
    pub fn new(registry: Arc<FieldRegistry>, caches: Arc<CacheContext>, fail_fast: bool) -> Self {
        Self {
            registry,
            caches,
            fail_fast,
        }
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn caches(&self) -> &Arc<CacheContext> {
        &self.caches
    }

    /// Decodes a non-related cell. A blank cell decodes to `Value::Null`.
    pub async fn decode(&self, cell: &str, type_name: &str, field: &str) -> Result<Value> {
        let def = self.registry.require(type_name, field)?;
        if def.is_related() {
            return Err(SyncError::UnsupportedField {
                type_name: type_name.to_string(),
                field: field.to_string(),
            });
        }
        let cell = cell.trim();
        if cell.is_empty() {
            return Ok(Value::Null);
        }

        // Maps span several lines but are a single value.
        if def.cardinality == Cardinality::Single {
            return Ok(self.decode_item(cell, def).await?.unwrap_or(Value::Null));
        }

        let mut items = Vec::new();
        for line in cell.split(ITEM_DELIMITER).map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(value) = self.decode_item(line, def).await? {
                items.push((set_order_key(line, &value), value));
            }
        }
        Ok(match def.cardinality {
            Cardinality::Set => {
                // Same order `encode` writes: sorted by cell form, repeats dropped.
                items.sort_by(|(a, _), (b, _)| a.cmp(b));
                items.dedup_by(|(a, _), (b, _)| a == b);
                Value::Set(items.into_iter().map(|(_, value)| value).collect())
            }
            _ => Value::List(items.into_iter().map(|(_, value)| value).collect()),
        })
    }

    /// `None` means the item was a reference that could not be resolved and was dropped.
    async fn decode_item(&self, raw: &str, def: &FieldDef) -> Result<Option<Value>> {
        match &def.shape {
            FieldShape::Reference { target } => self.decode_reference(raw, *target, def).await,
            shape => decode_scalar(raw, shape, &def.name, &self.registry).map(Some),
        }
    }

    async fn decode_reference(
        &self,
        identity: &str,
        target: CacheKind,
        def: &FieldDef,
    ) -> Result<Option<Value>> {
        // Generic references go out by qualified name; the catalog resolves them.
        if target == CacheKind::Asset {
            let (type_name, qualified_name) =
                split_asset_identity(identity).ok_or_else(|| SyncError::InvalidValue {
                    field: def.name.clone(),
                    reason: format!("'{identity}' is not of the form typeName@qualifiedName"),
                })?;
            return Ok(Some(Value::Ref(EntityRef::by_qualified_name(
                type_name,
                qualified_name,
            ))));
        }
        match self.caches.cache(target).get_by_identity(identity).await? {
            Lookup::Found(entity) => Ok(Some(Value::Ref(entity.to_ref()))),
            outcome if self.fail_fast => {
                log::debug!("Reference '{}' in {} unresolved: {:?}", identity, def.name, outcome);
                Err(SyncError::IdentityNotFound {
                    kind: target.to_string(),
                    identity: identity.to_string(),
                })
            }
            outcome => {
                log::warn!(
                    "Dropping {} reference '{}' from field {} ({:?})",
                    target,
                    identity,
                    def.name,
                    outcome
                );
                Ok(None)
            }
        }
    }

    /// Encodes a value for export. References equal to `context_guid` are omitted.
    pub async fn encode(
        &self,
        value: &Value,
        type_name: &str,
        field: &str,
        context_guid: Option<&str>,
    ) -> Result<String> {
        let def = self.registry.require(type_name, field)?;
        let target = match def.shape {
            FieldShape::Reference { target } => target,
            _ => CacheKind::Asset,
        };
        match value {
            Value::List(items) | Value::Set(items) => {
                let mut encoded = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(text) = self.encode_item(item, target, context_guid).await? {
                        encoded.push(text);
                    }
                }
                if matches!(value, Value::Set(_)) {
                    encoded.sort();
                    encoded.dedup();
                }
                Ok(encoded.join("\n"))
            }
            single => Ok(self
                .encode_item(single, target, context_guid)
                .await?
                .unwrap_or_default()),
        }
    }

    async fn encode_item(
        &self,
        value: &Value,
        target: CacheKind,
        context_guid: Option<&str>,
    ) -> Result<Option<String>> {
        match value {
            Value::Ref(reference) => self.encode_reference(reference, target, context_guid).await,
            Value::List(_) | Value::Set(_) => Err(SyncError::InvalidValue {
                field: String::new(),
                reason: "nested collections cannot be written to a cell".into(),
            }),
            scalar => encode_scalar(scalar),
        }
    }

    async fn encode_reference(
        &self,
        reference: &EntityRef,
        target: CacheKind,
        context_guid: Option<&str>,
    ) -> Result<Option<String>> {
        if let (Some(guid), Some(context)) = (reference.guid.as_deref(), context_guid) {
            if guid == context {
                return Ok(None);
            }
        }
        if let Some(guid) = reference.guid.as_deref() {
            if let Some(identity) = self.caches.cache(target).identity_of_guid(guid).await? {
                return Ok(Some(identity));
            }
        }
        if target == CacheKind::Asset {
            if let Some(qn) = reference.qualified_name.as_deref() {
                return Ok(Some(format!("{}{TYPE_DELIMITER}{qn}", reference.type_name)));
            }
        }
        log::warn!("Omitting unresolvable {} reference {:?}", target, reference);
        Ok(None)
    }

    /// Builds the related entities a cell describes, owned by `owner`.
    pub fn decode_related(&self, cell: &str, owner: &Entity, kind: RelatedKind) -> Result<Vec<Entity>> {
        let cell = cell.trim();
        if cell.is_empty() {
            return Ok(Vec::new());
        }
        let owner_ref = Value::Ref(owner.self_ref());
        match kind {
            RelatedKind::Readme => {
                let title = owner.name().unwrap_or(&owner.qualified_name);
                let readme = Entity::new(README, readme_qualified_name(&owner.qualified_name))
                    .with_attribute(NAME, Value::Text(format!("{title} Readme")))
                    .with_attribute(README_CONTENT, Value::Text(cell.to_string()))
                    .with_attribute(ASSET, owner_ref);
                Ok(vec![readme])
            }
            RelatedKind::Link => cell
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| {
                    let link: LinkCell =
                        serde_json::from_str(line).map_err(|err| SyncError::InvalidValue {
                            field: "links".into(),
                            reason: format!("'{line}' is not a link object: {err}"),
                        })?;
                    Ok(
                        Entity::new(LINK, link_qualified_name(&owner.qualified_name, &link.url))
                            .with_attribute(NAME, Value::Text(link.name))
                            .with_attribute(LINK_URL, Value::Text(link.url))
                            .with_attribute(ASSET, owner_ref.clone()),
                    )
                })
                .collect(),
        }
    }
}

/// Encodes related entities back into their cell form.
pub fn encode_related(kind: RelatedKind, related: &[Entity]) -> Result<String> {
    match kind {
        RelatedKind::Readme => Ok(related
            .first()
            .and_then(|readme| readme.attribute(README_CONTENT))
            .and_then(Value::as_text)
            .unwrap_or_default()
            .to_string()),
        RelatedKind::Link => {
            let mut lines = Vec::with_capacity(related.len());
            for link in related {
                let cell = LinkCell {
                    name: link.name().unwrap_or_default().to_string(),
                    url: link
                        .attribute(LINK_URL)
                        .and_then(Value::as_text)
                        .unwrap_or_default()
                        .to_string(),
                };
                lines.push(serde_json::to_string(&cell)?);
            }
            lines.sort();
            Ok(lines.join("\n"))
        }
    }
}

/// Decodes a single non-reference item.
pub fn decode_scalar(raw: &str, shape: &FieldShape, field: &str, registry: &FieldRegistry) -> Result<Value> {
    let invalid = |reason: String| SyncError::InvalidValue {
        field: field.to_string(),
        reason,
    };
    match shape {
        FieldShape::Text => Ok(Value::Text(raw.to_string())),
        FieldShape::Integer => raw
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid(format!("'{raw}' is not an integer"))),
        FieldShape::Decimal => raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Value::Decimal)
            .ok_or_else(|| invalid(format!("'{raw}' is not a number"))),
        FieldShape::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Boolean(true)),
            "false" => Ok(Value::Boolean(false)),
            _ => Err(invalid(format!("'{raw}' is not true or false"))),
        },
        FieldShape::Timestamp => parse_timestamp(raw)
            .map(Value::Timestamp)
            .ok_or_else(|| invalid(format!("'{raw}' is not a recognised timestamp"))),
        FieldShape::Enum { enum_name } => {
            let def = registry.enum_def(enum_name).ok_or_else(|| {
                SyncError::Config(format!("enum '{enum_name}' is not registered"))
            })?;
            if def.contains(raw) {
                Ok(Value::Enum(raw.to_string()))
            } else {
                Err(invalid(format!("'{raw}' is not a valid {enum_name}")))
            }
        }
        FieldShape::Struct => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(map)) => Ok(Value::Struct(map)),
            _ => Err(invalid(format!("'{raw}' is not a JSON object"))),
        },
        FieldShape::Tag => parse_tag(raw).map(Value::Tag).ok_or_else(|| invalid(format!("'{raw}' is not a tag"))),
        FieldShape::Map => {
            let mut entries = BTreeMap::new();
            for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let (key, value) = line
                    .split_once('=')
                    .ok_or_else(|| invalid(format!("map entry '{line}' has no '='")))?;
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
            Ok(Value::Map(entries))
        }
        FieldShape::Reference { .. } | FieldShape::Related { .. } => Err(invalid(
            "references and related entities are not scalar".to_string(),
        )),
    }
}

/// Encodes a non-reference value. `Null` encodes to nothing.
pub fn encode_scalar(value: &Value) -> Result<Option<String>> {
    Ok(Some(match value {
        Value::Null => return Ok(None),
        Value::Text(s) | Value::Enum(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Timestamp(ms) => format_timestamp(*ms).ok_or_else(|| SyncError::InvalidValue {
            field: String::new(),
            reason: format!("{ms} is outside the representable time range"),
        })?,
        Value::Struct(map) => serde_json::to_string(map)?,
        Value::Tag(tag) => format_tag(tag),
        Value::Map(entries) => entries
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Ref(reference) => format!(
            "{}{TYPE_DELIMITER}{}",
            reference.type_name,
            reference.qualified_name.as_deref().unwrap_or_default()
        ),
        Value::List(_) | Value::Set(_) => {
            return Err(SyncError::InvalidValue {
                field: String::new(),
                reason: "collections are not scalar".into(),
            });
        }
    }))
}

/// Epoch millis from RFC 3339, a naive date-time (UTC assumed), a date, or epoch millis.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return Some(millis);
    }
    if let Ok(millis) = raw.parse::<f64>() {
        return millis.is_finite().then(|| millis.round() as i64);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub fn format_timestamp(millis: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// `Name`, `Name>>FULL` or `Name>>HIERARCHY`, optionally followed by `{{source}}`.
pub fn parse_tag(raw: &str) -> Option<TagAttachment> {
    let raw = raw.trim();
    let (head, source_value) = match raw.strip_suffix(SOURCE_CLOSE) {
        Some(rest) => {
            let (head, source) = rest.rsplit_once(SOURCE_OPEN)?;
            (head, Some(source.to_string()))
        }
        None => (raw, None),
    };
    let (name, propagation) = match head.split_once(PROPAGATION_DELIMITER) {
        Some((name, "FULL")) => (name, Propagation::Full),
        Some((name, "HIERARCHY")) => (name, Propagation::HierarchyOnly),
        Some(_) => return None,
        None => (head, Propagation::None),
    };
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(TagAttachment {
        tag_name: name.to_string(),
        propagation,
        source_value,
    })
}

pub fn format_tag(tag: &TagAttachment) -> String {
    let mut out = tag.tag_name.clone();
    match tag.propagation {
        Propagation::None => {}
        Propagation::Full => out.push_str(">>FULL"),
        Propagation::HierarchyOnly => out.push_str(">>HIERARCHY"),
    }
    if let Some(source) = &tag.source_value {
        out.push_str(SOURCE_OPEN);
        out.push_str(source);
        out.push_str(SOURCE_CLOSE);
    }
    out
}

/// Cell form of a decoded set item. References keep the identity they were written as.
fn set_order_key(raw: &str, value: &Value) -> String {
    match value {
        Value::Ref(_) => raw.to_string(),
        scalar => encode_scalar(scalar)
            .ok()
            .flatten()
            .unwrap_or_else(|| raw.to_string()),
    }
}
