use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const TYPE_NAME: &str = "typeName";
pub const QUALIFIED_NAME: &str = "qualifiedName";
pub const NAME: &str = "name";

/// Uniquely identifies an entity in the catalog independent of its guid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub type_name: String,
    pub qualified_name: String,
}

impl EntityKey {
    pub fn new(type_name: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            qualified_name: qualified_name.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.type_name, self.qualified_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    #[default]
    Active,
    Archived,
}

/// A reference from one entity to another, by guid or by unique attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualified_name: Option<String>,
}

impl EntityRef {
    pub fn by_guid(type_name: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            guid: Some(guid.into()),
            qualified_name: None,
        }
    }

    pub fn by_qualified_name(type_name: impl Into<String>, qn: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            guid: None,
            qualified_name: Some(qn.into()),
        }
    }
}

/// How a tag attached to an entity flows to other entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    #[default]
    None,
    Full,
    HierarchyOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagAttachment {
    pub tag_name: String,
    #[serde(default)]
    pub propagation: Propagation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_value: Option<String>,
}

/// A typed attribute value. Every cell of a tabular file decodes to one of these.
///
/// `Set` compares without regard to order or repeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    Enum(String),
    Struct(serde_json::Map<String, serde_json::Value>),
    Tag(TagAttachment),
    Ref(EntityRef),
    Map(BTreeMap<String, String>),
    List(Vec<Value>),
    Set(Vec<Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Text(a), Text(b)) | (Enum(a), Enum(b)) => a == b,
            (Integer(a), Integer(b)) | (Timestamp(a), Timestamp(b)) => a == b,
            (Decimal(a), Decimal(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            (Struct(a), Struct(b)) => a == b,
            (Tag(a), Tag(b)) => a == b,
            (Ref(a), Ref(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Set(a), Set(b)) => a.iter().all(|x| b.contains(x)) && b.iter().all(|y| a.contains(y)),
            _ => false,
        }
    }
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Enum(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_ref_value(&self) -> Option<&EntityRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// All references held by this value, flattening collections.
    pub fn refs(&self) -> Vec<&EntityRef> {
        match self {
            Value::Ref(r) => vec![r],
            Value::List(items) | Value::Set(items) => items.iter().flat_map(|v| v.refs()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    pub qualified_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub status: EntityStatus,
}

impl Entity {
    pub fn new(type_name: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            guid: None,
            qualified_name: qualified_name.into(),
            attributes: BTreeMap::new(),
            status: EntityStatus::Active,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.type_name, &self.qualified_name)
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn name(&self) -> Option<&str> {
        self.attribute(NAME).and_then(Value::as_text)
    }

    /// Guid of a singular reference attribute, when resolved.
    pub fn ref_guid(&self, attribute: &str) -> Option<&str> {
        self.attribute(attribute)
            .and_then(Value::as_ref_value)
            .and_then(|r| r.guid.as_deref())
    }

    /// Reference carrying whatever guid the entity has, placeholder included.
    pub fn self_ref(&self) -> EntityRef {
        EntityRef {
            type_name: self.type_name.clone(),
            guid: self.guid.clone(),
            qualified_name: Some(self.qualified_name.clone()),
        }
    }

    pub fn to_ref(&self) -> EntityRef {
        match &self.guid {
            Some(guid) if !is_placeholder(guid) => EntityRef::by_guid(&self.type_name, guid),
            _ => EntityRef::by_qualified_name(&self.type_name, &self.qualified_name),
        }
    }
}

/// Placeholder guids are negative integers handed out inside a single pass.
pub fn is_placeholder(guid: &str) -> bool {
    guid.starts_with('-') && guid[1..].chars().all(|c| c.is_ascii_digit()) && guid.len() > 1
}
