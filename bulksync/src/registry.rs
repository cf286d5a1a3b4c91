use crate::errors::{Result, SyncError};
use crate::kinds::{
    ANCHOR, CacheKind, DATA_DOMAIN, GLOSSARY_CATEGORY, GLOSSARY_TERM, PARENT_CATEGORY,
    PARENT_DOMAIN, RelatedKind,
};
use serde::Deserialize;
use std::collections::HashMap;

pub const CERTIFICATE_STATUS: &str = "certificateStatus";
pub const CERTIFICATE_STATUS_MESSAGE: &str = "certificateStatusMessage";
pub const ANNOUNCEMENT_TYPE: &str = "announcementType";
pub const ANNOUNCEMENT_TITLE: &str = "announcementTitle";
pub const ANNOUNCEMENT_MESSAGE: &str = "announcementMessage";
pub const README_FIELD: &str = "readme";
pub const LINKS_FIELD: &str = "links";
pub const TAGS_FIELD: &str = "tags";
pub const CONNECTION_QUALIFIED_NAME: &str = "connectionQualifiedName";

/// The shape a single cell value takes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum FieldShape {
    Text,
    Integer,
    Decimal,
    Boolean,
    Timestamp,
    Enum { enum_name: String },
    Struct,
    Tag,
    Map,
    Reference { target: CacheKind },
    Related { related: RelatedKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    Single,
    List,
    Set,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub shape: FieldShape,
    pub cardinality: Cardinality,
}

impl FieldDef {
    pub fn new(name: &str, shape: FieldShape, cardinality: Cardinality) -> Self {
        Self {
            name: name.to_string(),
            shape,
            cardinality,
        }
    }

    pub fn single(name: &str, shape: FieldShape) -> Self {
        Self::new(name, shape, Cardinality::Single)
    }

    pub fn is_related(&self) -> bool {
        matches!(self.shape, FieldShape::Related { .. })
    }

    pub fn related_kind(&self) -> Option<RelatedKind> {
        match self.shape {
            FieldShape::Related { related } => Some(related),
            _ => None,
        }
    }
}

/// A field declared through configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    /// Type the field belongs to; `None` adds it to every type.
    #[serde(default)]
    pub type_name: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub shape: FieldShape,
    #[serde(default)]
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<String>,
}

impl EnumDef {
    fn new(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// Maps `(typeName, field)` to the strategy used to encode and decode its cells.
///
/// Built once per run; every cell lookup is a pair of hash probes.
#[derive(Debug, Clone)]
pub struct FieldRegistry {
    common: HashMap<String, FieldDef>,
    by_type: HashMap<String, HashMap<String, FieldDef>>,
    enums: HashMap<String, EnumDef>,
}

impl FieldRegistry {
    pub fn empty() -> Self {
        Self {
            common: HashMap::new(),
            by_type: HashMap::new(),
            enums: HashMap::new(),
        }
    }

    /// The standard set of fields understood for every catalog type.
    pub fn standard() -> Self {
        use Cardinality::*;
        use FieldShape::*;

        let mut registry = Self::empty();
        registry.add_enum(EnumDef::new(
            "CertificateStatus",
            &["DRAFT", "VERIFIED", "DEPRECATED"],
        ));
        registry.add_enum(EnumDef::new(
            "AnnouncementType",
            &["information", "warning", "issue"],
        ));

        let certificate = Enum {
            enum_name: "CertificateStatus".into(),
        };
        let announcement = Enum {
            enum_name: "AnnouncementType".into(),
        };
        for def in [
            FieldDef::single("name", Text),
            FieldDef::single("displayName", Text),
            FieldDef::single("description", Text),
            FieldDef::single("userDescription", Text),
            FieldDef::single(CERTIFICATE_STATUS, certificate),
            FieldDef::single(CERTIFICATE_STATUS_MESSAGE, Text),
            FieldDef::single(ANNOUNCEMENT_TYPE, announcement),
            FieldDef::single(ANNOUNCEMENT_TITLE, Text),
            FieldDef::single(ANNOUNCEMENT_MESSAGE, Text),
            FieldDef::new("ownerUsers", Text, Set),
            FieldDef::new("ownerGroups", Text, Set),
            FieldDef::new(TAGS_FIELD, Tag, List),
            FieldDef::new(
                "assignedTerms",
                Reference {
                    target: CacheKind::Term,
                },
                Set,
            ),
            FieldDef::single(
                "domain",
                Reference {
                    target: CacheKind::Domain,
                },
            ),
            FieldDef::single("sourceCreatedAt", Timestamp),
            FieldDef::single("sourceUpdatedAt", Timestamp),
            FieldDef::single("customProperties", Map),
            FieldDef::single("sourceMetadata", Struct),
            FieldDef::single("popularityScore", Decimal),
            FieldDef::single("isDiscoverable", Boolean),
            FieldDef::single(CONNECTION_QUALIFIED_NAME, Text),
            FieldDef::single(
                README_FIELD,
                Related {
                    related: RelatedKind::Readme,
                },
            ),
            FieldDef::new(
                LINKS_FIELD,
                Related {
                    related: RelatedKind::Link,
                },
                List,
            ),
        ] {
            registry.add_common(def);
        }

        let glossary_ref = Reference {
            target: CacheKind::Glossary,
        };
        registry.add_for_type(GLOSSARY_TERM, FieldDef::single(ANCHOR, glossary_ref.clone()));
        registry.add_for_type(
            GLOSSARY_TERM,
            FieldDef::new(
                "categories",
                Reference {
                    target: CacheKind::Category,
                },
                Set,
            ),
        );
        registry.add_for_type(
            GLOSSARY_TERM,
            FieldDef::new(
                "seeAlso",
                Reference {
                    target: CacheKind::Term,
                },
                Set,
            ),
        );
        registry.add_for_type(GLOSSARY_CATEGORY, FieldDef::single(ANCHOR, glossary_ref));
        registry.add_for_type(
            GLOSSARY_CATEGORY,
            FieldDef::single(
                PARENT_CATEGORY,
                Reference {
                    target: CacheKind::Category,
                },
            ),
        );
        registry.add_for_type(
            DATA_DOMAIN,
            FieldDef::single(
                PARENT_DOMAIN,
                Reference {
                    target: CacheKind::Domain,
                },
            ),
        );

        let asset_ref = Reference {
            target: CacheKind::Asset,
        };
        registry.add_for_type("Table", FieldDef::single("rowCount", Integer));
        registry.add_for_type("Table", FieldDef::single("schema", asset_ref.clone()));
        registry.add_for_type("Column", FieldDef::single("table", asset_ref.clone()));
        registry.add_for_type("Column", FieldDef::single("dataType", Text));
        registry.add_for_type("Column", FieldDef::single("order", Integer));
        registry.add_for_type("Process", FieldDef::new("inputs", asset_ref.clone(), List));
        registry.add_for_type("Process", FieldDef::new("outputs", asset_ref, List));

        registry
    }

    /// The standard registry extended with configured fields.
    pub fn with_extra_fields(specs: &[FieldSpec]) -> Result<Self> {
        let mut registry = Self::standard();
        for spec in specs {
            if let FieldShape::Enum { enum_name } = &spec.shape {
                if !registry.enums.contains_key(enum_name) {
                    return Err(SyncError::Config(format!(
                        "field '{}' refers to unknown enum '{}'",
                        spec.name, enum_name
                    )));
                }
            }
            let def = FieldDef::new(&spec.name, spec.shape.clone(), spec.cardinality);
            match &spec.type_name {
                Some(type_name) => registry.add_for_type(type_name, def),
                None => registry.add_common(def),
            }
        }
        Ok(registry)
    }

    pub fn add_enum(&mut self, def: EnumDef) {
        self.enums.insert(def.name.clone(), def);
    }

    pub fn add_common(&mut self, def: FieldDef) {
        self.common.insert(def.name.clone(), def);
    }

    pub fn add_for_type(&mut self, type_name: &str, def: FieldDef) {
        self.by_type
            .entry(type_name.to_string())
            .or_default()
            .insert(def.name.clone(), def);
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldDef> {
        self.by_type
            .get(type_name)
            .and_then(|fields| fields.get(field))
            .or_else(|| self.common.get(field))
    }

    pub fn require(&self, type_name: &str, field: &str) -> Result<&FieldDef> {
        self.field(type_name, field)
            .ok_or_else(|| SyncError::UnsupportedField {
                type_name: type_name.to_string(),
                field: field.to_string(),
            })
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumDef> {
        self.enums.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_specific_fields_shadow_common() {
        let registry = FieldRegistry::standard();
        let anchor = registry.require(GLOSSARY_TERM, ANCHOR).unwrap();
        assert_eq!(
            anchor.shape,
            FieldShape::Reference {
                target: CacheKind::Glossary
            }
        );
        assert!(registry.field("Table", ANCHOR).is_none());
        assert!(registry.field("Table", "description").is_some());
    }

    #[test]
    fn test_unknown_field_is_unsupported() {
        let registry = FieldRegistry::standard();
        let err = registry.require("Table", "noSuchField").unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedField { .. }));
    }

    #[test]
    fn test_extra_fields_from_config() {
        let specs: Vec<FieldSpec> = serde_json::from_str(
            r#"[
                {"type_name": "Dashboard", "name": "tiles", "shape": "integer"},
                {"name": "steward", "shape": "reference", "target": "asset", "cardinality": "list"}
            ]"#,
        )
        .unwrap();
        let registry = FieldRegistry::with_extra_fields(&specs).unwrap();
        assert_eq!(
            registry.require("Dashboard", "tiles").unwrap().shape,
            FieldShape::Integer
        );
        assert_eq!(
            registry.require("Table", "steward").unwrap().cardinality,
            Cardinality::List
        );
    }

    #[test]
    fn test_extra_field_with_unknown_enum_rejected() {
        let specs: Vec<FieldSpec> = serde_json::from_str(
            r#"[{"name": "tier", "shape": "enum", "enum_name": "Tier"}]"#,
        )
        .unwrap();
        assert!(FieldRegistry::with_extra_fields(&specs).is_err());
    }
}
