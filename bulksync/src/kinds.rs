use serde::Deserialize;
use std::fmt;

pub const GLOSSARY: &str = "Glossary";
pub const GLOSSARY_TERM: &str = "GlossaryTerm";
pub const GLOSSARY_CATEGORY: &str = "GlossaryCategory";
pub const DATA_DOMAIN: &str = "DataDomain";
pub const README: &str = "Readme";
pub const LINK: &str = "Link";

pub const ANCHOR: &str = "anchor";
pub const PARENT_CATEGORY: &str = "parentCategory";
pub const PARENT_DOMAIN: &str = "parentDomain";
pub const ASSET: &str = "asset";
/// Attribute of a readme holding its document content.
pub const README_CONTENT: &str = "description";
/// Attribute of a link holding its url.
pub const LINK_URL: &str = "link";

/// Separates the path of a category or domain from its leaf name.
pub const PATH_DELIMITER: &str = "@";
/// Separates a term or category from the glossary it belongs to.
pub const GLOSSARY_DELIMITER: &str = "@@@";
/// Separates the type from the qualified name in a generic reference.
pub const TYPE_DELIMITER: &str = "@";

/// The closed set of entity kinds that have their own identity convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Glossary,
    Term,
    Category,
    Domain,
    /// Any other type, identified by `typeName@qualifiedName`.
    Asset,
}

impl CacheKind {
    pub fn for_type(type_name: &str) -> CacheKind {
        match type_name {
            GLOSSARY => CacheKind::Glossary,
            GLOSSARY_TERM => CacheKind::Term,
            GLOSSARY_CATEGORY => CacheKind::Category,
            DATA_DOMAIN => CacheKind::Domain,
            _ => CacheKind::Asset,
        }
    }

    /// The concrete type name, for kinds bound to exactly one type.
    pub fn type_name(&self) -> Option<&'static str> {
        match self {
            CacheKind::Glossary => Some(GLOSSARY),
            CacheKind::Term => Some(GLOSSARY_TERM),
            CacheKind::Category => Some(GLOSSARY_CATEGORY),
            CacheKind::Domain => Some(DATA_DOMAIN),
            CacheKind::Asset => None,
        }
    }

    /// Self-referencing attribute that makes the kind a hierarchy.
    pub fn parent_attribute(&self) -> Option<&'static str> {
        match self {
            CacheKind::Category => Some(PARENT_CATEGORY),
            CacheKind::Domain => Some(PARENT_DOMAIN),
            _ => None,
        }
    }

    /// Attribute pointing at the owning glossary.
    pub fn anchor_attribute(&self) -> Option<&'static str> {
        match self {
            CacheKind::Term | CacheKind::Category => Some(ANCHOR),
            _ => None,
        }
    }

    /// Kinds that can be bulk-loaded up front.
    pub fn is_preloadable(&self) -> bool {
        !matches!(self, CacheKind::Asset)
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CacheKind::Glossary => "glossary",
            CacheKind::Term => "term",
            CacheKind::Category => "category",
            CacheKind::Domain => "domain",
            CacheKind::Asset => "asset",
        };
        f.write_str(label)
    }
}

/// Entities that can only be created once their owner has a durable guid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatedKind {
    Readme,
    Link,
}

impl RelatedKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RelatedKind::Readme => README,
            RelatedKind::Link => LINK,
        }
    }
}

/// Splits a category identity into its path segments and glossary identity.
pub fn split_category_identity(identity: &str) -> Option<(Vec<&str>, &str)> {
    let (path, glossary) = identity.rsplit_once(GLOSSARY_DELIMITER)?;
    if path.is_empty() || glossary.is_empty() {
        return None;
    }
    Some((path.split(PATH_DELIMITER).collect(), glossary))
}

/// Splits a term identity into its name and glossary identity.
pub fn split_term_identity(identity: &str) -> Option<(&str, &str)> {
    let (name, glossary) = identity.rsplit_once(GLOSSARY_DELIMITER)?;
    if name.is_empty() || glossary.is_empty() {
        return None;
    }
    Some((name, glossary))
}

/// Splits a generic `typeName@qualifiedName` reference.
pub fn split_asset_identity(identity: &str) -> Option<(&str, &str)> {
    let (type_name, qn) = identity.split_once(TYPE_DELIMITER)?;
    if type_name.is_empty() || qn.is_empty() {
        return None;
    }
    Some((type_name, qn))
}

/// Number of levels in a hierarchical identity (root = 1).
pub fn hierarchy_depth(kind: CacheKind, identity: &str) -> usize {
    match kind {
        CacheKind::Category => split_category_identity(identity)
            .map(|(path, _)| path.len())
            .unwrap_or(1),
        CacheKind::Domain => identity.split(PATH_DELIMITER).count(),
        _ => 1,
    }
}
