use crate::codec::{CellCodec, encode_related};
use crate::delta::DeltaResult;
use crate::errors::{Result, SyncError};
use crate::kinds::CacheKind;
use crate::models::{Entity, EntityKey, QUALIFIED_NAME, TYPE_NAME, Value};
use crate::registry::{
    ANNOUNCEMENT_MESSAGE, ANNOUNCEMENT_TITLE, ANNOUNCEMENT_TYPE, CERTIFICATE_STATUS,
    CERTIFICATE_STATUS_MESSAGE, FieldDef, FieldShape,
};
use csv::StringRecord;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Column layout of a tabular file.
#[derive(Debug, Clone)]
pub struct Header {
    columns: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Header {
    /// Fails with `Schema` unless both `typeName` and `qualifiedName` are present.
    pub fn new<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns
            .into_iter()
            .map(|c| c.into().trim().to_string())
            .collect();
        let positions: HashMap<String, usize> = columns
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        let missing: Vec<String> = [TYPE_NAME, QUALIFIED_NAME]
            .into_iter()
            .filter(|required| !positions.contains_key(*required))
            .map(String::from)
            .collect();
        if !missing.is_empty() {
            return Err(SyncError::Schema { missing });
        }
        Ok(Self { columns, positions })
    }

    pub fn from_record(record: &StringRecord) -> Result<Self> {
        Self::new(record.iter())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    pub fn type_idx(&self) -> usize {
        self.positions[TYPE_NAME]
    }

    pub fn qn_idx(&self) -> usize {
        self.positions[QUALIFIED_NAME]
    }

    pub fn to_record(&self) -> StringRecord {
        StringRecord::from(self.columns.clone())
    }
}

/// Which entity types a pass accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeFilter {
    Only(BTreeSet<String>),
    Except(BTreeSet<String>),
}

impl TypeFilter {
    pub fn only<'a>(types: impl IntoIterator<Item = &'a str>) -> Self {
        TypeFilter::Only(types.into_iter().map(String::from).collect())
    }

    pub fn except<'a>(types: impl IntoIterator<Item = &'a str>) -> Self {
        TypeFilter::Except(types.into_iter().map(String::from).collect())
    }

    pub fn accepts(&self, type_name: &str) -> bool {
        match self {
            TypeFilter::Only(types) => types.contains(type_name),
            TypeFilter::Except(types) => !types.contains(type_name),
        }
    }
}

/// Whether a row takes part in a pass: its type must match and, under a
/// changes-only delta, its key must be due for reload.
pub fn include_row(
    row: &StringRecord,
    type_idx: usize,
    qn_idx: usize,
    type_filter: &TypeFilter,
    delta: Option<&DeltaResult>,
) -> bool {
    let type_name = row.get(type_idx).unwrap_or_default().trim();
    let qualified_name = row.get(qn_idx).unwrap_or_default().trim();
    if type_name.is_empty() || qualified_name.is_empty() || !type_filter.accepts(type_name) {
        return false;
    }
    delta.is_none_or(|delta| delta.should_reload(&EntityKey::new(type_name, qualified_name)))
}

/// Everything one row turns into.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBuild {
    pub primary: Entity,
    /// Related entities per related field, created once the primary has a durable guid.
    pub related: BTreeMap<String, Vec<Entity>>,
    /// Related fields whose existing entities must be removed.
    pub fields_to_null: BTreeSet<String>,
    /// Raw cells of references to the row's own kind, e.g. term to term. Rows
    /// of one pass may point at each other, so these resolve after the flush.
    pub deferred: BTreeMap<String, String>,
}

/// References between entities of the same kind, other than the hierarchy
/// parent, which the level passes already order.
fn is_same_kind_reference(type_name: &str, def: &FieldDef) -> bool {
    match def.shape {
        FieldShape::Reference { target } => {
            target != CacheKind::Asset
                && target == CacheKind::for_type(type_name)
                && target.parent_attribute() != Some(def.name.as_str())
        }
        _ => false,
    }
}

pub struct RowDeserializer {
    codec: CellCodec,
    attributes_to_overwrite: HashSet<String>,
}

impl RowDeserializer {
    pub fn new(codec: CellCodec, attributes_to_overwrite: impl IntoIterator<Item = String>) -> Self {
        Self {
            codec,
            attributes_to_overwrite: attributes_to_overwrite.into_iter().collect(),
        }
    }

    pub fn codec(&self) -> &CellCodec {
        &self.codec
    }

    pub async fn build_from_row(
        &self,
        row: &StringRecord,
        header: &Header,
        type_idx: usize,
        qn_idx: usize,
        skip_columns: &HashSet<String>,
    ) -> Result<RowBuild> {
        let type_name = row.get(type_idx).unwrap_or_default().trim();
        let qualified_name = row.get(qn_idx).unwrap_or_default().trim();
        if type_name.is_empty() || qualified_name.is_empty() {
            return Err(SyncError::InvalidValue {
                field: QUALIFIED_NAME.to_string(),
                reason: "rows need both a typeName and a qualifiedName".into(),
            });
        }

        let registry = self.codec.registry();
        let mut primary = Entity::new(type_name, qualified_name);
        let mut related_cells = Vec::new();
        let mut fields_to_null = BTreeSet::new();
        let mut deferred = BTreeMap::new();

        for (idx, column) in header.columns().iter().enumerate() {
            if idx == type_idx || idx == qn_idx || skip_columns.contains(column) {
                continue;
            }
            let cell = row.get(idx).unwrap_or_default();
            if cell.trim().is_empty() {
                if !self.attributes_to_overwrite.contains(column) {
                    continue;
                }
                match registry.field(type_name, column) {
                    Some(def) if def.is_related() => {
                        fields_to_null.insert(column.clone());
                    }
                    Some(_) => {
                        primary.attributes.insert(column.clone(), Value::Null);
                    }
                    // Blank columns that belong to other types in a mixed file.
                    None => {}
                }
                continue;
            }

            let def = registry.require(type_name, column)?;
            match def.related_kind() {
                Some(kind) => related_cells.push((column.clone(), kind, cell)),
                None if is_same_kind_reference(type_name, def) => {
                    deferred.insert(column.clone(), cell.to_string());
                }
                None => {
                    let value = self.codec.decode(cell, type_name, column).await?;
                    primary.attributes.insert(column.clone(), value);
                }
            }
        }

        apply_clear_overrides(&mut primary);

        let mut related = BTreeMap::new();
        for (column, kind, cell) in related_cells {
            related.insert(column, self.codec.decode_related(cell, &primary, kind)?);
        }

        Ok(RowBuild {
            primary,
            related,
            fields_to_null,
            deferred,
        })
    }

    /// Decodes the cells `build_from_row` held back.
    pub async fn decode_deferred(
        &self,
        type_name: &str,
        cells: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut values = BTreeMap::new();
        for (column, cell) in cells {
            values.insert(column.clone(), self.codec.decode(cell, type_name, column).await?);
        }
        Ok(values)
    }

    /// Keys of the related entities a row describes, whether or not the row builds.
    ///
    /// Cells that cannot be parsed count as one entity each.
    pub fn related_keys(&self, row: &StringRecord, header: &Header, type_idx: usize, qn_idx: usize) -> Vec<EntityKey> {
        let type_name = row.get(type_idx).unwrap_or_default().trim();
        let qualified_name = row.get(qn_idx).unwrap_or_default().trim();
        let owner = Entity::new(type_name, qualified_name);
        let mut keys = Vec::new();
        for (idx, column) in header.columns().iter().enumerate() {
            let cell = row.get(idx).unwrap_or_default();
            if cell.trim().is_empty() {
                continue;
            }
            let Some(kind) = self
                .codec
                .registry()
                .field(type_name, column)
                .and_then(FieldDef::related_kind)
            else {
                continue;
            };
            match self.codec.decode_related(cell, &owner, kind) {
                Ok(related) => keys.extend(related.iter().map(Entity::key)),
                Err(_) => keys.push(EntityKey::new(kind.type_name(), qualified_name)),
            }
        }
        keys
    }
}

/// Clearing a status also clears the fields that only make sense alongside it.
fn apply_clear_overrides(entity: &mut Entity) {
    let dependents: [(&str, &[&str]); 2] = [
        (CERTIFICATE_STATUS, &[CERTIFICATE_STATUS_MESSAGE]),
        (ANNOUNCEMENT_TYPE, &[ANNOUNCEMENT_TITLE, ANNOUNCEMENT_MESSAGE]),
    ];
    for (status, cleared) in dependents {
        if entity.attribute(status).is_some_and(Value::is_null) {
            for field in cleared {
                entity.attributes.insert(field.to_string(), Value::Null);
            }
        }
    }
}

/// An entity ready for export together with the related entities it owns.
#[derive(Debug, Clone)]
pub struct ExportRow {
    pub entity: Entity,
    pub related: BTreeMap<String, Vec<Entity>>,
}

impl ExportRow {
    pub fn new(entity: Entity) -> Self {
        Self {
            entity,
            related: BTreeMap::new(),
        }
    }

    pub fn with_related(mut self, field: &str, related: Vec<Entity>) -> Self {
        self.related.insert(field.to_string(), related);
        self
    }
}

/// Turns entities back into rows laid out by a fixed header.
pub struct RowGenerator {
    codec: CellCodec,
    header: Header,
}

impl RowGenerator {
    pub fn new(codec: CellCodec, header: Header) -> Self {
        Self { codec, header }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub async fn build_from_asset(
        &self,
        entity: &Entity,
        related: &BTreeMap<String, Vec<Entity>>,
    ) -> Result<Vec<String>> {
        let registry = self.codec.registry();
        let mut cells = Vec::with_capacity(self.header.columns().len());
        for column in self.header.columns() {
            let cell = match column.as_str() {
                TYPE_NAME => entity.type_name.clone(),
                QUALIFIED_NAME => entity.qualified_name.clone(),
                _ => match registry.field(&entity.type_name, column) {
                    None => String::new(),
                    Some(def) => match def.related_kind() {
                        Some(kind) => match related.get(column) {
                            Some(owned) => encode_related(kind, owned)?,
                            None => String::new(),
                        },
                        None => match entity.attribute(column) {
                            Some(value) => {
                                self.codec
                                    .encode(value, &entity.type_name, column, entity.guid.as_deref())
                                    .await?
                            }
                            None => String::new(),
                        },
                    },
                },
            };
            cells.push(cell);
        }
        Ok(cells)
    }

    /// Writes the header and one row per entity. Returns the number of rows written.
    pub async fn write_file(&self, path: &Path, rows: &[ExportRow], separator: u8) -> Result<usize> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(separator)
            .from_path(path)?;
        writer.write_record(self.header.columns())?;
        let mut written = 0;
        for row in rows {
            let cells = self.build_from_asset(&row.entity, &row.related).await?;
            writer.write_record(&cells)?;
            written += 1;
        }
        writer.flush()?;
        log::info!("Exported {} rows to {}", written, path.display());
        Ok(written)
    }
}
