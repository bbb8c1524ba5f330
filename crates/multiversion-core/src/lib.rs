//! Domain model for retrofitting multi-version storage onto legacy entity tables.
//!
//! This crate is storage-agnostic. It owns:
//! - the revision-token chain ([`RevisionToken`]),
//! - entity-kind and field descriptors plus the derived table layouts,
//! - the typed conversion progress records,
//! - the narrow host contracts ([`SchemaOps`], [`DefinitionRegistry`],
//!   [`SettingsStore`], [`ActiveWorkspace`]) implemented by storage backends.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const DEFAULT_WORKSPACE: &str = "live";
pub const SHADOW_PREFIX: &str = "tmp_";
pub const BACKUP_PREFIX: &str = "old_";
pub const DEFAULT_BATCH_SIZE: usize = 50;

pub const REV_FIELD: &str = "_rev";
pub const DELETED_FIELD: &str = "_deleted";
pub const WORKSPACE_FIELD: &str = "workspace";
pub const REVISION_DEFAULT_FIELD: &str = "revision_default";
pub const REVISION_TRANSLATION_AFFECTED_FIELD: &str = "revision_translation_affected";
pub const DEFAULT_REVISION_KEY: &str = "revision_id";
pub const DEFAULT_PUBLISHED_KEY: &str = "status";

pub const SETTINGS_KEY: &str = "multiversion.settings";
pub const FAILED_KINDS_KEY: &str = "multiversion.failed_kinds";

/// Token carried by placeholder entities until their first real save.
pub const STUB_TOKEN: &str = "0-00000000000000000000000000000000";

const DIGEST_HEX_LEN: usize = 32;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MultiversionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Failures that are isolated to a single entity kind during conversion.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversionError {
    #[error("failed to build shadow schema for entity kind {kind}: {message}")]
    SchemaBuild { kind: String, message: String },
    #[error("the entity update process failed while processing the entity {kind}:{entity_id}: {message}")]
    Copy {
        kind: String,
        entity_id: i64,
        message: String,
    },
    #[error("failed to copy a batch of entity kind {kind}: {message}")]
    Batch { kind: String, message: String },
    #[error("failed to commit converted schema for entity kind {kind}: {message}")]
    Commit { kind: String, message: String },
}

/// Typed DDL failures a caller may want to tolerate.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SchemaError {
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("table {0} already exists")]
    TableExists(String),
    #[error("primary key on table {0} already exists")]
    KeyExists(String),
}

impl ConversionError {
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::SchemaBuild { kind, .. }
            | Self::Copy { kind, .. }
            | Self::Batch { kind, .. }
            | Self::Commit { kind, .. } => kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Revision tokens
// ---------------------------------------------------------------------------

/// A chained revision identifier rendered as `<index>-<32 hex digest>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionToken {
    index: u64,
    digest: String,
}

impl RevisionToken {
    /// Computes the token following `previous` for a save at `sequence_index`.
    ///
    /// The digest covers `[is_deleted, 0, previous, entity_id, []]`. The `0`
    /// and the empty list are reserved slots for a sequence id and an
    /// attachment list and are always serialized as shown.
    #[must_use]
    pub fn compute(
        previous: Option<&str>,
        is_deleted: bool,
        entity_id: &str,
        sequence_index: u64,
    ) -> Self {
        let payload = serde_json::json!([is_deleted, 0, previous, entity_id, []]);
        Self {
            index: sequence_index.saturating_add(1),
            digest: digest128(payload.to_string().as_bytes()),
        }
    }

    /// First token for a row migrated from legacy storage.
    #[must_use]
    pub fn initial(entity_id: &str, uuid: &str, salt: &str) -> Self {
        Self {
            index: 1,
            digest: digest128(format!("{entity_id}:{uuid}:{salt}").as_bytes()),
        }
    }

    /// Like [`RevisionToken::initial`] with a fresh random salt.
    #[must_use]
    pub fn generate_initial(entity_id: &str, uuid: &str) -> Self {
        Self::initial(entity_id, uuid, &Ulid::new().to_string())
    }

    #[must_use]
    pub fn stub() -> Self {
        Self {
            index: 0,
            digest: "0".repeat(DIGEST_HEX_LEN),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, MultiversionError> {
        let (index_raw, digest) = raw.split_once('-').ok_or_else(|| {
            MultiversionError::Validation(format!(
                "revision token must use <index>-<digest> format: {raw}"
            ))
        })?;
        let index: u64 = index_raw.parse().map_err(|_| {
            MultiversionError::Validation(format!("invalid revision token index: {raw}"))
        })?;
        let well_formed = digest.len() == DIGEST_HEX_LEN
            && digest
                .chars()
                .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch));
        if !well_formed {
            return Err(MultiversionError::Validation(format!(
                "revision token digest must be {DIGEST_HEX_LEN} lowercase hex characters: {raw}"
            )));
        }

        Ok(Self {
            index,
            digest: digest.to_string(),
        })
    }

    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    #[must_use]
    pub fn is_stub(&self) -> bool {
        self.index == 0 && self.digest.bytes().all(|byte| byte == b'0')
    }

    /// Token for the next save of the same entity.
    #[must_use]
    pub fn next(&self, is_deleted: bool, entity_id: &str) -> Self {
        Self::compute(Some(&self.to_string()), is_deleted, entity_id, self.index)
    }
}

impl Display for RevisionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.index, self.digest)
    }
}

impl TryFrom<String> for RevisionToken {
    type Error = MultiversionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RevisionToken> for String {
    fn from(value: RevisionToken) -> Self {
        value.to_string()
    }
}

/// SHA-256 truncated to 128 bits, lowercase hex.
fn digest128(payload: &[u8]) -> String {
    let hash = Sha256::digest(payload);
    hex::encode(&hash[..DIGEST_HEX_LEN / 2])
}

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(try_from = "Value", into = "Value")]
pub enum FieldValue {
    #[default]
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        self.as_i64().map(|value| value != 0)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl TryFrom<Value> for FieldValue {
    type Error = MultiversionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(flag) => Ok(Self::from(flag)),
            Value::Number(number) => {
                if let Some(integer) = number.as_i64() {
                    Ok(Self::Integer(integer))
                } else if let Some(float) = number.as_f64() {
                    Ok(Self::Float(float))
                } else {
                    Err(MultiversionError::Validation(format!(
                        "unsupported numeric field value: {number}"
                    )))
                }
            }
            Value::String(text) => Ok(Self::Text(text)),
            other => Err(MultiversionError::Validation(format!(
                "field values must be scalar, got {other}"
            ))),
        }
    }
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Null => Value::Null,
            FieldValue::Integer(integer) => Value::from(integer),
            FieldValue::Float(float) => {
                serde_json::Number::from_f64(float).map_or(Value::Null, Value::Number)
            }
            FieldValue::Text(text) => Value::String(text),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldStorageType {
    Integer,
    UnsignedInteger,
    Boolean,
    Float,
    String,
    Uuid,
    Language,
    RevisionToken,
}

impl FieldStorageType {
    #[must_use]
    pub fn sql_type(self) -> SqlType {
        match self {
            Self::Integer | Self::UnsignedInteger | Self::Boolean => SqlType::Integer,
            Self::Float => SqlType::Real,
            Self::String | Self::Uuid | Self::Language | Self::RevisionToken => SqlType::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Integer,
    Real,
    Text,
}

impl SqlType {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }
}

fn default_cardinality() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub storage_type: FieldStorageType,
    #[serde(default = "default_cardinality")]
    pub cardinality: u32,
    #[serde(default)]
    pub revisionable: bool,
    #[serde(default)]
    pub translatable: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub storage_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<FieldValue>,
}

impl FieldDescriptor {
    #[must_use]
    pub fn new(name: &str, storage_type: FieldStorageType) -> Self {
        Self {
            name: name.to_string(),
            storage_type,
            cardinality: 1,
            revisionable: false,
            translatable: false,
            read_only: false,
            storage_required: false,
            default_value: None,
        }
    }

    #[must_use]
    pub fn revisionable(mut self) -> Self {
        self.revisionable = true;
        self
    }

    #[must_use]
    pub fn translatable(mut self) -> Self {
        self.translatable = true;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn storage_required(mut self) -> Self {
        self.storage_required = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<FieldValue>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_cardinality(mut self, cardinality: u32) -> Self {
        self.cardinality = cardinality;
        self
    }

    #[must_use]
    pub fn is_multi_valued(&self) -> bool {
        self.cardinality != 1
    }
}

/// Cached hierarchy rows that must be purged as each entity is migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyIndex {
    pub table: String,
    pub column: String,
    pub key_prefix: String,
}

fn default_id_key() -> String {
    "id".to_string()
}

fn default_uuid_key() -> String {
    "uuid".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityKindDescriptor {
    pub id: String,
    #[serde(default = "default_id_key")]
    pub id_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_key: Option<String>,
    #[serde(default = "default_uuid_key")]
    pub uuid_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub langcode_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_key: Option<String>,
    pub base_table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_data_table: Option<String>,
    #[serde(default)]
    pub translatable: bool,
    /// Local kinds are never versioned.
    #[serde(default)]
    pub local: bool,
    /// Set once the kind is stored in the versioned shape and needs no data
    /// migration.
    #[serde(default)]
    pub versioned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy_index: Option<HierarchyIndex>,
}

impl EntityKindDescriptor {
    #[must_use]
    pub fn new(id: &str, base_table: &str) -> Self {
        Self {
            id: id.to_string(),
            id_key: default_id_key(),
            revision_key: None,
            uuid_key: default_uuid_key(),
            bundle_key: None,
            langcode_key: None,
            published_key: None,
            base_table: base_table.to_string(),
            revision_table: None,
            data_table: None,
            revision_data_table: None,
            translatable: false,
            local: false,
            versioned: false,
            hierarchy_index: None,
        }
    }

    #[must_use]
    pub fn revision_key_or_default(&self) -> &str {
        self.revision_key.as_deref().unwrap_or(DEFAULT_REVISION_KEY)
    }

    #[must_use]
    pub fn published_key_or_default(&self) -> &str {
        self.published_key.as_deref().unwrap_or(DEFAULT_PUBLISHED_KEY)
    }

    #[must_use]
    pub fn revision_table_name(&self) -> String {
        self.revision_table
            .clone()
            .unwrap_or_else(|| format!("{}_revision", self.base_table))
    }

    #[must_use]
    pub fn data_table_name(&self) -> Option<String> {
        self.translatable.then(|| {
            self.data_table
                .clone()
                .unwrap_or_else(|| format!("{}_field_data", self.base_table))
        })
    }

    #[must_use]
    pub fn revision_data_table_name(&self) -> Option<String> {
        self.translatable.then(|| {
            self.revision_data_table
                .clone()
                .unwrap_or_else(|| format!("{}_field_revision", self.base_table))
        })
    }

    /// Entity keys are stored as dedicated columns rather than field columns.
    #[must_use]
    pub fn is_key(&self, name: &str) -> bool {
        name == self.id_key
            || name == self.uuid_key
            || name == self.revision_key_or_default()
            || self.bundle_key.as_deref() == Some(name)
            || self.langcode_key.as_deref() == Some(name)
    }

    /// Copy of the descriptor with revision key and revision tables filled in.
    #[must_use]
    pub fn to_versioned(&self) -> Self {
        let mut versioned = self.clone();
        versioned.revision_key = Some(self.revision_key_or_default().to_string());
        versioned.revision_table = Some(self.revision_table_name());
        versioned.data_table = self.data_table_name();
        versioned.revision_data_table = self.revision_data_table_name();
        versioned
    }

    pub fn validate(&self, fields: &[FieldDescriptor]) -> Result<(), MultiversionError> {
        if self.id.trim().is_empty() {
            return Err(MultiversionError::Validation(
                "entity kind id must not be empty".to_string(),
            ));
        }

        let mut identifiers = vec![
            self.base_table.as_str(),
            self.id_key.as_str(),
            self.uuid_key.as_str(),
        ];
        identifiers.extend(
            [
                &self.revision_key,
                &self.bundle_key,
                &self.langcode_key,
                &self.published_key,
                &self.revision_table,
                &self.data_table,
                &self.revision_data_table,
            ]
            .into_iter()
            .filter_map(Option::as_deref),
        );
        for identifier in identifiers {
            if !is_valid_identifier(identifier) {
                return Err(MultiversionError::Validation(format!(
                    "entity kind {} uses an invalid identifier: {identifier:?}",
                    self.id
                )));
            }
        }

        for table in [
            Some(self.base_table.as_str()),
            self.revision_table.as_deref(),
            self.data_table.as_deref(),
            self.revision_data_table.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            if table.starts_with(SHADOW_PREFIX) || table.starts_with(BACKUP_PREFIX) {
                return Err(MultiversionError::Validation(format!(
                    "table {table} of entity kind {} uses a reserved prefix",
                    self.id
                )));
            }
        }

        if self.translatable && self.langcode_key.is_none() {
            return Err(MultiversionError::Validation(format!(
                "translatable entity kind {} requires a langcode key",
                self.id
            )));
        }

        let mut seen = BTreeSet::new();
        for field in fields {
            if !is_valid_identifier(&field.name) {
                return Err(MultiversionError::Validation(format!(
                    "entity kind {} has an invalid field name: {:?}",
                    self.id, field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(MultiversionError::Validation(format!(
                    "entity kind {} defines field {} twice",
                    self.id, field.name
                )));
            }
            if field.cardinality == 0 {
                return Err(MultiversionError::Validation(format!(
                    "field {}.{} must have a cardinality of at least 1",
                    self.id, field.name
                )));
            }
            if field.is_multi_valued() && self.is_key(&field.name) {
                return Err(MultiversionError::Validation(format!(
                    "entity key {}.{} must be single-valued",
                    self.id, field.name
                )));
            }
            if field.is_multi_valued() && field.translatable && self.translatable {
                return Err(MultiversionError::Validation(format!(
                    "translatable multi-valued field {}.{} is not supported",
                    self.id, field.name
                )));
            }
        }

        Ok(())
    }
}

#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Field set of the versioned shape: the original fields promoted to
/// revisionable, plus the revision metadata and versioning fields.
#[must_use]
pub fn versioned_field_definitions(
    kind: &EntityKindDescriptor,
    fields: &[FieldDescriptor],
) -> Vec<FieldDescriptor> {
    let revision_key = kind.revision_key_or_default();
    let mut added = vec![
        FieldDescriptor::new(revision_key, FieldStorageType::UnsignedInteger).read_only(),
        FieldDescriptor::new(REVISION_DEFAULT_FIELD, FieldStorageType::Boolean)
            .storage_required()
            .revisionable(),
    ];
    if kind.translatable {
        added.push(
            FieldDescriptor::new(
                REVISION_TRANSLATION_AFFECTED_FIELD,
                FieldStorageType::Boolean,
            )
            .read_only()
            .revisionable()
            .translatable(),
        );
    }
    added.push(
        FieldDescriptor::new(DELETED_FIELD, FieldStorageType::Boolean)
            .revisionable()
            .with_default(false),
    );
    added.push(
        FieldDescriptor::new(REV_FIELD, FieldStorageType::RevisionToken)
            .revisionable()
            .read_only(),
    );
    added.push(
        FieldDescriptor::new(WORKSPACE_FIELD, FieldStorageType::String)
            .revisionable()
            .read_only(),
    );

    let published_key = kind.published_key_or_default();
    if !fields.iter().any(|field| field.name == published_key) {
        added.push(
            FieldDescriptor::new(published_key, FieldStorageType::Boolean)
                .revisionable()
                .translatable()
                .with_default(true),
        );
    }

    let excluded = |name: &str| {
        kind.is_key(name)
            || name == revision_key
            || added.iter().any(|field| field.name == name)
    };

    let mut updated: Vec<FieldDescriptor> = fields
        .iter()
        .map(|field| {
            let mut field = field.clone();
            if !excluded(&field.name) {
                field.revisionable = true;
            }
            field
        })
        .collect();

    for field in added {
        if let Some(existing) = updated
            .iter_mut()
            .find(|candidate| candidate.name == field.name)
        {
            existing.revisionable |= field.revisionable;
        } else {
            updated.push(field);
        }
    }

    updated
}

// ---------------------------------------------------------------------------
// Table mappings and layouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    Base,
    Revision,
    Data,
    RevisionData,
    Dedicated,
    DedicatedRevision,
}

impl TableRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Revision => "revision",
            Self::Data => "data",
            Self::RevisionData => "revision_data",
            Self::Dedicated => "dedicated",
            Self::DedicatedRevision => "dedicated_revision",
        }
    }

    #[must_use]
    pub fn is_revision(self) -> bool {
        matches!(
            self,
            Self::Revision | Self::RevisionData | Self::DedicatedRevision
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedicatedTables {
    pub base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Physical table names of one entity kind, by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_data: Option<String>,
    #[serde(default)]
    pub dedicated: BTreeMap<String, DedicatedTables>,
}

impl TableMapping {
    #[must_use]
    pub fn legacy(kind: &EntityKindDescriptor, fields: &[FieldDescriptor]) -> Self {
        let dedicated = fields
            .iter()
            .filter(|field| field.is_multi_valued())
            .map(|field| {
                (
                    field.name.clone(),
                    DedicatedTables {
                        base: format!("{}__{}", kind.base_table, field.name),
                        revision: None,
                    },
                )
            })
            .collect();

        Self {
            base: kind.base_table.clone(),
            revision: None,
            data: kind.data_table_name(),
            revision_data: None,
            dedicated,
        }
    }

    #[must_use]
    pub fn versioned(kind: &EntityKindDescriptor, fields: &[FieldDescriptor]) -> Self {
        let revision_table = kind.revision_table_name();
        let dedicated = fields
            .iter()
            .filter(|field| field.is_multi_valued())
            .map(|field| {
                (
                    field.name.clone(),
                    DedicatedTables {
                        base: format!("{}__{}", kind.base_table, field.name),
                        revision: Some(format!("{revision_table}__{}", field.name)),
                    },
                )
            })
            .collect();

        Self {
            base: kind.base_table.clone(),
            revision: Some(revision_table),
            data: kind.data_table_name(),
            revision_data: kind.revision_data_table_name(),
            dedicated,
        }
    }

    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Self {
        let prefixed = |name: &str| format!("{prefix}{name}");
        Self {
            base: prefixed(&self.base),
            revision: self.revision.as_deref().map(prefixed),
            data: self.data.as_deref().map(prefixed),
            revision_data: self.revision_data.as_deref().map(prefixed),
            dedicated: self
                .dedicated
                .iter()
                .map(|(field, tables)| {
                    (
                        field.clone(),
                        DedicatedTables {
                            base: prefixed(&tables.base),
                            revision: tables.revision.as_deref().map(prefixed),
                        },
                    )
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.revision.is_some()
    }

    /// All tables with their role, in a stable order.
    #[must_use]
    pub fn tables(&self) -> Vec<(TableRole, &str)> {
        let mut tables = vec![(TableRole::Base, self.base.as_str())];
        if let Some(revision) = &self.revision {
            tables.push((TableRole::Revision, revision));
        }
        if let Some(data) = &self.data {
            tables.push((TableRole::Data, data));
        }
        if let Some(revision_data) = &self.revision_data {
            tables.push((TableRole::RevisionData, revision_data));
        }
        for dedicated in self.dedicated.values() {
            tables.push((TableRole::Dedicated, &dedicated.base));
            if let Some(revision) = &dedicated.revision {
                tables.push((TableRole::DedicatedRevision, revision));
            }
        }
        tables
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.tables()
            .into_iter()
            .map(|(_, name)| name.to_string())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, table: &str) -> bool {
        self.tables().iter().any(|(_, name)| *name == table)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnProperty {
    Value,
    IsStub,
    Delta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Field (or entity key) the column belongs to.
    pub field: String,
    pub property: ColumnProperty,
    pub sql_type: SqlType,
    pub not_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<FieldValue>,
}

impl ColumnSchema {
    fn key(name: &str, sql_type: SqlType, not_null: bool) -> Self {
        Self {
            name: name.to_string(),
            field: name.to_string(),
            property: ColumnProperty::Value,
            sql_type,
            not_null,
            default: None,
        }
    }

    fn aliased(name: &str, field: &str, property: ColumnProperty, sql_type: SqlType) -> Self {
        Self {
            name: name.to_string(),
            field: field.to_string(),
            property,
            sql_type,
            not_null: true,
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub unique_keys: Vec<Vec<String>>,
}

impl TableSchema {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|column| column.name == name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLayout {
    pub role: TableRole,
    pub table: String,
    /// Owning field of a dedicated table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub schema: TableSchema,
}

fn field_columns(field: &FieldDescriptor) -> Vec<ColumnSchema> {
    let mut columns = vec![ColumnSchema {
        name: field.name.clone(),
        field: field.name.clone(),
        property: ColumnProperty::Value,
        sql_type: field.storage_type.sql_type(),
        not_null: field.storage_required,
        default: field.default_value.clone(),
    }];
    if field.storage_type == FieldStorageType::RevisionToken {
        columns.push(ColumnSchema {
            name: format!("{}__is_stub", field.name),
            field: field.name.clone(),
            property: ColumnProperty::IsStub,
            sql_type: SqlType::Integer,
            not_null: true,
            default: Some(FieldValue::from(false)),
        });
    }
    columns
}

/// True when the field lives in the per-language data tables.
#[must_use]
pub fn stored_in_data_table(kind: &EntityKindDescriptor, field: &FieldDescriptor) -> bool {
    kind.translatable && field.translatable
}

/// Column layout of every table in `mapping`.
#[must_use]
pub fn table_layouts(
    kind: &EntityKindDescriptor,
    fields: &[FieldDescriptor],
    mapping: &TableMapping,
) -> Vec<TableLayout> {
    let versioned = mapping.is_versioned();
    let id_key = kind.id_key.as_str();
    let revision_key = kind.revision_key_or_default();
    let langcode_key = kind.langcode_key.as_deref();

    let single: Vec<&FieldDescriptor> = fields
        .iter()
        .filter(|field| !field.is_multi_valued() && !kind.is_key(&field.name))
        .collect();

    let mut layouts = Vec::new();

    let mut base = TableSchema {
        columns: vec![ColumnSchema::key(id_key, SqlType::Integer, true)],
        primary_key: vec![id_key.to_string()],
        unique_keys: Vec::new(),
    };
    if versioned {
        base.columns
            .push(ColumnSchema::key(revision_key, SqlType::Integer, false));
        base.unique_keys.push(vec![kind.uuid_key.clone()]);
    }
    base.columns
        .push(ColumnSchema::key(&kind.uuid_key, SqlType::Text, true));
    if let Some(bundle_key) = &kind.bundle_key {
        base.columns
            .push(ColumnSchema::key(bundle_key, SqlType::Text, false));
    }
    if let Some(langcode_key) = langcode_key {
        base.columns
            .push(ColumnSchema::key(langcode_key, SqlType::Text, false));
    }
    for field in single
        .iter()
        .filter(|field| !stored_in_data_table(kind, field))
    {
        base.columns.extend(field_columns(field));
    }
    layouts.push(TableLayout {
        role: TableRole::Base,
        table: mapping.base.clone(),
        field: None,
        schema: base,
    });

    if let Some(revision_table) = &mapping.revision {
        let mut revision = TableSchema {
            columns: vec![
                ColumnSchema::key(revision_key, SqlType::Integer, true),
                ColumnSchema::key(id_key, SqlType::Integer, true),
            ],
            primary_key: vec![revision_key.to_string()],
            unique_keys: Vec::new(),
        };
        if let Some(langcode_key) = langcode_key {
            revision
                .columns
                .push(ColumnSchema::key(langcode_key, SqlType::Text, false));
        }
        for field in single
            .iter()
            .filter(|field| field.revisionable && !stored_in_data_table(kind, field))
        {
            revision.columns.extend(field_columns(field));
        }
        layouts.push(TableLayout {
            role: TableRole::Revision,
            table: revision_table.clone(),
            field: None,
            schema: revision,
        });
    }

    if let (Some(data_table), Some(langcode_key)) = (&mapping.data, langcode_key) {
        let mut data = TableSchema {
            columns: vec![ColumnSchema::key(id_key, SqlType::Integer, true)],
            primary_key: vec![id_key.to_string(), langcode_key.to_string()],
            unique_keys: Vec::new(),
        };
        if versioned {
            data.columns
                .push(ColumnSchema::key(revision_key, SqlType::Integer, false));
        }
        data.columns
            .push(ColumnSchema::key(langcode_key, SqlType::Text, true));
        for field in single
            .iter()
            .filter(|field| stored_in_data_table(kind, field))
        {
            data.columns.extend(field_columns(field));
        }
        layouts.push(TableLayout {
            role: TableRole::Data,
            table: data_table.clone(),
            field: None,
            schema: data,
        });
    }

    if let (Some(revision_data_table), Some(langcode_key)) = (&mapping.revision_data, langcode_key)
    {
        let mut revision_data = TableSchema {
            columns: vec![
                ColumnSchema::key(revision_key, SqlType::Integer, true),
                ColumnSchema::key(id_key, SqlType::Integer, true),
                ColumnSchema::key(langcode_key, SqlType::Text, true),
            ],
            primary_key: vec![revision_key.to_string(), langcode_key.to_string()],
            unique_keys: Vec::new(),
        };
        for field in single
            .iter()
            .filter(|field| field.revisionable && stored_in_data_table(kind, field))
        {
            revision_data.columns.extend(field_columns(field));
        }
        layouts.push(TableLayout {
            role: TableRole::RevisionData,
            table: revision_data_table.clone(),
            field: None,
            schema: revision_data,
        });
    }

    for (field_name, tables) in &mapping.dedicated {
        let Some(field) = fields.iter().find(|field| &field.name == field_name) else {
            continue;
        };

        let mut dedicated = TableSchema {
            columns: vec![ColumnSchema::aliased(
                "entity_id",
                id_key,
                ColumnProperty::Value,
                SqlType::Integer,
            )],
            primary_key: vec!["entity_id".to_string(), "delta".to_string()],
            unique_keys: Vec::new(),
        };
        if versioned {
            let mut column = ColumnSchema::aliased(
                "revision_id",
                revision_key,
                ColumnProperty::Value,
                SqlType::Integer,
            );
            column.not_null = false;
            dedicated.columns.push(column);
        }
        dedicated.columns.push(ColumnSchema::aliased(
            "delta",
            &field.name,
            ColumnProperty::Delta,
            SqlType::Integer,
        ));
        dedicated.columns.extend(field_columns(field));
        layouts.push(TableLayout {
            role: TableRole::Dedicated,
            table: tables.base.clone(),
            field: Some(field.name.clone()),
            schema: dedicated,
        });

        if let Some(revision_table) = &tables.revision {
            let revision = TableSchema {
                columns: vec![
                    ColumnSchema::aliased(
                        "entity_id",
                        id_key,
                        ColumnProperty::Value,
                        SqlType::Integer,
                    ),
                    ColumnSchema::aliased(
                        "revision_id",
                        revision_key,
                        ColumnProperty::Value,
                        SqlType::Integer,
                    ),
                    ColumnSchema::aliased(
                        "delta",
                        &field.name,
                        ColumnProperty::Delta,
                        SqlType::Integer,
                    ),
                ]
                .into_iter()
                .chain(field_columns(field))
                .collect(),
                primary_key: vec!["revision_id".to_string(), "delta".to_string()],
                unique_keys: Vec::new(),
            };
            layouts.push(TableLayout {
                role: TableRole::DedicatedRevision,
                table: revision_table.clone(),
                field: Some(field.name.clone()),
                schema: revision,
            });
        }
    }

    layouts
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum SchemaOwner {
    Entity,
    Field(String),
}

impl SchemaOwner {
    #[must_use]
    pub fn as_key(&self) -> String {
        match self {
            Self::Entity => "entity".to_string(),
            Self::Field(name) => format!("field:{name}"),
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value == "entity" {
            return Some(Self::Entity);
        }
        value
            .strip_prefix("field:")
            .filter(|name| !name.is_empty())
            .map(|name| Self::Field(name.to_string()))
    }
}

/// One row of the persisted schema metadata cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub owner: SchemaOwner,
    pub table: String,
    pub schema: TableSchema,
}

/// Entity-level and per-field schema cache entries for a set of layouts.
#[must_use]
pub fn schema_entries(kind: &EntityKindDescriptor, layouts: &[TableLayout]) -> Vec<SchemaEntry> {
    let mut entries: Vec<SchemaEntry> = layouts
        .iter()
        .map(|layout| SchemaEntry {
            owner: SchemaOwner::Entity,
            table: layout.table.clone(),
            schema: layout.schema.clone(),
        })
        .collect();

    let mut per_field: BTreeMap<(String, String), TableSchema> = BTreeMap::new();
    for layout in layouts {
        for column in &layout.schema.columns {
            if kind.is_key(&column.field) {
                continue;
            }
            per_field
                .entry((column.field.clone(), layout.table.clone()))
                .or_default()
                .columns
                .push(column.clone());
        }
    }
    entries.extend(
        per_field
            .into_iter()
            .map(|((field, table), schema)| SchemaEntry {
                owner: SchemaOwner::Field(field),
                table,
                schema,
            }),
    );

    entries
}

// ---------------------------------------------------------------------------
// Entity records
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionState {
    /// `_rev`
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub is_stub: bool,
    /// `_deleted`
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub default_revision: bool,
    #[serde(default)]
    pub workspace: Option<String>,
    /// When false the supplied token is stored verbatim (replication).
    #[serde(default = "default_true")]
    pub new_edit: bool,
}

impl Default for RevisionState {
    fn default() -> Self {
        Self {
            token: None,
            is_stub: false,
            deleted: false,
            default_revision: false,
            workspace: None,
            new_edit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: String,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub revision_id: Option<i64>,
    pub uuid: String,
    #[serde(default)]
    pub bundle: Option<String>,
    #[serde(default)]
    pub langcode: Option<String>,
    /// Single-valued fields outside the per-language data tables.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    /// Translatable field values by language.
    #[serde(default)]
    pub translations: BTreeMap<String, BTreeMap<String, FieldValue>>,
    #[serde(default)]
    pub multi_values: BTreeMap<String, Vec<FieldValue>>,
    #[serde(default)]
    pub revision: RevisionState,
}

impl EntityRecord {
    #[must_use]
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: None,
            revision_id: None,
            uuid: Ulid::new().to_string().to_lowercase(),
            bundle: None,
            langcode: None,
            fields: BTreeMap::new(),
            translations: BTreeMap::new(),
            multi_values: BTreeMap::new(),
            revision: RevisionState::default(),
        }
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    pub fn token(&self) -> Result<Option<RevisionToken>, MultiversionError> {
        self.revision
            .token
            .as_deref()
            .map(RevisionToken::parse)
            .transpose()
    }

    /// Languages with a row in the data tables; the default language first.
    #[must_use]
    pub fn languages(&self) -> Vec<String> {
        let mut languages = Vec::new();
        if let Some(langcode) = &self.langcode {
            languages.push(langcode.clone());
        }
        for langcode in self.translations.keys() {
            if !languages.contains(langcode) {
                languages.push(langcode.clone());
            }
        }
        languages
    }

    /// Value of a field or entity key as it is written to storage.
    #[must_use]
    pub fn value(
        &self,
        kind: &EntityKindDescriptor,
        field: &str,
        langcode: Option<&str>,
    ) -> FieldValue {
        if field == kind.id_key {
            return self.id.into();
        }
        if field == kind.revision_key_or_default() {
            return self.revision_id.into();
        }
        if field == kind.uuid_key {
            return self.uuid.as_str().into();
        }
        if kind.bundle_key.as_deref() == Some(field) {
            return self.bundle.clone().into();
        }
        if kind.langcode_key.as_deref() == Some(field) {
            return langcode
                .map(str::to_string)
                .or_else(|| self.langcode.clone())
                .into();
        }
        match field {
            REV_FIELD => return self.revision.token.clone().into(),
            DELETED_FIELD => return self.revision.deleted.into(),
            REVISION_DEFAULT_FIELD => return self.revision.default_revision.into(),
            WORKSPACE_FIELD => return self.revision.workspace.clone().into(),
            _ => {}
        }

        langcode
            .and_then(|langcode| self.translations.get(langcode))
            .and_then(|values| values.get(field))
            .or_else(|| self.fields.get(field))
            .cloned()
            .unwrap_or_default()
    }

    /// Inverse of [`EntityRecord::value`], used when hydrating rows.
    pub fn set_value(
        &mut self,
        kind: &EntityKindDescriptor,
        field: &str,
        langcode: Option<&str>,
        value: FieldValue,
    ) {
        if field == kind.id_key {
            self.id = value.as_i64();
        } else if field == kind.revision_key_or_default() {
            self.revision_id = value.as_i64();
        } else if field == kind.uuid_key {
            if let FieldValue::Text(uuid) = value {
                self.uuid = uuid;
            }
        } else if kind.bundle_key.as_deref() == Some(field) {
            self.bundle = value.as_str().map(str::to_string);
        } else if kind.langcode_key.as_deref() == Some(field) {
            if langcode.is_none() {
                self.langcode = value.as_str().map(str::to_string);
            }
        } else if field == REV_FIELD {
            self.revision.token = value.as_str().map(str::to_string);
        } else if field == DELETED_FIELD {
            self.revision.deleted = value.as_bool().unwrap_or(false);
        } else if field == REVISION_DEFAULT_FIELD {
            self.revision.default_revision = value.as_bool().unwrap_or(false);
        } else if field == WORKSPACE_FIELD {
            self.revision.workspace = value.as_str().map(str::to_string);
        } else if let (Some(langcode), true) = (langcode, kind.translatable) {
            self.translations
                .entry(langcode.to_string())
                .or_default()
                .insert(field.to_string(), value);
        } else {
            self.fields.insert(field.to_string(), value);
        }
    }

    /// Sets a regular field, in every language when it is stored per language.
    pub fn set_field(
        &mut self,
        kind: &EntityKindDescriptor,
        field: &FieldDescriptor,
        value: impl Into<FieldValue>,
    ) {
        let value = value.into();
        if stored_in_data_table(kind, field) {
            for langcode in self.languages() {
                self.translations
                    .entry(langcode)
                    .or_default()
                    .insert(field.name.clone(), value.clone());
            }
        } else {
            self.fields.insert(field.name.clone(), value);
        }
    }
}

// ---------------------------------------------------------------------------
// Conversion progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversionState {
    NotStarted,
    ShadowBuilt,
    Copying,
    Committing,
    Done,
    Failed,
}

impl ConversionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Shadow tables of one in-flight conversion, together with the snapshot of
/// the original definitions needed to restore them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowTableSet {
    pub kind: String,
    pub original_kind: EntityKindDescriptor,
    pub original_fields: Vec<FieldDescriptor>,
    pub target_kind: EntityKindDescriptor,
    pub target_fields: Vec<FieldDescriptor>,
    pub original: TableMapping,
    pub target: TableMapping,
    pub shadow: TableMapping,
}

impl ShadowTableSet {
    #[must_use]
    pub fn derive(kind: &EntityKindDescriptor, fields: &[FieldDescriptor]) -> Self {
        let target_kind = kind.to_versioned();
        let target_fields = versioned_field_definitions(&target_kind, fields);
        let target = TableMapping::versioned(&target_kind, &target_fields);
        Self {
            kind: kind.id.clone(),
            original_kind: kind.clone(),
            original_fields: fields.to_vec(),
            original: TableMapping::legacy(kind, fields),
            shadow: target.with_prefix(SHADOW_PREFIX),
            target,
            target_kind,
            target_fields,
        }
    }

    /// `(shadow, target)` table name pairs.
    #[must_use]
    pub fn renames(&self) -> Vec<(String, String)> {
        self.shadow
            .table_names()
            .into_iter()
            .zip(self.target.table_names())
            .collect()
    }

    #[must_use]
    pub fn original_layouts(&self) -> Vec<TableLayout> {
        table_layouts(&self.original_kind, &self.original_fields, &self.original)
    }

    #[must_use]
    pub fn shadow_layouts(&self) -> Vec<TableLayout> {
        table_layouts(&self.target_kind, &self.target_fields, &self.shadow)
    }

    #[must_use]
    pub fn target_layouts(&self) -> Vec<TableLayout> {
        table_layouts(&self.target_kind, &self.target_fields, &self.target)
    }

    /// Target tables that did not exist in the legacy shape.
    #[must_use]
    pub fn new_tables(&self) -> Vec<String> {
        self.target
            .table_names()
            .into_iter()
            .filter(|table| !self.original.contains(table))
            .collect()
    }
}

#[must_use]
pub fn backup_table_name(table: &str) -> String {
    format!("{BACKUP_PREFIX}{table}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindProgress {
    pub kind: String,
    pub state: ConversionState,
    pub total: u64,
    pub processed: u64,
    /// Last copied primary key.
    pub cursor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<ShadowTableSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KindProgress {
    #[must_use]
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            state: ConversionState::NotStarted,
            total: 0,
            processed: 0,
            cursor: 0,
            shadow: None,
            error: None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn finished(&self) -> f64 {
        if self.state == ConversionState::Done {
            return 1.0;
        }
        if self.total == 0 {
            return 0.0;
        }
        (self.processed as f64 / self.total as f64).min(1.0)
    }

    /// Moves the cursor forward; it never moves backwards.
    pub fn advance_cursor(&mut self, cursor: i64) -> Result<(), MultiversionError> {
        if cursor < self.cursor {
            return Err(MultiversionError::Validation(format!(
                "cursor for entity kind {} moved backwards ({} -> {cursor})",
                self.kind, self.cursor
            )));
        }
        self.cursor = cursor;
        Ok(())
    }

    pub fn fail(&mut self, error: &str) {
        self.state = ConversionState::Failed;
        self.error = Some(error.to_string());
    }

    /// Back to a clean start; any shadow data is considered gone.
    pub fn reset(&mut self) {
        self.state = ConversionState::NotStarted;
        self.cursor = 0;
        self.processed = 0;
        self.shadow = None;
        self.error = None;
    }
}

/// Run-level progress across entity kinds, checkpointable as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionProgress {
    pub batch_size: usize,
    pub kinds: Vec<KindProgress>,
}

impl ConversionProgress {
    #[must_use]
    pub fn new(kinds: &[String], batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            kinds: kinds.iter().map(|kind| KindProgress::new(kind)).collect(),
        }
    }

    #[must_use]
    pub fn kind(&self, kind: &str) -> Option<&KindProgress> {
        self.kinds.iter().find(|progress| progress.kind == kind)
    }

    pub fn next_pending(&mut self) -> Option<&mut KindProgress> {
        self.kinds
            .iter_mut()
            .find(|progress| !progress.state.is_terminal())
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.kinds.iter().all(|progress| progress.state.is_terminal())
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.kinds
            .iter()
            .any(|progress| progress.state == ConversionState::Failed)
    }

    /// Overall completion for progress reporting only.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn finished(&self) -> f64 {
        let total: u64 = self.kinds.iter().map(|progress| progress.total).sum();
        if total == 0 {
            return if self.is_finished() { 1.0 } else { 0.0 };
        }
        let processed: u64 = self
            .kinds
            .iter()
            .map(|progress| {
                if progress.state == ConversionState::Done {
                    progress.total.max(progress.processed)
                } else {
                    progress.processed
                }
            })
            .sum();
        (processed as f64 / total as f64).min(1.0)
    }

    #[must_use]
    pub fn kinds_in_state(&self, state: ConversionState) -> Vec<String> {
        self.kinds
            .iter()
            .filter(|progress| progress.state == state)
            .map(|progress| progress.kind.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub batch_size: usize,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ConversionConfig {
    pub fn validate(&self) -> Result<(), MultiversionError> {
        if self.batch_size == 0 {
            return Err(MultiversionError::Configuration(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MultiversionSettings {
    #[serde(default)]
    pub supported_kinds: Vec<String>,
    #[serde(default)]
    pub enabled_kinds: Vec<String>,
}

impl MultiversionSettings {
    #[must_use]
    pub fn is_supported(&self, kind: &str) -> bool {
        self.supported_kinds.iter().any(|candidate| candidate == kind)
    }

    #[must_use]
    pub fn is_enabled(&self, kind: &str) -> bool {
        self.enabled_kinds.iter().any(|candidate| candidate == kind)
    }

    pub fn support(&mut self, kind: &str) {
        if !self.is_supported(kind) {
            self.supported_kinds.push(kind.to_string());
        }
    }

    pub fn enable(&mut self, kind: &str) {
        if !self.is_enabled(kind) {
            self.enabled_kinds.push(kind.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Host contracts
// ---------------------------------------------------------------------------

/// Table-level DDL used by the conversion engine.
pub trait SchemaOps {
    #[allow(clippy::missing_errors_doc)]
    fn table_exists(&self, table: &str) -> anyhow::Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn create_table(&self, table: &str, schema: &TableSchema) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn rename_table(&self, from: &str, to: &str) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn drop_table(&self, table: &str) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn add_primary_key(&self, table: &str, columns: &[&str]) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn drop_primary_key(&self, table: &str) -> anyhow::Result<()>;

    /// Opens the lock scope that guards a rename sequence.
    #[allow(clippy::missing_errors_doc)]
    fn begin_exclusive(&self) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn end_exclusive(&self, commit: bool) -> anyhow::Result<()>;
}

/// Installed entity kinds, field definitions and schema caches.
pub trait DefinitionRegistry {
    #[allow(clippy::missing_errors_doc)]
    fn entity_kinds(&self) -> anyhow::Result<Vec<EntityKindDescriptor>>;

    #[allow(clippy::missing_errors_doc)]
    fn entity_kind(&self, kind: &str) -> anyhow::Result<Option<EntityKindDescriptor>>;

    #[allow(clippy::missing_errors_doc)]
    fn update_entity_kind(&self, descriptor: &EntityKindDescriptor) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn field_definitions(&self, kind: &str) -> anyhow::Result<Vec<FieldDescriptor>>;

    #[allow(clippy::missing_errors_doc)]
    fn install_field(&self, kind: &str, field: &FieldDescriptor) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn uninstall_field(&self, kind: &str, field: &FieldDescriptor) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn schema_data(&self, kind: &str) -> anyhow::Result<Vec<SchemaEntry>>;

    #[allow(clippy::missing_errors_doc)]
    fn record_schema(&self, kind: &str, entries: &[SchemaEntry]) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn remove_schema_tables(&self, kind: &str, tables: &[String]) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn rename_schema_tables(&self, kind: &str, renames: &[(String, String)])
        -> anyhow::Result<()>;

    /// Mapping that replaces the regular one while a conversion is in flight.
    #[allow(clippy::missing_errors_doc)]
    fn temporary_mapping(&self, kind: &str) -> anyhow::Result<Option<TableMapping>>;

    #[allow(clippy::missing_errors_doc)]
    fn set_temporary_mapping(&self, kind: &str, mapping: Option<&TableMapping>)
        -> anyhow::Result<()>;

    /// Mapping reads and writes of `kind` go through: the temporary one while
    /// a conversion is in flight, otherwise the one matching the stored shape.
    #[allow(clippy::missing_errors_doc)]
    fn active_mapping(&self, kind: &EntityKindDescriptor) -> anyhow::Result<TableMapping> {
        if let Some(mapping) = self.temporary_mapping(&kind.id)? {
            return Ok(mapping);
        }
        let fields = self.field_definitions(&kind.id)?;
        Ok(if kind.versioned {
            TableMapping::versioned(kind, &fields)
        } else {
            TableMapping::legacy(kind, &fields)
        })
    }
}

/// Durable small key/value state.
pub trait SettingsStore {
    #[allow(clippy::missing_errors_doc)]
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    #[allow(clippy::missing_errors_doc)]
    fn set(&self, key: &str, value: &Value) -> anyhow::Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn settings(&self) -> anyhow::Result<MultiversionSettings> {
        match self.get(SETTINGS_KEY)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(MultiversionSettings::default()),
        }
    }

    #[allow(clippy::missing_errors_doc)]
    fn save_settings(&self, settings: &MultiversionSettings) -> anyhow::Result<()> {
        self.set(SETTINGS_KEY, &serde_json::to_value(settings)?)
    }

    #[allow(clippy::missing_errors_doc)]
    fn failed_kinds(&self) -> anyhow::Result<Vec<String>> {
        match self.get(FAILED_KINDS_KEY)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    #[allow(clippy::missing_errors_doc)]
    fn save_failed_kinds(&self, kinds: &[String]) -> anyhow::Result<()> {
        self.set(FAILED_KINDS_KEY, &serde_json::to_value(kinds)?)
    }
}

/// Lookup of the active workspace; `None` means the default workspace.
pub trait ActiveWorkspace {
    fn active_workspace(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixedWorkspace(Option<String>);

impl FixedWorkspace {
    #[must_use]
    pub fn new(workspace: Option<&str>) -> Self {
        Self(workspace.map(str::to_string))
    }

    #[must_use]
    pub fn default_workspace() -> Self {
        Self(None)
    }
}

impl ActiveWorkspace for FixedWorkspace {
    fn active_workspace(&self) -> Option<String> {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, MultiversionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            MultiversionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
