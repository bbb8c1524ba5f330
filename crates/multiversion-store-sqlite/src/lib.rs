#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use multiversion_core::{
    format_rfc3339, now_utc, schema_entries, table_layouts, ActiveWorkspace, DefinitionRegistry,
    EntityKindDescriptor, EntityRecord, FieldDescriptor, FieldValue, MultiversionError,
    SchemaEntry, SchemaError, SchemaOps, SchemaOwner, SettingsStore, TableMapping, TableSchema,
    DEFAULT_WORKSPACE,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;

mod conversion;
mod query;
mod rows;
mod storage;

pub use conversion::{
    BatchCopier, BatchOutcome, ConversionOrchestrator, ConversionReport, SchemaSwapper,
    ShadowSchemaBuilder, StepOutcome,
};
pub use query::{
    ConditionGroup, Conjunction, DeletedFilter, EntityQuery, JoinKind, Operator, QueryCondition,
    SelectQuery, SortDirection, WorkspaceQueryAugmenter, ENTITY_EXPRESSION, REVISION_EXPRESSION,
};
pub use storage::VersionedStorage;

const ENGINE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_MULTIVERSION_V1: &str = r"
CREATE TABLE IF NOT EXISTS mv_settings (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mv_entity_kinds (
  kind_id TEXT PRIMARY KEY,
  descriptor_json TEXT NOT NULL,
  temporary_mapping_json TEXT,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mv_field_storage (
  kind_id TEXT NOT NULL,
  field_name TEXT NOT NULL,
  definition_json TEXT NOT NULL,
  installed_at TEXT NOT NULL,
  PRIMARY KEY (kind_id, field_name),
  FOREIGN KEY (kind_id) REFERENCES mv_entity_kinds(kind_id)
);

CREATE TABLE IF NOT EXISTS mv_schema_data (
  kind_id TEXT NOT NULL,
  owner TEXT NOT NULL,
  table_name TEXT NOT NULL,
  schema_json TEXT NOT NULL,
  PRIMARY KEY (kind_id, owner, table_name),
  FOREIGN KEY (kind_id) REFERENCES mv_entity_kinds(kind_id)
);

CREATE INDEX IF NOT EXISTS idx_mv_schema_data_table
  ON mv_schema_data(kind_id, table_name);

CREATE TABLE IF NOT EXISTS workspace (
  id TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workspace_association (
  entity_kind TEXT NOT NULL,
  entity_id INTEGER NOT NULL,
  revision_id INTEGER NOT NULL,
  workspace TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (entity_kind, entity_id, workspace),
  FOREIGN KEY (workspace) REFERENCES workspace(id)
);

CREATE INDEX IF NOT EXISTS idx_workspace_association_revision
  ON workspace_association(entity_kind, revision_id);
";

pub struct SqliteMultiversionStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkspaceInfo {
    pub id: String,
    pub label: String,
    pub created_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct KindStatus {
    pub kind: String,
    pub base_table: String,
    pub local: bool,
    pub supported: bool,
    pub enabled: bool,
    pub versioned: bool,
    pub failed: bool,
    pub conversion_in_flight: bool,
    pub rows: u64,
    pub tables: Vec<String>,
    /// Tables reads and writes through the kind currently target.
    pub active_tables: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub migration_version: i64,
    pub workspaces: Vec<WorkspaceInfo>,
    pub failed_kinds: Vec<String>,
    pub kinds: Vec<KindStatus>,
}

impl SqliteMultiversionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_MULTIVERSION_V1)
            .context("failed to apply multiversion schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ENGINE_MIGRATION_VERSION, now],
            )
            .context("failed to register multiversion schema migration")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO workspace(id, label, created_at) VALUES (?1, ?2, ?3)",
                params![DEFAULT_WORKSPACE, "Live", now],
            )
            .context("failed to seed the default workspace")?;

        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn schema(&self) -> SqliteSchema<'_> {
        SqliteSchema::new(&self.conn)
    }

    #[must_use]
    pub fn registry(&self) -> SqliteRegistry<'_> {
        SqliteRegistry::new(&self.conn)
    }

    #[must_use]
    pub fn settings(&self) -> SqliteSettings<'_> {
        SqliteSettings::new(&self.conn)
    }

    /// Registers an entity kind and creates its legacy tables.
    pub fn install_entity_kind(
        &self,
        kind: &EntityKindDescriptor,
        fields: &[FieldDescriptor],
    ) -> Result<()> {
        kind.validate(fields)?;

        let registry = self.registry();
        if registry.entity_kind(&kind.id)?.is_some() {
            return Err(anyhow!(MultiversionError::Conflict(format!(
                "entity kind {} is already installed",
                kind.id
            ))));
        }

        let mut legacy = kind.clone();
        legacy.versioned = false;
        let mapping = TableMapping::legacy(&legacy, fields);
        let layouts = table_layouts(&legacy, fields, &mapping);

        let schema = self.schema();
        for layout in &layouts {
            if schema.table_exists(&layout.table)? {
                return Err(anyhow!(SchemaError::TableExists(layout.table.clone())));
            }
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start entity kind install transaction")?;
        for layout in &layouts {
            schema.create_table(&layout.table, &layout.schema)?;
        }
        registry.update_entity_kind(&legacy)?;
        for field in fields {
            registry.install_field(&legacy.id, field)?;
        }
        registry.record_schema(&legacy.id, &schema_entries(&legacy, &layouts))?;
        if !legacy.local {
            let mut settings = self.settings().settings()?;
            settings.support(&legacy.id);
            self.settings().save_settings(&settings)?;
        }
        tx.commit()
            .context("failed to commit entity kind install transaction")?;

        info!(kind = %legacy.id, tables = layouts.len(), "installed entity kind");
        Ok(())
    }

    /// Seeds a row into the legacy (pre-conversion) tables of a kind.
    pub fn insert_legacy(&self, record: &mut EntityRecord) -> Result<i64> {
        let registry = self.registry();
        let kind = registry
            .entity_kind(&record.kind)?
            .ok_or_else(|| anyhow!("unknown entity kind: {}", record.kind))?;
        if kind.versioned {
            return Err(anyhow!(MultiversionError::Validation(format!(
                "entity kind {} is already converted; use versioned storage",
                kind.id
            ))));
        }
        let fields = registry.field_definitions(&kind.id)?;
        let mapping = TableMapping::legacy(&kind, &fields);
        let layouts = table_layouts(&kind, &fields, &mapping);

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start legacy insert transaction")?;
        let id = match record.id {
            Some(id) => id,
            None => rows::next_id(&self.conn, &mapping.base, &kind.id_key)?,
        };
        record.id = Some(id);
        rows::write_entity_rows(&self.conn, &kind, &layouts, record, false)?;
        tx.commit()
            .context("failed to commit legacy insert transaction")?;

        Ok(id)
    }

    pub fn create_workspace(&self, id: &str, label: &str) -> Result<WorkspaceInfo> {
        if !multiversion_core::is_valid_identifier(id) {
            return Err(anyhow!(MultiversionError::Validation(format!(
                "invalid workspace id: {id:?}"
            ))));
        }
        if self.workspace(id)?.is_some() {
            return Err(anyhow!(MultiversionError::Conflict(format!(
                "workspace {id} already exists"
            ))));
        }

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO workspace(id, label, created_at) VALUES (?1, ?2, ?3)",
                params![id, label, now],
            )
            .with_context(|| format!("failed to create workspace {id}"))?;

        info!(workspace = %id, "created workspace");
        Ok(WorkspaceInfo {
            id: id.to_string(),
            label: label.to_string(),
            created_at: now,
        })
    }

    pub fn workspace(&self, id: &str) -> Result<Option<WorkspaceInfo>> {
        self.conn
            .query_row(
                "SELECT id, label, created_at FROM workspace WHERE id = ?1",
                params![id],
                |row| {
                    Ok(WorkspaceInfo {
                        id: row.get(0)?,
                        label: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load workspace {id}"))
    }

    pub fn list_workspaces(&self) -> Result<Vec<WorkspaceInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, label, created_at FROM workspace ORDER BY id ASC")
            .context("failed to prepare workspace listing")?;
        let rows = stmt.query_map([], |row| {
            Ok(WorkspaceInfo {
                id: row.get(0)?,
                label: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let registry = self.registry();
        let settings_store = self.settings();
        let settings = settings_store.settings()?;
        let failed_kinds = settings_store.failed_kinds()?;

        let migration_version: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .context("failed to read schema migration version")?;

        let mut kinds = Vec::new();
        for kind in registry.entity_kinds()? {
            let fields = registry.field_definitions(&kind.id)?;
            let mapping = if kind.versioned {
                TableMapping::versioned(&kind, &fields)
            } else {
                TableMapping::legacy(&kind, &fields)
            };
            let active = registry.active_mapping(&kind)?;
            let rows = if table_exists(&self.conn, &mapping.base)? {
                rows::count_rows(&self.conn, &mapping.base)?
            } else {
                0
            };
            kinds.push(KindStatus {
                supported: settings.is_supported(&kind.id),
                enabled: settings.is_enabled(&kind.id),
                failed: failed_kinds.contains(&kind.id),
                conversion_in_flight: active != mapping,
                base_table: kind.base_table.clone(),
                local: kind.local,
                versioned: kind.versioned,
                rows,
                tables: mapping.table_names(),
                active_tables: active.table_names(),
                kind: kind.id,
            });
        }

        Ok(StoreStatus {
            migration_version,
            workspaces: self.list_workspaces()?,
            failed_kinds,
            kinds,
        })
    }

    /// Post-conversion entity storage bound to the active workspace.
    pub fn storage(&self, active: &dyn ActiveWorkspace) -> Result<VersionedStorage<'_>> {
        let workspace = active
            .active_workspace()
            .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());
        if self.workspace(&workspace)?.is_none() {
            return Err(anyhow!(MultiversionError::Validation(format!(
                "unknown workspace: {workspace}"
            ))));
        }
        Ok(VersionedStorage::new(&self.conn, &workspace))
    }
}

// ---------------------------------------------------------------------------
// Schema operations
// ---------------------------------------------------------------------------

pub struct SqliteSchema<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSchema<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn primary_key_index(table: &str) -> String {
        format!("{table}__pkey")
    }
}

impl SchemaOps for SqliteSchema<'_> {
    fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists(self.conn, table)
    }

    fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        let sql = create_table_sql(table, schema);
        self.conn
            .execute_batch(&sql)
            .with_context(|| format!("failed to create table {table}"))
    }

    fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        if !table_exists(self.conn, from)? {
            return Err(anyhow!(SchemaError::MissingTable(from.to_string())));
        }
        if table_exists(self.conn, to)? {
            return Err(anyhow!(SchemaError::TableExists(to.to_string())));
        }
        self.conn
            .execute_batch(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            ))
            .with_context(|| format!("failed to rename table {from} to {to}"))
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .with_context(|| format!("failed to drop table {table}"))
    }

    fn add_primary_key(&self, table: &str, columns: &[&str]) -> Result<()> {
        if !table_exists(self.conn, table)? {
            return Err(anyhow!(SchemaError::MissingTable(table.to_string())));
        }
        if has_unique_index_on_columns(self.conn, table, columns)? {
            return Err(anyhow!(SchemaError::KeyExists(table.to_string())));
        }

        let column_list = columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        self.conn
            .execute_batch(&format!(
                "CREATE UNIQUE INDEX {} ON {} ({column_list})",
                quote_ident(&Self::primary_key_index(table)),
                quote_ident(table)
            ))
            .with_context(|| format!("failed to add primary key on {table}"))
    }

    fn drop_primary_key(&self, table: &str) -> Result<()> {
        let index = Self::primary_key_index(table);
        if !index_exists(self.conn, &index)? {
            return Err(anyhow!(
                "primary key of {table} is declared inline and cannot be dropped"
            ));
        }
        self.conn
            .execute_batch(&format!("DROP INDEX {}", quote_ident(&index)))
            .with_context(|| format!("failed to drop primary key on {table}"))
    }

    fn begin_exclusive(&self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE;")
            .context("failed to acquire exclusive schema lock")
    }

    fn end_exclusive(&self, commit: bool) -> Result<()> {
        let statement = if commit { "COMMIT;" } else { "ROLLBACK;" };
        self.conn
            .execute_batch(statement)
            .context("failed to release exclusive schema lock")
    }
}

fn create_table_sql(table: &str, schema: &TableSchema) -> String {
    let mut definitions: Vec<String> = schema
        .columns
        .iter()
        .map(|column| {
            let mut definition = format!("{} {}", quote_ident(&column.name), column.sql_type.as_sql());
            if column.not_null {
                definition.push_str(" NOT NULL");
            }
            if let Some(default) = column.default.as_ref().and_then(default_literal) {
                definition.push_str(" DEFAULT ");
                definition.push_str(&default);
            }
            definition
        })
        .collect();

    if !schema.primary_key.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", quoted_list(&schema.primary_key)));
    }
    for unique in &schema.unique_keys {
        definitions.push(format!("UNIQUE ({})", quoted_list(unique)));
    }

    format!(
        "CREATE TABLE {} (\n  {}\n)",
        quote_ident(table),
        definitions.join(",\n  ")
    )
}

fn default_literal(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Null => None,
        FieldValue::Integer(integer) => Some(integer.to_string()),
        FieldValue::Float(float) => Some(float.to_string()),
        FieldValue::Text(text) => Some(format!("'{}'", text.replace('\'', "''"))),
    }
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ---------------------------------------------------------------------------
// Definition registry
// ---------------------------------------------------------------------------

pub struct SqliteRegistry<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRegistry<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl DefinitionRegistry for SqliteRegistry<'_> {
    fn entity_kinds(&self) -> Result<Vec<EntityKindDescriptor>> {
        let mut stmt = self
            .conn
            .prepare("SELECT descriptor_json FROM mv_entity_kinds ORDER BY kind_id ASC")
            .context("failed to prepare entity kind listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut kinds = Vec::new();
        for raw in collect_rows(rows)? {
            kinds.push(
                serde_json::from_str(&raw).context("failed to decode entity kind descriptor")?,
            );
        }
        Ok(kinds)
    }

    fn entity_kind(&self, kind: &str) -> Result<Option<EntityKindDescriptor>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT descriptor_json FROM mv_entity_kinds WHERE kind_id = ?1",
                params![kind],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load entity kind {kind}"))?;

        raw.map(|raw| {
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to decode entity kind descriptor for {kind}"))
        })
        .transpose()
    }

    fn update_entity_kind(&self, descriptor: &EntityKindDescriptor) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let json = serde_json::to_string(descriptor)?;
        self.conn
            .execute(
                "INSERT INTO mv_entity_kinds(kind_id, descriptor_json, temporary_mapping_json, updated_at)
                 VALUES (?1, ?2, NULL, ?3)
                 ON CONFLICT(kind_id) DO UPDATE SET
                   descriptor_json = excluded.descriptor_json,
                   updated_at = excluded.updated_at",
                params![descriptor.id, json, now],
            )
            .with_context(|| format!("failed to store entity kind {}", descriptor.id))?;
        Ok(())
    }

    fn field_definitions(&self, kind: &str) -> Result<Vec<FieldDescriptor>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT definition_json FROM mv_field_storage
                 WHERE kind_id = ?1
                 ORDER BY installed_at ASC, rowid ASC",
            )
            .context("failed to prepare field definition listing")?;
        let rows = stmt.query_map(params![kind], |row| row.get::<_, String>(0))?;

        let mut fields = Vec::new();
        for raw in collect_rows(rows)? {
            fields.push(
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to decode field definition for {kind}"))?,
            );
        }
        Ok(fields)
    }

    fn install_field(&self, kind: &str, field: &FieldDescriptor) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let json = serde_json::to_string(field)?;
        self.conn
            .execute(
                "INSERT INTO mv_field_storage(kind_id, field_name, definition_json, installed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind_id, field_name) DO UPDATE SET
                   definition_json = excluded.definition_json",
                params![kind, field.name, json, now],
            )
            .with_context(|| format!("failed to install field {kind}.{}", field.name))?;
        Ok(())
    }

    fn uninstall_field(&self, kind: &str, field: &FieldDescriptor) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM mv_field_storage WHERE kind_id = ?1 AND field_name = ?2",
                params![kind, field.name],
            )
            .with_context(|| format!("failed to uninstall field {kind}.{}", field.name))?;
        self.conn
            .execute(
                "DELETE FROM mv_schema_data WHERE kind_id = ?1 AND owner = ?2",
                params![kind, SchemaOwner::Field(field.name.clone()).as_key()],
            )
            .with_context(|| format!("failed to drop schema data of {kind}.{}", field.name))?;
        Ok(())
    }

    fn schema_data(&self, kind: &str) -> Result<Vec<SchemaEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT owner, table_name, schema_json FROM mv_schema_data
                 WHERE kind_id = ?1
                 ORDER BY owner ASC, table_name ASC",
            )
            .context("failed to prepare schema data listing")?;
        let rows = stmt.query_map(params![kind], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for (owner, table, raw) in collect_rows(rows)? {
            let owner = SchemaOwner::parse(&owner)
                .ok_or_else(|| anyhow!("invalid schema data owner {owner:?} for {kind}"))?;
            entries.push(SchemaEntry {
                owner,
                table,
                schema: serde_json::from_str(&raw)
                    .with_context(|| format!("failed to decode schema data for {kind}"))?,
            });
        }
        Ok(entries)
    }

    fn record_schema(&self, kind: &str, entries: &[SchemaEntry]) -> Result<()> {
        for entry in entries {
            let json = serde_json::to_string(&entry.schema)?;
            self.conn
                .execute(
                    "INSERT INTO mv_schema_data(kind_id, owner, table_name, schema_json)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(kind_id, owner, table_name) DO UPDATE SET
                       schema_json = excluded.schema_json",
                    params![kind, entry.owner.as_key(), entry.table, json],
                )
                .with_context(|| format!("failed to record schema data for {kind}"))?;
        }
        Ok(())
    }

    fn remove_schema_tables(&self, kind: &str, tables: &[String]) -> Result<()> {
        for table in tables {
            self.conn
                .execute(
                    "DELETE FROM mv_schema_data WHERE kind_id = ?1 AND table_name = ?2",
                    params![kind, table],
                )
                .with_context(|| format!("failed to remove schema data of {table}"))?;
        }
        Ok(())
    }

    fn rename_schema_tables(&self, kind: &str, renames: &[(String, String)]) -> Result<()> {
        for (from, to) in renames {
            self.conn
                .execute(
                    "DELETE FROM mv_schema_data WHERE kind_id = ?1 AND table_name = ?2",
                    params![kind, to],
                )
                .with_context(|| format!("failed to clear schema data of {to}"))?;
            self.conn
                .execute(
                    "UPDATE mv_schema_data SET table_name = ?3
                     WHERE kind_id = ?1 AND table_name = ?2",
                    params![kind, from, to],
                )
                .with_context(|| format!("failed to remap schema data {from} -> {to}"))?;
        }
        Ok(())
    }

    fn temporary_mapping(&self, kind: &str) -> Result<Option<TableMapping>> {
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT temporary_mapping_json FROM mv_entity_kinds WHERE kind_id = ?1",
                params![kind],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load temporary mapping of {kind}"))?;

        raw.flatten()
            .map(|raw| {
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to decode temporary mapping of {kind}"))
            })
            .transpose()
    }

    fn set_temporary_mapping(&self, kind: &str, mapping: Option<&TableMapping>) -> Result<()> {
        let json = mapping.map(serde_json::to_string).transpose()?;
        let updated = self
            .conn
            .execute(
                "UPDATE mv_entity_kinds SET temporary_mapping_json = ?2 WHERE kind_id = ?1",
                params![kind, json],
            )
            .with_context(|| format!("failed to store temporary mapping of {kind}"))?;
        if updated == 0 {
            return Err(anyhow!("unknown entity kind: {kind}"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub struct SqliteSettings<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSettings<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingsStore for SqliteSettings<'_> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value_json FROM mv_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read setting {key}"))?;

        raw.map(|raw| {
            serde_json::from_str(&raw).with_context(|| format!("failed to decode setting {key}"))
        })
        .transpose()
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO mv_settings(key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value_json = excluded.value_json,
                   updated_at = excluded.updated_at",
                params![key, value.to_string(), now],
            )
            .with_context(|| format!("failed to write setting {key}"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn index_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'index' AND name = ?1
             LIMIT 1",
            params![index_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

pub(crate) fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table_name)))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }
    Ok(available)
}

fn has_unique_index_on_columns(
    conn: &Connection,
    table_name: &str,
    columns: &[&str],
) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({})", quote_ident(table_name)))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        if is_unique != 1 {
            continue;
        }

        let indexed_columns = index_columns(conn, &index_name)?;
        if indexed_columns == columns {
            return Ok(true);
        }
    }

    // A single INTEGER PRIMARY KEY is the rowid and never shows up as an index.
    if let [column] = columns {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table_name)))
            .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let pk_position: i64 = row.get(5)?;
            if name == *column && pk_position == 1 {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({})", quote_ident(index_name)))
        .with_context(|| format!("failed to inspect index_info for {index_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use multiversion_core::FieldStorageType;

    pub fn must<T, E: Into<anyhow::Error>>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {:#}", err.into()),
        }
    }

    pub fn fixture_store() -> SqliteMultiversionStore {
        let store = must(SqliteMultiversionStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    pub fn article_kind() -> (EntityKindDescriptor, Vec<FieldDescriptor>) {
        let mut kind = EntityKindDescriptor::new("article", "article");
        kind.bundle_key = Some("type".to_string());
        kind.langcode_key = Some("langcode".to_string());
        kind.translatable = true;
        let fields = vec![
            FieldDescriptor::new("id", FieldStorageType::Integer),
            FieldDescriptor::new("uuid", FieldStorageType::Uuid),
            FieldDescriptor::new("type", FieldStorageType::String),
            FieldDescriptor::new("langcode", FieldStorageType::Language),
            FieldDescriptor::new("title", FieldStorageType::String).translatable(),
            FieldDescriptor::new("author", FieldStorageType::Integer),
            FieldDescriptor::new("tags", FieldStorageType::Integer).with_cardinality(4),
        ];
        (kind, fields)
    }

    pub fn menu_link_kind() -> (EntityKindDescriptor, Vec<FieldDescriptor>) {
        let mut kind = EntityKindDescriptor::new("menu_link", "menu_link");
        kind.hierarchy_index = Some(multiversion_core::HierarchyIndex {
            table: "menu_tree".to_string(),
            column: "id".to_string(),
            key_prefix: "menu_link".to_string(),
        });
        let fields = vec![
            FieldDescriptor::new("id", FieldStorageType::Integer),
            FieldDescriptor::new("uuid", FieldStorageType::Uuid),
            FieldDescriptor::new("link", FieldStorageType::String),
            FieldDescriptor::new("weight", FieldStorageType::Integer).with_default(0_i64),
        ];
        (kind, fields)
    }

    pub fn install(
        store: &SqliteMultiversionStore,
        (kind, fields): &(EntityKindDescriptor, Vec<FieldDescriptor>),
    ) {
        must(store.install_entity_kind(kind, fields));
    }

    /// Converts every eligible installed kind with default settings.
    pub fn enable_all(store: &SqliteMultiversionStore) -> crate::ConversionReport {
        let schema = store.schema();
        let registry = store.registry();
        let settings = store.settings();
        let orchestrator = crate::ConversionOrchestrator::new(
            store.connection(),
            &schema,
            &registry,
            &settings,
            multiversion_core::ConversionConfig::default(),
        );
        must(orchestrator.enable_versioning(None))
    }

    pub fn seed_articles(store: &SqliteMultiversionStore, count: usize) -> Vec<i64> {
        let (kind, fields) = article_kind();
        let title = fields
            .iter()
            .find(|field| field.name == "title")
            .cloned()
            .unwrap_or_else(|| panic!("article fixture lacks title"));
        (0..count)
            .map(|index| {
                let mut record = EntityRecord::new("article");
                record.bundle = Some("news".to_string());
                record.langcode = Some("en".to_string());
                record.translations.insert("de".to_string(), Default::default());
                record.set_field(&kind, &title, format!("Article {index}"));
                record
                    .fields
                    .insert("author".to_string(), FieldValue::Integer(7));
                record.multi_values.insert(
                    "tags".to_string(),
                    vec![FieldValue::Integer(1), FieldValue::Integer(2)],
                );
                must(store.insert_legacy(&mut record))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::too_many_lines)]

    use super::test_support::*;
    use super::*;
    use multiversion_core::{
        FieldStorageType, FixedWorkspace, MultiversionSettings, FAILED_KINDS_KEY,
    };
    use ulid::Ulid;

    #[test]
    fn migrate_is_idempotent_and_seeds_live_workspace() {
        let store = fixture_store();
        must(store.migrate());

        let workspaces = must(store.list_workspaces());
        assert_eq!(workspaces.len(), 1);
        assert_eq!(workspaces[0].id, DEFAULT_WORKSPACE);

        for table in [
            "mv_settings",
            "mv_entity_kinds",
            "mv_field_storage",
            "mv_schema_data",
            "workspace",
            "workspace_association",
        ] {
            assert!(must(table_exists(store.connection(), table)), "{table}");
        }
    }

    #[test]
    fn install_creates_legacy_tables_and_registers_support() {
        let store = fixture_store();
        install(&store, &article_kind());

        let schema = store.schema();
        assert!(must(schema.table_exists("article")));
        assert!(must(schema.table_exists("article_field_data")));
        assert!(must(schema.table_exists("article__tags")));
        assert!(!must(schema.table_exists("article_revision")));

        let columns = must(table_columns(store.connection(), "article"));
        assert!(columns.contains(&"author".to_string()));
        assert!(!columns.contains(&"title".to_string()));

        let settings = must(store.settings().settings());
        assert_eq!(settings.supported_kinds, vec!["article".to_string()]);
        assert!(settings.enabled_kinds.is_empty());

        let entries = must(store.registry().schema_data("article"));
        assert!(entries
            .iter()
            .any(|entry| entry.owner == SchemaOwner::Entity && entry.table == "article"));

        let duplicate = store.install_entity_kind(&article_kind().0, &article_kind().1);
        assert!(duplicate.is_err());
    }

    #[test]
    fn install_rejects_invalid_descriptors_and_local_kinds_are_not_supported() {
        let store = fixture_store();
        let (mut kind, fields) = article_kind();
        kind.langcode_key = None;
        assert!(store.install_entity_kind(&kind, &fields).is_err());
        assert!(!must(store.schema().table_exists("article")));

        let mut local = EntityKindDescriptor::new("workspace_log", "workspace_log");
        local.local = true;
        must(store.install_entity_kind(
            &local,
            &[FieldDescriptor::new("message", FieldStorageType::String)],
        ));
        assert!(!must(store.settings().settings()).is_supported("workspace_log"));
    }

    #[test]
    fn legacy_inserts_allocate_ids_and_write_translations() {
        let store = fixture_store();
        install(&store, &article_kind());
        let ids = seed_articles(&store, 3);
        assert_eq!(ids, vec![1, 2, 3]);

        let conn = store.connection();
        assert_eq!(must(rows::count_rows(conn, "article")), 3);
        assert_eq!(must(rows::count_rows(conn, "article_field_data")), 6);
        assert_eq!(must(rows::count_rows(conn, "article__tags")), 6);
    }

    #[test]
    fn schema_ops_rename_drop_and_primary_keys() {
        let store = fixture_store();
        let schema = store.schema();
        must(store.connection().execute_batch(
            "CREATE TABLE sample (id INTEGER NOT NULL, lang TEXT NOT NULL, PRIMARY KEY (id));",
        ));

        must(schema.rename_table("sample", "sample_renamed"));
        assert!(!must(schema.table_exists("sample")));
        assert!(must(schema.table_exists("sample_renamed")));
        assert!(schema.rename_table("sample", "other").is_err());

        must(schema.add_primary_key("sample_renamed", &["id", "lang"]));
        let again = schema.add_primary_key("sample_renamed", &["id", "lang"]);
        match again {
            Err(err) => assert_eq!(
                err.downcast_ref::<SchemaError>(),
                Some(&SchemaError::KeyExists("sample_renamed".to_string()))
            ),
            Ok(()) => panic!("expected duplicate primary key to be reported"),
        }
        let rowid = schema.add_primary_key("sample_renamed", &["id"]);
        assert!(rowid.is_err());

        must(schema.drop_primary_key("sample_renamed"));
        assert!(schema.drop_primary_key("sample_renamed").is_err());

        must(schema.drop_table("sample_renamed"));
        must(schema.drop_table("sample_renamed"));
        assert!(!must(schema.table_exists("sample_renamed")));
    }

    #[test]
    fn create_table_renders_defaults_and_unique_keys() {
        let store = fixture_store();
        let (kind, fields) = article_kind();
        let shadow = multiversion_core::ShadowTableSet::derive(&kind, &fields);
        let base = shadow
            .target_layouts()
            .into_iter()
            .next()
            .unwrap_or_else(|| panic!("expected base layout"));
        let sql = create_table_sql("scratch", &base.schema);
        assert!(sql.contains("\"_deleted\" INTEGER DEFAULT 0"));
        assert!(sql.contains("\"_rev__is_stub\" INTEGER NOT NULL DEFAULT 0"));
        assert!(sql.contains("UNIQUE (\"uuid\")"));
        must(store.schema().create_table("scratch", &base.schema));
        assert!(must(has_unique_index_on_columns(
            store.connection(),
            "scratch",
            &["uuid"]
        )));
    }

    #[test]
    fn settings_round_trip_and_survive_reopen() {
        let db_path =
            std::env::temp_dir().join(format!("multiversion-settings-{}.sqlite3", Ulid::new()));
        {
            let store = must(SqliteMultiversionStore::open(&db_path));
            must(store.migrate());
            let settings = MultiversionSettings {
                supported_kinds: vec!["article".to_string()],
                enabled_kinds: vec!["article".to_string()],
            };
            must(store.settings().save_settings(&settings));
            must(store.settings().save_failed_kinds(&["page".to_string()]));
        }

        let store = must(SqliteMultiversionStore::open(&db_path));
        must(store.migrate());
        let settings = must(store.settings().settings());
        assert!(settings.is_enabled("article"));
        assert_eq!(must(store.settings().failed_kinds()), vec!["page".to_string()]);
        assert_eq!(
            must(store.settings().get(FAILED_KINDS_KEY)),
            Some(serde_json::json!(["page"]))
        );

        drop(store);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn registry_tracks_temporary_mapping_and_schema_renames() {
        let store = fixture_store();
        install(&store, &article_kind());
        let registry = store.registry();
        let kind = match must(registry.entity_kind("article")) {
            Some(kind) => kind,
            None => panic!("expected installed kind"),
        };

        let legacy = must(registry.active_mapping(&kind));
        assert!(!legacy.is_versioned());

        let temporary = legacy.with_prefix("tmp_");
        must(registry.set_temporary_mapping("article", Some(&temporary)));
        assert_eq!(must(registry.active_mapping(&kind)), temporary);
        must(registry.set_temporary_mapping("article", None));
        assert_eq!(must(registry.temporary_mapping("article")), None);
        assert!(registry.set_temporary_mapping("missing", None).is_err());

        must(registry.rename_schema_tables(
            "article",
            &[("article".to_string(), "article_moved".to_string())],
        ));
        let entries = must(registry.schema_data("article"));
        assert!(entries.iter().any(|entry| entry.table == "article_moved"));
        assert!(!entries.iter().any(|entry| entry.table == "article"));
    }

    #[test]
    fn workspaces_are_validated_and_unique() {
        let store = fixture_store();
        let created = must(store.create_workspace("stage", "Stage"));
        assert_eq!(created.id, "stage");
        assert!(store.create_workspace("stage", "Again").is_err());
        assert!(store.create_workspace("bad id", "Nope").is_err());
        assert!(store
            .storage(&FixedWorkspace::new(Some("unknown")))
            .is_err());
        assert!(store.storage(&FixedWorkspace::new(Some("stage"))).is_ok());
        assert!(store.storage(&FixedWorkspace::default_workspace()).is_ok());
    }

    #[test]
    fn status_reports_kinds_and_rows() {
        let store = fixture_store();
        install(&store, &article_kind());
        seed_articles(&store, 2);
        let status = must(store.status());
        assert_eq!(status.migration_version, ENGINE_MIGRATION_VERSION);
        assert_eq!(status.kinds.len(), 1);
        let article = &status.kinds[0];
        assert_eq!(article.rows, 2);
        assert!(article.supported);
        assert!(!article.enabled);
        assert!(!article.versioned);
        assert!(!article.conversion_in_flight);
        assert_eq!(article.active_tables, article.tables);

        let registry = store.registry();
        let kind = match must(registry.entity_kind("article")) {
            Some(kind) => kind,
            None => panic!("expected installed kind"),
        };
        let temporary = must(registry.active_mapping(&kind)).with_prefix("tmp_");
        must(registry.set_temporary_mapping("article", Some(&temporary)));
        let status = must(store.status());
        let article = &status.kinds[0];
        assert!(article.conversion_in_flight);
        assert_eq!(article.rows, 2);
        assert!(article.tables.iter().all(|table| !table.starts_with("tmp_")));
        assert_eq!(article.active_tables, temporary.table_names());
    }
}
