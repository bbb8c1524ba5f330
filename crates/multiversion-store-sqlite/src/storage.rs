//! Entity storage for converted kinds. Every save writes a new revision; the
//! only physical delete is [`VersionedStorage::purge`].

use anyhow::{anyhow, Context, Result};
use multiversion_core::{
    format_rfc3339, now_utc, table_layouts, DefinitionRegistry, EntityKindDescriptor,
    EntityRecord, FieldDescriptor, FieldValue, FixedWorkspace, MultiversionError, RevisionToken,
    SettingsStore, TableLayout, TableMapping, TableRole, DEFAULT_WORKSPACE, REV_FIELD,
    REVISION_TRANSLATION_AFFECTED_FIELD, WORKSPACE_FIELD,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::query::{EntityQuery, WorkspaceQueryAugmenter};
use crate::rows::{self, Row};
use crate::{SqliteRegistry, SqliteSettings};

struct KindContext {
    kind: EntityKindDescriptor,
    fields: Vec<FieldDescriptor>,
    mapping: TableMapping,
    layouts: Vec<TableLayout>,
}

impl KindContext {
    fn revision_table(&self) -> String {
        self.mapping
            .revision
            .clone()
            .unwrap_or_else(|| self.kind.revision_table_name())
    }

    fn layouts_where(&self, keep: impl Fn(TableRole) -> bool) -> Vec<TableLayout> {
        self.layouts
            .iter()
            .filter(|layout| keep(layout.role))
            .cloned()
            .collect()
    }

    fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// Revision-aware entity storage bound to one workspace.
pub struct VersionedStorage<'a> {
    conn: &'a Connection,
    workspace: String,
}

impl<'a> VersionedStorage<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection, workspace: &str) -> Self {
        Self {
            conn,
            workspace: workspace.to_string(),
        }
    }

    #[must_use]
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    fn in_default_workspace(&self) -> bool {
        self.workspace == DEFAULT_WORKSPACE
    }

    fn context(&self, kind_id: &str) -> Result<KindContext> {
        let registry = SqliteRegistry::new(self.conn);
        let kind = registry.entity_kind(kind_id)?.ok_or_else(|| {
            anyhow!(MultiversionError::Validation(format!(
                "unknown entity kind: {kind_id}"
            )))
        })?;
        let enabled = SqliteSettings::new(self.conn).settings()?.is_enabled(kind_id);
        if !kind.versioned || !enabled {
            return Err(anyhow!(MultiversionError::Validation(format!(
                "entity kind {kind_id} is not enabled for versioned storage"
            ))));
        }

        let fields = registry.field_definitions(kind_id)?;
        let mapping = registry.active_mapping(&kind)?;
        let layouts = table_layouts(&kind, &fields, &mapping);
        Ok(KindContext {
            kind,
            fields,
            mapping,
            layouts,
        })
    }

    /// Saves `record` as a new revision and returns its token.
    pub fn save(&self, record: &mut EntityRecord) -> Result<RevisionToken> {
        let context = self.context(&record.kind)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start entity save transaction")?;
        let token = self.write(&context, record, false)?;
        tx.commit()
            .context("failed to commit entity save transaction")?;
        Ok(token)
    }

    /// Soft delete: a new revision with `_deleted` set.
    pub fn delete(&self, record: &mut EntityRecord) -> Result<RevisionToken> {
        if record.id.is_none() {
            return Err(anyhow!(MultiversionError::Validation(format!(
                "cannot delete an unsaved {} entity",
                record.kind
            ))));
        }
        record.revision.deleted = true;
        self.save(record)
    }

    /// Placeholder for an entity referenced before its content arrives.
    pub fn create_stub(&self, kind_id: &str, uuid: &str) -> Result<EntityRecord> {
        let context = self.context(kind_id)?;
        if self.find_id(&context, uuid)?.is_some() {
            return Err(anyhow!(MultiversionError::Conflict(format!(
                "entity {kind_id} with uuid {uuid} already exists"
            ))));
        }

        let mut record = EntityRecord::new(kind_id);
        record.uuid = uuid.to_string();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start stub transaction")?;
        self.write(&context, &mut record, true)?;
        tx.commit().context("failed to commit stub transaction")?;
        Ok(record)
    }

    pub fn id_for_uuid(&self, kind_id: &str, uuid: &str) -> Result<Option<i64>> {
        let context = self.context(kind_id)?;
        self.find_id(&context, uuid)
    }

    /// Revisions are immutable history.
    pub fn delete_revision(&self, kind_id: &str, revision_id: i64) -> Result<()> {
        self.context(kind_id)?;
        Err(anyhow!(MultiversionError::Conflict(format!(
            "revision {revision_id} of {kind_id} cannot be deleted; save a deletion instead"
        ))))
    }

    /// Physically removes an entity with all of its revisions and workspace
    /// associations.
    pub fn purge(&self, kind_id: &str, id: i64) -> Result<bool> {
        let context = self.context(kind_id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start purge transaction")?;
        let existed = self.base_row(&context, id)?.is_some();
        for layout in &context.layouts {
            let column = match layout.role {
                TableRole::Dedicated | TableRole::DedicatedRevision => "entity_id",
                _ => context.kind.id_key.as_str(),
            };
            rows::delete_where(self.conn, &layout.table, column, id)?;
        }
        self.conn
            .execute(
                "DELETE FROM workspace_association WHERE entity_kind = ?1 AND entity_id = ?2",
                params![kind_id, id],
            )
            .context("failed to delete workspace associations")?;
        tx.commit().context("failed to commit purge transaction")?;

        info!(kind = %kind_id, id, existed, "purged entity");
        Ok(existed)
    }

    /// Head revision visible in this workspace, unless soft-deleted.
    pub fn load(&self, kind_id: &str, id: i64) -> Result<Option<EntityRecord>> {
        let context = self.context(kind_id)?;
        Ok(self
            .load_visible(&context, id)?
            .filter(|record| !record.revision.deleted))
    }

    pub fn load_deleted(&self, kind_id: &str, id: i64) -> Result<Option<EntityRecord>> {
        let context = self.context(kind_id)?;
        Ok(self
            .load_visible(&context, id)?
            .filter(|record| record.revision.deleted))
    }

    /// Loads a specific revision regardless of workspace or deleted state.
    pub fn load_revision(&self, kind_id: &str, revision_id: i64) -> Result<Option<EntityRecord>> {
        let context = self.context(kind_id)?;
        self.read_revision(&context, revision_id)
    }

    /// Revision history of an entity, oldest first.
    pub fn revision_ids(&self, kind_id: &str, id: i64) -> Result<Vec<i64>> {
        let context = self.context(kind_id)?;
        let revision_key = context.kind.revision_key_or_default();
        let rows = rows::select_where(
            self.conn,
            &context.revision_table(),
            &context.kind.id_key,
            &SqlValue::Integer(id),
            Some(revision_key),
        )?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get(revision_key).and_then(FieldValue::as_i64))
            .collect())
    }

    /// Keyed `(revision id, entity id)` pairs matching `query` in this
    /// workspace (unless the query overrides it).
    pub fn query(&self, query: &EntityQuery) -> Result<Vec<(i64, i64)>> {
        let registry = SqliteRegistry::new(self.conn);
        let settings = SqliteSettings::new(self.conn);
        let active = FixedWorkspace::new(Some(&self.workspace));
        WorkspaceQueryAugmenter::new(&registry, &settings, &active).execute(self.conn, query)
    }

    fn write(
        &self,
        context: &KindContext,
        record: &mut EntityRecord,
        stub: bool,
    ) -> Result<RevisionToken> {
        let kind = &context.kind;
        let existing = match record.id {
            Some(id) => self.base_row(context, id)?,
            None => None,
        };
        let id = match record.id {
            Some(id) => id,
            None => rows::next_id(self.conn, &context.mapping.base, &kind.id_key)?,
        };
        record.id = Some(id);
        let entity_id = id.to_string();

        let token = if stub {
            RevisionToken::stub()
        } else if record.revision.new_edit {
            // An incoming token on a new entity is discarded.
            let previous = match &existing {
                Some(row) => self.current_token(context, id, row)?,
                None => None,
            };
            match previous {
                Some(previous) => previous.next(record.revision.deleted, &entity_id),
                None => RevisionToken::compute(None, record.revision.deleted, &entity_id, 0),
            }
        } else {
            let supplied = record.revision.token.as_deref().ok_or_else(|| {
                anyhow!(MultiversionError::Validation(format!(
                    "replicated save of {}:{id} requires a revision token",
                    kind.id
                )))
            })?;
            RevisionToken::parse(supplied)?
        };

        let revision_id = rows::next_id(
            self.conn,
            &context.revision_table(),
            kind.revision_key_or_default(),
        )?;
        record.revision_id = Some(revision_id);
        record.revision.token = Some(token.to_string());
        record.revision.is_stub = stub;
        record.revision.default_revision = self.in_default_workspace();
        record.revision.workspace = Some(self.workspace.clone());
        if kind.translatable {
            if let Some(field) = context.field(REVISION_TRANSLATION_AFFECTED_FIELD) {
                record.set_field(kind, field, true);
            }
        }

        rows::write_entity_rows(
            self.conn,
            kind,
            &context.layouts_where(TableRole::is_revision),
            record,
            false,
        )?;

        let owned = existing
            .as_ref()
            .and_then(|row| row.get(WORKSPACE_FIELD))
            .and_then(FieldValue::as_str)
            == Some(self.workspace.as_str());
        if self.in_default_workspace() || existing.is_none() || owned {
            rows::write_entity_rows(
                self.conn,
                kind,
                &context.layouts_where(|role| !role.is_revision()),
                record,
                true,
            )?;
        }
        if !self.in_default_workspace() {
            self.associate(&kind.id, id, revision_id)?;
        }

        debug!(
            kind = %kind.id,
            id,
            revision_id,
            token = %token,
            workspace = %self.workspace,
            "saved revision"
        );
        Ok(token)
    }

    fn base_row(&self, context: &KindContext, id: i64) -> Result<Option<Row>> {
        Ok(rows::select_where(
            self.conn,
            &context.mapping.base,
            &context.kind.id_key,
            &SqlValue::Integer(id),
            None,
        )?
        .into_iter()
        .next())
    }

    fn revision_row(&self, context: &KindContext, revision_id: i64) -> Result<Option<Row>> {
        Ok(rows::select_where(
            self.conn,
            &context.revision_table(),
            context.kind.revision_key_or_default(),
            &SqlValue::Integer(revision_id),
            None,
        )?
        .into_iter()
        .next())
    }

    fn find_id(&self, context: &KindContext, uuid: &str) -> Result<Option<i64>> {
        let rows = rows::select_where(
            self.conn,
            &context.mapping.base,
            &context.kind.uuid_key,
            &SqlValue::Text(uuid.to_string()),
            None,
        )?;
        Ok(rows
            .first()
            .and_then(|row| row.get(&context.kind.id_key))
            .and_then(FieldValue::as_i64))
    }

    /// Token of the head revision this workspace would branch from.
    fn current_token(
        &self,
        context: &KindContext,
        id: i64,
        base: &Row,
    ) -> Result<Option<RevisionToken>> {
        let mut raw = base
            .get(REV_FIELD)
            .and_then(FieldValue::as_str)
            .map(str::to_string);
        if !self.in_default_workspace() {
            if let Some(revision_id) = self.association(&context.kind.id, id)? {
                raw = self
                    .revision_row(context, revision_id)?
                    .and_then(|row| row.get(REV_FIELD).and_then(FieldValue::as_str).map(str::to_string));
            }
        }
        raw.as_deref()
            .map(RevisionToken::parse)
            .transpose()
            .map_err(anyhow::Error::from)
    }

    fn association(&self, kind_id: &str, id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT revision_id FROM workspace_association
                 WHERE entity_kind = ?1 AND entity_id = ?2 AND workspace = ?3",
                params![kind_id, id, self.workspace],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read workspace association")
    }

    fn associate(&self, kind_id: &str, id: i64, revision_id: i64) -> Result<()> {
        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO workspace_association(entity_kind, entity_id, revision_id, workspace, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(entity_kind, entity_id, workspace) DO UPDATE SET
                   revision_id = excluded.revision_id,
                   updated_at = excluded.updated_at",
                params![kind_id, id, revision_id, self.workspace, now],
            )
            .context("failed to upsert workspace association")?;
        Ok(())
    }

    fn load_visible(&self, context: &KindContext, id: i64) -> Result<Option<EntityRecord>> {
        if !self.in_default_workspace() {
            if let Some(revision_id) = self.association(&context.kind.id, id)? {
                return self.read_revision(context, revision_id);
            }
        }

        let Some(base) = self.base_row(context, id)? else {
            return Ok(None);
        };
        let visible = match base.get(WORKSPACE_FIELD).and_then(FieldValue::as_str) {
            Some(owner) => owner == DEFAULT_WORKSPACE || owner == self.workspace,
            None => true,
        };
        if !visible {
            return Ok(None);
        }

        let mut record = EntityRecord::new(&context.kind.id);
        rows::read_entity_rows(
            self.conn,
            &context.kind,
            &context.layouts_where(|role| !role.is_revision()),
            &mut record,
            id,
            None,
        )?;
        Ok(Some(record))
    }

    fn read_revision(&self, context: &KindContext, revision_id: i64) -> Result<Option<EntityRecord>> {
        let Some(id) = self
            .revision_row(context, revision_id)?
            .and_then(|row| row.get(&context.kind.id_key).and_then(FieldValue::as_i64))
        else {
            return Ok(None);
        };

        let mut record = EntityRecord::new(&context.kind.id);
        if !rows::read_entity_rows(
            self.conn,
            &context.kind,
            &context.layouts_where(|role| role == TableRole::Base),
            &mut record,
            id,
            None,
        )? {
            return Ok(None);
        }
        record.translations.clear();
        record.multi_values.clear();
        rows::read_entity_rows(
            self.conn,
            &context.kind,
            &context.layouts_where(TableRole::is_revision),
            &mut record,
            id,
            Some(revision_id),
        )?;
        Ok(Some(record))
    }
}
