//! Online conversion of legacy entity tables into the versioned shape.
//!
//! One conversion per entity kind runs through
//! `NotStarted -> ShadowBuilt -> Copying -> Committing -> Done`, with `Failed`
//! absorbing. All state needed to resume lives in [`ConversionProgress`].

use anyhow::{anyhow, Context, Result};
use multiversion_core::{
    backup_table_name, schema_entries, table_layouts, ConversionConfig, ConversionError,
    ConversionProgress, ConversionState, DefinitionRegistry, EntityRecord, KindProgress,
    MultiversionError, RevisionToken, SchemaError, SchemaOps, SettingsStore, ShadowTableSet,
    TableLayout, DEFAULT_WORKSPACE, REVISION_TRANSLATION_AFFECTED_FIELD,
};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{quote_ident, rows, table_exists};

// ---------------------------------------------------------------------------
// ShadowSchemaBuilder
// ---------------------------------------------------------------------------

pub struct ShadowSchemaBuilder<'a> {
    schema: &'a dyn SchemaOps,
    registry: &'a dyn DefinitionRegistry,
}

impl<'a> ShadowSchemaBuilder<'a> {
    #[must_use]
    pub fn new(schema: &'a dyn SchemaOps, registry: &'a dyn DefinitionRegistry) -> Self {
        Self { schema, registry }
    }

    /// Creates the shadow tables of `kind` and points its temporary mapping at
    /// them. Failures surface as [`ConversionError::SchemaBuild`].
    pub fn build(&self, kind: &str) -> Result<ShadowTableSet> {
        self.try_build(kind).map_err(|err| {
            anyhow!(ConversionError::SchemaBuild {
                kind: kind.to_string(),
                message: format!("{err:#}"),
            })
        })
    }

    fn try_build(&self, kind_id: &str) -> Result<ShadowTableSet> {
        let kind = self
            .registry
            .entity_kind(kind_id)?
            .ok_or_else(|| anyhow!("unknown entity kind: {kind_id}"))?;
        if kind.local {
            return Err(anyhow!("entity kind {kind_id} is local and cannot be versioned"));
        }
        if kind.versioned {
            return Err(anyhow!("entity kind {kind_id} is already versioned"));
        }
        let fields = self.registry.field_definitions(kind_id)?;
        kind.validate(&fields)?;

        let shadow = ShadowTableSet::derive(&kind, &fields);
        for table in shadow.new_tables() {
            if self.schema.table_exists(&table)? {
                return Err(anyhow!(SchemaError::TableExists(table)));
            }
        }
        for table in shadow.shadow.table_names() {
            if self.schema.table_exists(&table)? {
                warn!(kind = %kind_id, table = %table, "dropping stale shadow table");
                self.schema.drop_table(&table)?;
            }
        }

        let layouts = shadow.shadow_layouts();
        if let Err(err) = self.create_shadow(&shadow, &layouts) {
            self.discard(&shadow);
            return Err(err);
        }

        info!(kind = %kind_id, tables = layouts.len(), "built shadow schema");
        Ok(shadow)
    }

    fn create_shadow(&self, shadow: &ShadowTableSet, layouts: &[TableLayout]) -> Result<()> {
        for layout in layouts {
            self.schema.create_table(&layout.table, &layout.schema)?;
        }
        self.registry
            .record_schema(&shadow.kind, &schema_entries(&shadow.target_kind, layouts))?;
        self.registry
            .set_temporary_mapping(&shadow.kind, Some(&shadow.shadow))
    }

    fn discard(&self, shadow: &ShadowTableSet) {
        let tables = shadow.shadow.table_names();
        for table in &tables {
            if let Err(err) = self.schema.drop_table(table) {
                warn!(kind = %shadow.kind, table = %table, error = %err, "failed to drop shadow table");
            }
        }
        if let Err(err) = self.registry.remove_schema_tables(&shadow.kind, &tables) {
            warn!(kind = %shadow.kind, error = %err, "failed to drop shadow schema data");
        }
        if let Err(err) = self.registry.set_temporary_mapping(&shadow.kind, None) {
            warn!(kind = %shadow.kind, error = %err, "failed to clear temporary mapping");
        }
    }
}

// ---------------------------------------------------------------------------
// BatchCopier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchOutcome {
    pub rows_copied: usize,
    pub cursor: i64,
    pub total: u64,
    pub processed: u64,
    pub complete: bool,
}

pub struct BatchCopier<'a> {
    conn: &'a Connection,
    registry: &'a dyn DefinitionRegistry,
}

impl<'a> BatchCopier<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection, registry: &'a dyn DefinitionRegistry) -> Self {
        Self { conn, registry }
    }

    /// Copies up to `batch_size` legacy rows with an id above `cursor` into
    /// the tables the kind is temporarily mapped to. The batch is
    /// all-or-nothing. Every failure surfaces as a [`ConversionError`] for
    /// the kind.
    pub fn copy_batch(
        &self,
        shadow: &ShadowTableSet,
        cursor: i64,
        batch_size: usize,
    ) -> Result<BatchOutcome> {
        self.try_copy_batch(shadow, cursor, batch_size).map_err(|err| {
            if err.downcast_ref::<ConversionError>().is_some() {
                err
            } else {
                anyhow!(ConversionError::Batch {
                    kind: shadow.kind.clone(),
                    message: format!("{err:#}"),
                })
            }
        })
    }

    fn try_copy_batch(
        &self,
        shadow: &ShadowTableSet,
        cursor: i64,
        batch_size: usize,
    ) -> Result<BatchOutcome> {
        let mapping = self.registry.active_mapping(&shadow.target_kind)?;
        if mapping != shadow.shadow {
            return Err(anyhow!(
                "entity kind {} is not mapped to its shadow tables",
                shadow.kind
            ));
        }
        let id_key = shadow.original_kind.id_key.as_str();
        let original_layouts = shadow.original_layouts();
        let shadow_layouts = table_layouts(&shadow.target_kind, &shadow.target_fields, &mapping);

        // Rows committed by a batch whose checkpoint never made it are skipped.
        let resume = rows::max_value(self.conn, &mapping.base, id_key)?
            .map_or(cursor, |copied| copied.max(cursor));
        let ids = rows::ids_after(
            self.conn,
            &shadow.original.base,
            id_key,
            resume,
            batch_size.max(1),
        )?;

        let purge_table = match &shadow.original_kind.hierarchy_index {
            Some(index) if table_exists(self.conn, &index.table)? => Some(index),
            _ => None,
        };
        let row_error = |id: i64, err: &anyhow::Error| {
            anyhow!(ConversionError::Copy {
                kind: shadow.kind.clone(),
                entity_id: id,
                message: format!("{err:#}"),
            })
        };

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start copy batch transaction")?;
        let mut rows_copied = 0;
        for &id in &ids {
            let copied = self
                .copy_row(shadow, &original_layouts, &shadow_layouts, id)
                .map_err(|err| row_error(id, &err))?;
            let Some(uuid) = copied else {
                continue;
            };
            rows_copied += 1;
            if let Some(index) = purge_table {
                self.conn
                    .execute(
                        &format!(
                            "DELETE FROM {} WHERE {} = ?1",
                            quote_ident(&index.table),
                            quote_ident(&index.column)
                        ),
                        params![format!("{}:{uuid}", index.key_prefix)],
                    )
                    .with_context(|| {
                        format!("failed to purge hierarchy rows of {}", shadow.kind)
                    })
                    .map_err(|err| row_error(id, &err))?;
            }
        }
        tx.commit().context("failed to commit copy batch")?;

        let cursor = ids.last().copied().unwrap_or(resume);
        let swept = !rows::exists_after(self.conn, &shadow.original.base, id_key, cursor)?;
        let pruned = if swept {
            self.prune_deleted(shadow, &mapping.base, &shadow_layouts)?
        } else {
            0
        };
        let total = rows::count_rows(self.conn, &shadow.original.base)?;
        let processed = rows::count_rows(self.conn, &mapping.base)?;
        let complete = swept && processed >= total;

        debug!(
            kind = %shadow.kind,
            cursor,
            rows_copied,
            pruned,
            processed,
            total,
            complete,
            "copied batch"
        );
        Ok(BatchOutcome {
            rows_copied,
            cursor,
            total,
            processed,
            complete,
        })
    }

    /// Removes copied rows whose legacy source was deleted after the copy.
    fn prune_deleted(
        &self,
        shadow: &ShadowTableSet,
        shadow_base: &str,
        shadow_layouts: &[TableLayout],
    ) -> Result<usize> {
        let id_key = shadow.original_kind.id_key.as_str();
        let orphans = rows::ids_missing_from(self.conn, shadow_base, &shadow.original.base, id_key)?;
        if orphans.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to start shadow prune transaction")?;
        for &id in &orphans {
            // Copied rows reuse the entity id as their revision id.
            for layout in shadow_layouts {
                rows::delete_where(
                    self.conn,
                    &layout.table,
                    rows::key_column(&shadow.target_kind, layout.role),
                    id,
                )?;
            }
        }
        tx.commit().context("failed to commit shadow prune")?;

        info!(kind = %shadow.kind, pruned = orphans.len(), "pruned rows deleted during conversion");
        Ok(orphans.len())
    }

    fn copy_row(
        &self,
        shadow: &ShadowTableSet,
        original_layouts: &[TableLayout],
        shadow_layouts: &[TableLayout],
        id: i64,
    ) -> Result<Option<String>> {
        let mut record = EntityRecord::new(&shadow.kind);
        if !rows::read_entity_rows(
            self.conn,
            &shadow.original_kind,
            original_layouts,
            &mut record,
            id,
            None,
        )? {
            return Ok(None);
        }

        let target = &shadow.target_kind;
        record.revision_id = Some(id);
        record.revision.default_revision = true;
        record.revision.deleted = false;
        record.revision.is_stub = false;
        record.revision.workspace = Some(DEFAULT_WORKSPACE.to_string());
        record.revision.token =
            Some(RevisionToken::generate_initial(&id.to_string(), &record.uuid).to_string());

        let published_key = target.published_key_or_default();
        for field in &shadow.target_fields {
            if field.name == published_key
                || (target.translatable && field.name == REVISION_TRANSLATION_AFFECTED_FIELD)
            {
                record.set_field(target, field, true);
            }
        }

        rows::write_entity_rows(self.conn, target, shadow_layouts, &record, false)?;
        Ok(Some(record.uuid))
    }
}

// ---------------------------------------------------------------------------
// SchemaSwapper
// ---------------------------------------------------------------------------

pub struct SchemaSwapper<'a> {
    schema: &'a dyn SchemaOps,
    registry: &'a dyn DefinitionRegistry,
}

impl<'a> SchemaSwapper<'a> {
    #[must_use]
    pub fn new(schema: &'a dyn SchemaOps, registry: &'a dyn DefinitionRegistry) -> Self {
        Self { schema, registry }
    }

    /// Swaps the shadow tables into place. On failure the kind is restored to
    /// its legacy shape and [`ConversionError::Commit`] is returned.
    pub fn commit(&self, shadow: &ShadowTableSet) -> Result<()> {
        let commit_error = |err: &anyhow::Error| {
            anyhow!(ConversionError::Commit {
                kind: shadow.kind.clone(),
                message: format!("{err:#}"),
            })
        };

        self.schema
            .begin_exclusive()
            .map_err(|err| commit_error(&err))?;

        let swapped = self
            .swap(shadow)
            .and_then(|()| self.schema.end_exclusive(true));
        if let Err(err) = swapped {
            if let Err(release) = self.schema.end_exclusive(false) {
                warn!(kind = %shadow.kind, error = %release, "failed to release schema lock");
            }
            if let Err(recovery) = self.rollback(shadow) {
                return Err(anyhow!(ConversionError::Commit {
                    kind: shadow.kind.clone(),
                    message: format!("{err:#}; recovery also failed: {recovery:#}"),
                }));
            }
            return Err(commit_error(&err));
        }

        info!(kind = %shadow.kind, "committed versioned schema");
        Ok(())
    }

    fn swap(&self, shadow: &ShadowTableSet) -> Result<()> {
        let originals = shadow.original.table_names();
        for table in &originals {
            self.schema.rename_table(table, &backup_table_name(table))?;
        }
        let renames = shadow.renames();
        for (from, to) in &renames {
            self.schema.rename_table(from, to)?;
        }

        self.registry.remove_schema_tables(&shadow.kind, &originals)?;
        self.registry.rename_schema_tables(&shadow.kind, &renames)?;

        let mut converted = shadow.target_kind.clone();
        converted.versioned = true;
        self.registry.update_entity_kind(&converted)?;
        for field in &shadow.target_fields {
            self.registry.install_field(&shadow.kind, field)?;
        }
        self.registry.set_temporary_mapping(&shadow.kind, None)?;

        for table in &originals {
            let backup = backup_table_name(table);
            if let Err(err) = self.schema.drop_table(&backup) {
                warn!(kind = %shadow.kind, table = %backup, error = %err, "failed to drop backup table");
            }
        }
        Ok(())
    }

    /// Returns the kind to its legacy shape. Safe to run repeatedly; on a kind
    /// that already committed it only removes leftover shadow and backup tables.
    pub fn rollback(&self, shadow: &ShadowTableSet) -> Result<()> {
        let committed = self
            .registry
            .entity_kind(&shadow.kind)?
            .is_some_and(|kind| kind.versioned);

        if committed {
            for table in shadow
                .original
                .table_names()
                .iter()
                .map(|table| backup_table_name(table))
                .chain(shadow.shadow.table_names())
            {
                if self.schema.table_exists(&table)? {
                    self.schema.drop_table(&table)?;
                }
            }
            return Ok(());
        }

        let mut restored = 0_usize;
        for table in shadow.original.table_names() {
            let backup = backup_table_name(&table);
            if !self.schema.table_exists(&backup)? {
                continue;
            }
            if self.schema.table_exists(&table)? {
                self.schema.drop_table(&table)?;
            }
            self.schema.rename_table(&backup, &table)?;
            restored += 1;
        }

        // New real-named tables can only come from a partial swap.
        if restored > 0 {
            for table in shadow.new_tables() {
                if self.schema.table_exists(&table)? {
                    self.schema.drop_table(&table)?;
                }
            }
        }
        for table in shadow.shadow.table_names() {
            if self.schema.table_exists(&table)? {
                self.schema.drop_table(&table)?;
            }
        }

        self.restore_definitions(shadow)?;
        info!(kind = %shadow.kind, restored, "rolled back conversion");
        Ok(())
    }

    fn restore_definitions(&self, shadow: &ShadowTableSet) -> Result<()> {
        self.registry.update_entity_kind(&shadow.original_kind)?;
        for field in &shadow.target_fields {
            if !shadow
                .original_fields
                .iter()
                .any(|original| original.name == field.name)
            {
                self.registry.uninstall_field(&shadow.kind, field)?;
            }
        }
        for field in &shadow.original_fields {
            self.registry.install_field(&shadow.kind, field)?;
        }

        let mut tables = shadow.shadow.table_names();
        tables.extend(shadow.target.table_names());
        self.registry.remove_schema_tables(&shadow.kind, &tables)?;
        self.registry.record_schema(
            &shadow.kind,
            &schema_entries(&shadow.original_kind, &shadow.original_layouts()),
        )?;
        self.registry.set_temporary_mapping(&shadow.kind, None)
    }
}

// ---------------------------------------------------------------------------
// ConversionOrchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutcome {
    pub kind: String,
    pub state: ConversionState,
    pub rows_copied: usize,
    pub finished: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversionReport {
    pub enabled: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub fixed_keys: Vec<String>,
    pub finished: f64,
}

pub struct ConversionOrchestrator<'a> {
    conn: &'a Connection,
    schema: &'a dyn SchemaOps,
    registry: &'a dyn DefinitionRegistry,
    settings: &'a dyn SettingsStore,
    config: ConversionConfig,
}

impl<'a> ConversionOrchestrator<'a> {
    #[must_use]
    pub fn new(
        conn: &'a Connection,
        schema: &'a dyn SchemaOps,
        registry: &'a dyn DefinitionRegistry,
        settings: &'a dyn SettingsStore,
        config: ConversionConfig,
    ) -> Self {
        Self {
            conn,
            schema,
            registry,
            settings,
            config,
        }
    }

    /// Splits the requested kinds (all installed kinds when `None`) into
    /// eligible and skipped ones.
    pub fn eligible_kinds(&self, requested: Option<&[String]>) -> Result<(Vec<String>, Vec<String>)> {
        let settings = self.settings.settings()?;
        let installed = self.registry.entity_kinds()?;

        let candidates: Vec<String> = match requested {
            Some(kinds) => kinds.to_vec(),
            None => installed.iter().map(|kind| kind.id.clone()).collect(),
        };

        let mut eligible = Vec::new();
        let mut skipped = Vec::new();
        for candidate in candidates {
            let Some(kind) = installed.iter().find(|kind| kind.id == candidate) else {
                return Err(anyhow!(MultiversionError::Configuration(format!(
                    "entity kind {candidate} is not installed"
                ))));
            };
            let convertible = !kind.local
                && settings.is_supported(&kind.id)
                && !settings.is_enabled(&kind.id)
                && !kind.versioned;
            if convertible {
                if !eligible.contains(&candidate) {
                    eligible.push(candidate);
                }
            } else if !skipped.contains(&candidate) {
                skipped.push(candidate);
            }
        }
        Ok((eligible, skipped))
    }

    pub fn plan(&self, requested: Option<&[String]>) -> Result<ConversionProgress> {
        self.config.validate()?;
        let (eligible, skipped) = self.eligible_kinds(requested)?;
        if !skipped.is_empty() {
            debug!(skipped = ?skipped, "skipping entity kinds");
        }
        Ok(ConversionProgress::new(&eligible, self.config.batch_size))
    }

    /// Performs one bounded unit of work for the next pending kind. Returns
    /// `None` once every kind is done or failed.
    pub fn step(&self, progress: &mut ConversionProgress) -> Result<Option<StepOutcome>> {
        let batch_size = progress.batch_size;
        let Some(entry) = progress.next_pending() else {
            return Ok(None);
        };

        let rows_copied = match self.advance(entry, batch_size) {
            Ok(rows_copied) => rows_copied,
            Err(err) => {
                let Some(failure) = err.downcast_ref::<ConversionError>() else {
                    return Err(err);
                };
                self.isolate_failure(entry, failure)?;
                0
            }
        };
        let kind = entry.kind.clone();
        let state = entry.state;

        Ok(Some(StepOutcome {
            kind,
            state,
            rows_copied,
            finished: progress.finished(),
        }))
    }

    /// Adds language-aware composite keys on the data tables of converted
    /// translatable kinds. Existing keys count as success.
    pub fn finalize(&self, progress: &ConversionProgress) -> Result<Vec<String>> {
        let mut fixed = Vec::new();
        for kind_id in progress.kinds_in_state(ConversionState::Done) {
            let Some(kind) = self.registry.entity_kind(&kind_id)? else {
                continue;
            };
            let Some(langcode_key) = kind.langcode_key.as_deref() else {
                continue;
            };
            if !kind.translatable {
                continue;
            }
            let mapping = self.registry.active_mapping(&kind)?;
            let keys = [
                (mapping.data.as_deref(), kind.id_key.as_str()),
                (
                    mapping.revision_data.as_deref(),
                    kind.revision_key_or_default(),
                ),
            ];
            for (table, key) in keys {
                let Some(table) = table else {
                    continue;
                };
                match self.schema.add_primary_key(table, &[key, langcode_key]) {
                    Ok(()) => fixed.push(table.to_string()),
                    Err(err) if matches!(err.downcast_ref::<SchemaError>(), Some(SchemaError::KeyExists(_))) => {
                        debug!(table = %table, "composite key already present");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(fixed)
    }

    /// Converts the requested kinds (all eligible kinds when `None`) to
    /// completion.
    pub fn enable_versioning(&self, requested: Option<&[String]>) -> Result<ConversionReport> {
        let (_, skipped) = self.eligible_kinds(requested)?;
        let mut progress = self.plan(requested)?;
        info!(kinds = progress.kinds.len(), "enabling versioning");

        while self.step(&mut progress)?.is_some() {}
        let fixed_keys = self.finalize(&progress)?;

        let report = ConversionReport {
            enabled: progress.kinds_in_state(ConversionState::Done),
            failed: progress.kinds_in_state(ConversionState::Failed),
            skipped,
            fixed_keys,
            finished: progress.finished(),
        };
        info!(
            enabled = report.enabled.len(),
            failed = report.failed.len(),
            "versioning run finished"
        );
        Ok(report)
    }

    fn advance(&self, entry: &mut KindProgress, batch_size: usize) -> Result<usize> {
        let kind = self.registry.entity_kind(&entry.kind)?.ok_or_else(|| {
            anyhow!(MultiversionError::Configuration(format!(
                "entity kind {} is not installed",
                entry.kind
            )))
        })?;

        if kind.versioned {
            // Converted by an earlier tick whose checkpoint was lost.
            if let Some(shadow) = entry.shadow.take() {
                self.swapper().rollback(&shadow)?;
            }
            entry.total = rows::count_rows(self.conn, &kind.base_table)?;
            entry.processed = entry.total;
            entry.state = ConversionState::Done;
            self.mark_enabled(&entry.kind)?;
            return Ok(0);
        }

        match entry.state {
            ConversionState::NotStarted => {
                let shadow = ShadowSchemaBuilder::new(self.schema, self.registry).build(&entry.kind)?;
                entry.total = rows::count_rows(self.conn, &shadow.original.base)?;
                entry.processed = 0;
                entry.cursor = 0;
                entry.error = None;
                entry.shadow = Some(shadow);
                entry.state = ConversionState::ShadowBuilt;
                Ok(0)
            }
            ConversionState::ShadowBuilt | ConversionState::Copying => {
                let Some(shadow) = entry.shadow.clone() else {
                    entry.reset();
                    return Ok(0);
                };
                if !self.shadow_present(&shadow)? {
                    warn!(kind = %entry.kind, "shadow tables are missing; restarting conversion");
                    entry.reset();
                    return Ok(0);
                }

                let outcome = BatchCopier::new(self.conn, self.registry)
                    .copy_batch(&shadow, entry.cursor, batch_size)?;
                entry.advance_cursor(outcome.cursor)?;
                entry.total = outcome.total;
                entry.processed = outcome.processed;
                entry.state = if outcome.complete {
                    ConversionState::Committing
                } else {
                    ConversionState::Copying
                };
                Ok(outcome.rows_copied)
            }
            ConversionState::Committing => {
                let Some(shadow) = entry.shadow.clone() else {
                    entry.reset();
                    return Ok(0);
                };
                if self.backups_present(&shadow)? {
                    return Err(anyhow!(ConversionError::Commit {
                        kind: entry.kind.clone(),
                        message: "an earlier commit was interrupted after renames began"
                            .to_string(),
                    }));
                }
                if !self.shadow_present(&shadow)? {
                    warn!(kind = %entry.kind, "shadow tables are missing; restarting conversion");
                    entry.reset();
                    return Ok(0);
                }

                self.swapper().commit(&shadow)?;
                entry.shadow = None;
                entry.processed = entry.processed.max(entry.total);
                entry.state = ConversionState::Done;
                self.mark_enabled(&entry.kind)?;
                info!(kind = %entry.kind, "versioning enabled");
                Ok(0)
            }
            ConversionState::Done | ConversionState::Failed => Ok(0),
        }
    }

    fn isolate_failure(&self, entry: &mut KindProgress, failure: &ConversionError) -> Result<()> {
        warn!(kind = %entry.kind, error = %failure, "entity kind conversion failed; kind stays on legacy storage");
        if let Some(shadow) = entry.shadow.take() {
            self.swapper().rollback(&shadow)?;
        }
        entry.fail(&failure.to_string());

        let mut failed = self.settings.failed_kinds()?;
        if !failed.contains(&entry.kind) {
            failed.push(entry.kind.clone());
            self.settings.save_failed_kinds(&failed)?;
        }
        Ok(())
    }

    fn mark_enabled(&self, kind: &str) -> Result<()> {
        let mut settings = self.settings.settings()?;
        settings.support(kind);
        settings.enable(kind);
        self.settings.save_settings(&settings)?;

        let mut failed = self.settings.failed_kinds()?;
        let before = failed.len();
        failed.retain(|candidate| candidate != kind);
        if failed.len() != before {
            self.settings.save_failed_kinds(&failed)?;
        }
        Ok(())
    }

    fn shadow_present(&self, shadow: &ShadowTableSet) -> Result<bool> {
        for table in shadow.shadow.table_names() {
            if !self.schema.table_exists(&table)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn backups_present(&self, shadow: &ShadowTableSet) -> Result<bool> {
        for table in shadow.original.table_names() {
            if self.schema.table_exists(&backup_table_name(&table))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn swapper(&self) -> SchemaSwapper<'a> {
        SchemaSwapper::new(self.schema, self.registry)
    }
}
