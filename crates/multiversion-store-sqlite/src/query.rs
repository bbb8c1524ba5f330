//! Select builder for entity tables and the workspace rewrite applied to
//! queries against converted kinds.

use anyhow::{anyhow, Context, Result};
use multiversion_core::{
    table_layouts, ActiveWorkspace, DefinitionRegistry, EntityKindDescriptor, FieldValue,
    MultiversionError, SettingsStore, TableLayout, TableMapping, TableRole, DEFAULT_WORKSPACE,
    DELETED_FIELD, WORKSPACE_FIELD,
};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{quote_ident, rows};

const BASE_ALIAS: &str = "base";
const DATA_ALIAS: &str = "data";
const ASSOCIATION_ALIAS: &str = "association";
const WORKSPACE_REVISION_ALIAS: &str = "workspace_revision";

/// Output expression holding the revision id of each match.
pub const REVISION_EXPRESSION: &str = "revision_id";
/// Output expression holding the entity id of each match.
pub const ENTITY_EXPRESSION: &str = "entity_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conjunction {
    And,
    Or,
}

impl Conjunction {
    fn as_sql(self) -> &'static str {
        match self {
            Self::And => " AND ",
            Self::Or => " OR ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    IsNull,
    IsNotNull,
}

impl Operator {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }

    fn takes_value(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeletedFilter {
    #[default]
    NotDeleted,
    DeletedOnly,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Compare {
        expression: String,
        op: Operator,
        value: FieldValue,
    },
    Raw {
        sql: String,
        params: Vec<FieldValue>,
    },
    Group(ConditionGroup),
}

/// Conditions joined by one conjunction; groups nest.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionGroup {
    conjunction: Conjunction,
    conditions: Vec<Condition>,
}

impl ConditionGroup {
    #[must_use]
    pub fn new(conjunction: Conjunction) -> Self {
        Self {
            conjunction,
            conditions: Vec::new(),
        }
    }

    #[must_use]
    pub fn compare(mut self, expression: &str, op: Operator, value: impl Into<FieldValue>) -> Self {
        self.push_compare(expression, op, value.into());
        self
    }

    #[must_use]
    pub fn raw(mut self, sql: &str, params: Vec<FieldValue>) -> Self {
        self.conditions.push(Condition::Raw {
            sql: sql.to_string(),
            params,
        });
        self
    }

    #[must_use]
    pub fn group(mut self, group: ConditionGroup) -> Self {
        self.conditions.push(Condition::Group(group));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn push_compare(&mut self, expression: &str, op: Operator, value: FieldValue) {
        self.conditions.push(Condition::Compare {
            expression: expression.to_string(),
            op,
            value,
        });
    }

    fn render(&self, params: &mut Vec<FieldValue>) -> String {
        self.conditions
            .iter()
            .map(|condition| match condition {
                Condition::Compare {
                    expression,
                    op,
                    value,
                } => {
                    if op.takes_value() {
                        params.push(value.clone());
                        format!("{expression} {} ?", op.as_sql())
                    } else {
                        format!("{expression} {}", op.as_sql())
                    }
                }
                Condition::Raw { sql, params: raw } => {
                    params.extend(raw.iter().cloned());
                    format!("({sql})")
                }
                Condition::Group(group) => format!("({})", group.render(params)),
            })
            .collect::<Vec<_>>()
            .join(self.conjunction.as_sql())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Join {
    kind: JoinKind,
    table: String,
    alias: String,
    on: String,
    params: Vec<FieldValue>,
}

/// Generic `SELECT` over one aliased table with joins, grouped conditions,
/// named expressions and keyed fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    table: String,
    alias: String,
    distinct: bool,
    joins: Vec<Join>,
    conditions: ConditionGroup,
    expressions: Vec<(String, String)>,
    order: Vec<(String, SortDirection)>,
    range: Option<(usize, usize)>,
}

impl SelectQuery {
    #[must_use]
    pub fn new(table: &str, alias: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: alias.to_string(),
            distinct: false,
            joins: Vec::new(),
            conditions: ConditionGroup::new(Conjunction::And),
            expressions: Vec::new(),
            order: Vec::new(),
            range: None,
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn distinct(&mut self) -> &mut Self {
        self.distinct = true;
        self
    }

    pub fn join(
        &mut self,
        kind: JoinKind,
        table: &str,
        alias: &str,
        on: &str,
        params: Vec<FieldValue>,
    ) -> &mut Self {
        self.joins.push(Join {
            kind,
            table: table.to_string(),
            alias: alias.to_string(),
            on: on.to_string(),
            params,
        });
        self
    }

    #[must_use]
    pub fn has_join(&self, alias: &str) -> bool {
        self.joins.iter().any(|join| join.alias == alias)
    }

    pub fn condition(
        &mut self,
        expression: &str,
        op: Operator,
        value: impl Into<FieldValue>,
    ) -> &mut Self {
        self.conditions.push_compare(expression, op, value.into());
        self
    }

    pub fn where_raw(&mut self, sql: &str, params: Vec<FieldValue>) -> &mut Self {
        self.conditions.conditions.push(Condition::Raw {
            sql: sql.to_string(),
            params,
        });
        self
    }

    pub fn condition_group(&mut self, group: ConditionGroup) -> &mut Self {
        if !group.is_empty() {
            self.conditions.conditions.push(Condition::Group(group));
        }
        self
    }

    /// Adds or replaces the output expression named `alias`.
    pub fn add_expression(&mut self, alias: &str, sql: &str) -> &mut Self {
        match self.expressions.iter_mut().find(|(name, _)| name == alias) {
            Some(existing) => existing.1 = sql.to_string(),
            None => self.expressions.push((alias.to_string(), sql.to_string())),
        }
        self
    }

    #[must_use]
    pub fn expression(&self, alias: &str) -> Option<&str> {
        self.expressions
            .iter()
            .find(|(name, _)| name == alias)
            .map(|(_, sql)| sql.as_str())
    }

    pub fn order_by(&mut self, expression: &str, direction: SortDirection) -> &mut Self {
        self.order.push((expression.to_string(), direction));
        self
    }

    pub fn range(&mut self, offset: usize, limit: usize) -> &mut Self {
        self.range = Some((offset, limit));
        self
    }

    /// SQL text with positional `?` parameters, in order.
    #[must_use]
    pub fn to_sql(&self) -> (String, Vec<FieldValue>) {
        let mut params = Vec::new();
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        if self.expressions.is_empty() {
            sql.push_str(&format!("{}.*", quote_ident(&self.alias)));
        } else {
            let expressions = self
                .expressions
                .iter()
                .map(|(alias, expression)| format!("{expression} AS {}", quote_ident(alias)))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&expressions);
        }
        sql.push_str(&format!(
            " FROM {} AS {}",
            quote_ident(&self.table),
            quote_ident(&self.alias)
        ));

        for join in &self.joins {
            sql.push_str(&format!(
                " {} {} AS {} ON {}",
                join.kind.as_sql(),
                quote_ident(&join.table),
                quote_ident(&join.alias),
                join.on
            ));
            params.extend(join.params.iter().cloned());
        }

        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.render(&mut params));
        }

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(expression, direction)| format!("{expression} {}", direction.as_sql()))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }

        if let Some((offset, limit)) = self.range {
            sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        }

        (sql, params)
    }

    /// Runs the query and returns `(key, value)` pairs read from the named
    /// integer expressions.
    pub fn fetch_keyed(&self, conn: &Connection, key: &str, value: &str) -> Result<Vec<(i64, i64)>> {
        for name in [key, value] {
            if self.expression(name).is_none() {
                return Err(anyhow!(MultiversionError::Validation(format!(
                    "query has no expression named {name}"
                ))));
            }
        }

        let (sql, params) = self.to_sql();
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare query on {}", self.table))?;
        let rows = stmt.query_map(
            params_from_iter(params.iter().map(rows::to_sql)),
            |row| Ok((row.get::<_, i64>(key)?, row.get::<_, i64>(value)?)),
        )?;
        crate::collect_rows(rows)
    }
}

fn column(alias: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(alias), quote_ident(name))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCondition {
    pub field: String,
    pub op: Operator,
    #[serde(default)]
    pub value: FieldValue,
}

/// Entity-level query compiled into a [`SelectQuery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    pub kind: String,
    #[serde(default)]
    pub conditions: Vec<QueryCondition>,
    #[serde(default)]
    pub deleted: DeletedFilter,
    /// Overrides the active workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(default)]
    pub direction: SortDirection,
    /// `(offset, limit)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(usize, usize)>,
}

impl EntityQuery {
    #[must_use]
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            conditions: Vec::new(),
            deleted: DeletedFilter::default(),
            workspace: None,
            sort: None,
            direction: SortDirection::default(),
            range: None,
        }
    }

    #[must_use]
    pub fn condition(mut self, field: &str, op: Operator, value: impl Into<FieldValue>) -> Self {
        self.conditions.push(QueryCondition {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn deleted(mut self, deleted: DeletedFilter) -> Self {
        self.deleted = deleted;
        self
    }

    #[must_use]
    pub fn in_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    #[must_use]
    pub fn sort_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.sort = Some(field.to_string());
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.range = Some((offset, limit));
        self
    }
}

/// Restricts entity queries to what the active workspace can see.
pub struct WorkspaceQueryAugmenter<'a> {
    registry: &'a dyn DefinitionRegistry,
    settings: &'a dyn SettingsStore,
    active: &'a dyn ActiveWorkspace,
}

impl<'a> WorkspaceQueryAugmenter<'a> {
    #[must_use]
    pub fn new(
        registry: &'a dyn DefinitionRegistry,
        settings: &'a dyn SettingsStore,
        active: &'a dyn ActiveWorkspace,
    ) -> Self {
        Self {
            registry,
            settings,
            active,
        }
    }

    pub fn execute(&self, conn: &Connection, query: &EntityQuery) -> Result<Vec<(i64, i64)>> {
        self.build(query)?
            .fetch_keyed(conn, REVISION_EXPRESSION, ENTITY_EXPRESSION)
    }

    /// Compiles `query` against the kind's tables and applies the workspace
    /// rewrite when the kind is enabled.
    pub fn build(&self, query: &EntityQuery) -> Result<SelectQuery> {
        let kind = self.registry.entity_kind(&query.kind)?.ok_or_else(|| {
            anyhow!(MultiversionError::Validation(format!(
                "unknown entity kind: {}",
                query.kind
            )))
        })?;
        let fields = self.registry.field_definitions(&kind.id)?;
        let enabled = kind.versioned && self.settings.settings()?.is_enabled(&kind.id);
        let mapping = if kind.versioned {
            TableMapping::versioned(&kind, &fields)
        } else {
            TableMapping::legacy(&kind, &fields)
        };
        let layouts = table_layouts(&kind, &fields, &mapping);

        let revision_key = kind.revision_key_or_default();
        // Loading a specific revision is explicit; no workspace or deleted filter.
        let by_revision = kind.versioned
            && query
                .conditions
                .iter()
                .any(|condition| condition.field == revision_key);
        let (main_role, data_role) = if by_revision {
            (TableRole::Revision, TableRole::RevisionData)
        } else {
            (TableRole::Base, TableRole::Data)
        };
        let main = find_layout(&layouts, main_role)
            .ok_or_else(|| anyhow!("entity kind {} has no {} table", kind.id, main_role.as_str()))?;

        let mut select = SelectQuery::new(&main.table, BASE_ALIAS);
        let id_column = column(BASE_ALIAS, &kind.id_key);
        let revision_column = if kind.versioned {
            column(BASE_ALIAS, revision_key)
        } else {
            id_column.clone()
        };
        select
            .add_expression(REVISION_EXPRESSION, &revision_column)
            .add_expression(ENTITY_EXPRESSION, &id_column);

        for condition in &query.conditions {
            let expression =
                field_expression(&mut select, &kind, &layouts, main, data_role, &condition.field)?;
            select.condition(&expression, condition.op, condition.value.clone());
        }
        if let Some(sort) = &query.sort {
            let expression = field_expression(&mut select, &kind, &layouts, main, data_role, sort)?;
            select.order_by(&expression, query.direction);
        }
        select.order_by(&id_column, SortDirection::Asc);
        if let Some((offset, limit)) = query.range {
            select.range(offset, limit);
        }

        if enabled && !by_revision {
            self.augment(&mut select, &kind, query.deleted, query.workspace.as_deref())?;
        }
        Ok(select)
    }

    /// Adds the workspace visibility and deleted-flag predicates to a query
    /// whose main table is the base table of `kind`.
    pub fn augment(
        &self,
        select: &mut SelectQuery,
        kind: &EntityKindDescriptor,
        deleted: DeletedFilter,
        workspace_override: Option<&str>,
    ) -> Result<()> {
        let workspace = workspace_override
            .map(str::to_string)
            .or_else(|| self.active.active_workspace())
            .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());
        let base = select.alias().to_string();
        let revision_key = kind.revision_key_or_default();

        let deleted_expression = if workspace == DEFAULT_WORKSPACE {
            select.condition(
                &column(&base, WORKSPACE_FIELD),
                Operator::Eq,
                DEFAULT_WORKSPACE,
            );
            column(&base, DELETED_FIELD)
        } else {
            let association = quote_ident(ASSOCIATION_ALIAS);
            select
                .join(
                    JoinKind::Left,
                    "workspace_association",
                    ASSOCIATION_ALIAS,
                    &format!(
                        "{association}.\"entity_kind\" = ? AND {association}.\"entity_id\" = {} AND {association}.\"workspace\" = ?",
                        column(&base, &kind.id_key)
                    ),
                    vec![FieldValue::from(kind.id.as_str()), FieldValue::from(workspace.as_str())],
                )
                .join(
                    JoinKind::Left,
                    &kind.revision_table_name(),
                    WORKSPACE_REVISION_ALIAS,
                    &format!(
                        "{} = {association}.\"revision_id\"",
                        column(WORKSPACE_REVISION_ALIAS, revision_key)
                    ),
                    Vec::new(),
                )
                .condition_group(
                    ConditionGroup::new(Conjunction::Or)
                        .compare(
                            &column(ASSOCIATION_ALIAS, "workspace"),
                            Operator::Eq,
                            workspace.as_str(),
                        )
                        .compare(
                            &column(&base, WORKSPACE_FIELD),
                            Operator::Eq,
                            DEFAULT_WORKSPACE,
                        ),
                )
                .add_expression(
                    REVISION_EXPRESSION,
                    &format!(
                        "COALESCE({association}.\"revision_id\", {})",
                        column(&base, revision_key)
                    ),
                );
            format!(
                "COALESCE({}, {})",
                column(WORKSPACE_REVISION_ALIAS, DELETED_FIELD),
                column(&base, DELETED_FIELD)
            )
        };

        match deleted {
            DeletedFilter::NotDeleted => {
                select.condition(&deleted_expression, Operator::Eq, false);
            }
            DeletedFilter::DeletedOnly => {
                select.condition(&deleted_expression, Operator::Eq, true);
            }
            DeletedFilter::Any => {}
        }

        debug!(kind = %kind.id, workspace = %workspace, deleted = ?deleted, "augmented entity query");
        Ok(())
    }
}

fn find_layout(layouts: &[TableLayout], role: TableRole) -> Option<&TableLayout> {
    layouts.iter().find(|layout| layout.role == role)
}

/// Column expression for `field`, joining the per-language table when the
/// field lives there.
fn field_expression(
    select: &mut SelectQuery,
    kind: &EntityKindDescriptor,
    layouts: &[TableLayout],
    main: &TableLayout,
    data_role: TableRole,
    field: &str,
) -> Result<String> {
    if main.schema.has_column(field) {
        return Ok(column(BASE_ALIAS, field));
    }

    if let Some(data) = find_layout(layouts, data_role).filter(|data| data.schema.has_column(field)) {
        if !select.has_join(DATA_ALIAS) {
            let key = if data_role == TableRole::RevisionData {
                kind.revision_key_or_default()
            } else {
                kind.id_key.as_str()
            };
            select
                .join(
                    JoinKind::Inner,
                    &data.table,
                    DATA_ALIAS,
                    &format!("{} = {}", column(DATA_ALIAS, key), column(BASE_ALIAS, key)),
                    Vec::new(),
                )
                .distinct();
        }
        return Ok(column(DATA_ALIAS, field));
    }

    Err(anyhow!(MultiversionError::Validation(format!(
        "field {}.{field} cannot be used in a query condition",
        kind.id
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::VersionedStorage;
    use multiversion_core::{EntityRecord, FixedWorkspace};

    #[test]
    fn select_renders_joins_groups_and_params_in_order() {
        let mut select = SelectQuery::new("node", "n");
        select
            .add_expression("nid", "\"n\".\"id\"")
            .join(
                JoinKind::Left,
                "node_data",
                "d",
                "\"d\".\"id\" = \"n\".\"id\" AND \"d\".\"langcode\" = ?",
                vec![FieldValue::from("en")],
            )
            .condition("\"n\".\"type\"", Operator::Eq, "page")
            .condition_group(
                ConditionGroup::new(Conjunction::Or)
                    .compare("\"d\".\"title\"", Operator::Like, "A%")
                    .compare("\"d\".\"title\"", Operator::IsNull, FieldValue::Null),
            )
            .where_raw("\"n\".\"id\" > ?", vec![FieldValue::Integer(3)])
            .order_by("\"n\".\"id\"", SortDirection::Desc)
            .range(10, 5)
            .distinct();

        let (sql, params) = select.to_sql();
        assert_eq!(
            sql,
            "SELECT DISTINCT \"n\".\"id\" AS \"nid\" FROM \"node\" AS \"n\" \
             LEFT JOIN \"node_data\" AS \"d\" ON \"d\".\"id\" = \"n\".\"id\" AND \"d\".\"langcode\" = ? \
             WHERE \"n\".\"type\" = ? AND (\"d\".\"title\" LIKE ? OR \"d\".\"title\" IS NULL) AND (\"n\".\"id\" > ?) \
             ORDER BY \"n\".\"id\" DESC LIMIT 5 OFFSET 10"
        );
        assert_eq!(
            params,
            vec![
                FieldValue::from("en"),
                FieldValue::from("page"),
                FieldValue::from("A%"),
                FieldValue::Integer(3),
            ]
        );
        assert!(select.has_join("d"));
        assert_eq!(select.expression("nid"), Some("\"n\".\"id\""));
    }

    #[test]
    fn default_workspace_filters_on_base_workspace_and_deleted_flag() {
        let store = fixture_store();
        install(&store, &menu_link_kind());
        enable_all(&store);
        let registry = store.registry();
        let settings = store.settings();
        let active = FixedWorkspace::default_workspace();
        let augmenter = WorkspaceQueryAugmenter::new(&registry, &settings, &active);

        let (sql, params) = must(augmenter.build(&EntityQuery::new("menu_link"))).to_sql();
        assert!(sql.contains("\"base\".\"workspace\" = ?"), "{sql}");
        assert!(sql.contains("\"base\".\"_deleted\" = ?"), "{sql}");
        assert!(!sql.contains("workspace_association"), "{sql}");
        assert_eq!(params, vec![FieldValue::from("live"), FieldValue::from(false)]);
    }

    #[test]
    fn other_workspaces_join_associations_and_coalesce_revisions() {
        let store = fixture_store();
        install(&store, &menu_link_kind());
        enable_all(&store);
        let registry = store.registry();
        let settings = store.settings();
        let active = FixedWorkspace::new(Some("stage"));
        let augmenter = WorkspaceQueryAugmenter::new(&registry, &settings, &active);

        let select = must(augmenter.build(
            &EntityQuery::new("menu_link").deleted(DeletedFilter::DeletedOnly),
        ));
        let (sql, params) = select.to_sql();
        assert!(sql.contains("LEFT JOIN \"workspace_association\" AS \"association\""), "{sql}");
        assert!(sql.contains("LEFT JOIN \"menu_link_revision\" AS \"workspace_revision\""), "{sql}");
        assert!(sql.contains("(\"association\".\"workspace\" = ? OR \"base\".\"workspace\" = ?)"), "{sql}");
        assert!(sql.contains("COALESCE(\"workspace_revision\".\"_deleted\", \"base\".\"_deleted\") = ?"), "{sql}");
        assert_eq!(
            select.expression(REVISION_EXPRESSION),
            Some("COALESCE(\"association\".\"revision_id\", \"base\".\"revision_id\")")
        );
        assert_eq!(
            params,
            vec![
                FieldValue::from("menu_link"),
                FieldValue::from("stage"),
                FieldValue::from("stage"),
                FieldValue::from("live"),
                FieldValue::from(true),
            ]
        );
    }

    #[test]
    fn revision_key_conditions_skip_workspace_and_deleted_filters() {
        let store = fixture_store();
        install(&store, &menu_link_kind());
        enable_all(&store);
        must(store.create_workspace("stage", "Stage"));

        let stage = VersionedStorage::new(store.connection(), "stage");
        let mut record = EntityRecord::new("menu_link");
        record
            .fields
            .insert("link".to_string(), FieldValue::from("/draft"));
        must(stage.save(&mut record));
        must(stage.delete(&mut record));
        let revision_id = record.revision_id.unwrap_or_default();

        let registry = store.registry();
        let settings = store.settings();
        let active = FixedWorkspace::default_workspace();
        let augmenter = WorkspaceQueryAugmenter::new(&registry, &settings, &active);
        let query = EntityQuery::new("menu_link").condition("revision_id", Operator::Eq, revision_id);

        let (sql, _) = must(augmenter.build(&query)).to_sql();
        assert!(sql.contains("FROM \"menu_link_revision\" AS \"base\""), "{sql}");
        assert!(!sql.contains("_deleted"), "{sql}");
        let hits = must(augmenter.execute(store.connection(), &query));
        assert_eq!(hits, vec![(revision_id, record.id.unwrap_or_default())]);
        assert!(must(augmenter.execute(store.connection(), &EntityQuery::new("menu_link"))).is_empty());
    }

    #[test]
    fn legacy_kinds_are_queried_unaugmented() {
        let store = fixture_store();
        install(&store, &article_kind());
        seed_articles(&store, 3);
        let registry = store.registry();
        let settings = store.settings();
        let active = FixedWorkspace::new(Some("stage"));
        let augmenter = WorkspaceQueryAugmenter::new(&registry, &settings, &active);

        let query = EntityQuery::new("article")
            .condition("title", Operator::Like, "Article %")
            .sort_by("id", SortDirection::Desc)
            .range(0, 2);
        let (sql, _) = must(augmenter.build(&query)).to_sql();
        assert!(!sql.contains("workspace"), "{sql}");
        assert!(sql.contains("INNER JOIN \"article_field_data\" AS \"data\""), "{sql}");
        assert_eq!(must(augmenter.execute(store.connection(), &query)), vec![(3, 3), (2, 2)]);
    }

    #[test]
    fn unknown_fields_and_kinds_are_rejected() {
        let store = fixture_store();
        install(&store, &menu_link_kind());
        let registry = store.registry();
        let settings = store.settings();
        let active = FixedWorkspace::default_workspace();
        let augmenter = WorkspaceQueryAugmenter::new(&registry, &settings, &active);

        assert!(augmenter
            .build(&EntityQuery::new("menu_link").condition("missing", Operator::Eq, 1_i64))
            .is_err());
        assert!(augmenter.build(&EntityQuery::new("nope")).is_err());
    }
}
