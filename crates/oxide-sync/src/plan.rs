//! Diffing declared fields against live columns.
//!
//! [`build_table_plan`] is a pure function over the introspected state, so it
//! can be tested without a database. [`plan_table`] reads that state first.

use std::fmt;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::dialect::{system_comment, IndexAction, SyncDialect};
use crate::error::{Result, SyncError};
use crate::executor::SqlExecutor;
use crate::field::{validate_fields, FieldDefinition, SYSTEM_FIELDS, SYSTEM_INDEX_FIELDS};
use crate::introspect::{table_columns, table_indexes, ColumnInfo, IndexInfo};
use crate::sync::SyncRuntime;

static TYPE_CAST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)::[a-z_][a-z0-9_ ]*(?:\(\d+(?:,\s*\d+)?\))?(?:\[\])?$")
        .expect("cast pattern is valid")
});

/// Axis on which a live column differs from its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Character length.
    Length,
    /// Column comment.
    Comment,
    /// Base data type.
    Datatype,
    /// NULL / NOT NULL.
    Nullable,
    /// Default value.
    Default,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Length => "length",
            Self::Comment => "comment",
            Self::Datatype => "datatype",
            Self::Nullable => "nullable",
            Self::Default => "default",
        })
    }
}

/// One difference between a live column and its definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    /// Axis of the change.
    pub kind: ChangeKind,
    /// Live value.
    pub current: String,
    /// Declared value.
    pub expected: String,
}

impl FieldChange {
    fn new(kind: ChangeKind, current: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            kind,
            current: current.into(),
            expected: expected.into(),
        }
    }
}

/// A single index create or drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStep {
    /// Create or drop.
    pub action: IndexAction,
    /// Index name.
    pub index_name: String,
    /// Indexed column.
    pub field: String,
}

/// Everything needed to bring one existing table in line with its
/// definition. Built and consumed within the same run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TablePlan {
    /// Table name.
    pub table: String,
    /// Whether anything needs to be applied.
    pub changed: bool,
    /// `ADD COLUMN` clauses.
    pub add_clauses: Vec<String>,
    /// Clauses rewriting existing columns.
    pub modify_clauses: Vec<String>,
    /// `SET DEFAULT` / `DROP DEFAULT` clauses for default-only changes.
    pub default_clauses: Vec<String>,
    /// Index creates and drops.
    pub index_actions: Vec<IndexStep>,
    /// Standalone comment statements.
    pub comment_actions: Vec<String>,
    /// Whether the table must be rebuilt instead of altered.
    pub rebuild: bool,
    /// Detected changes per field.
    pub changes: IndexMap<String, Vec<FieldChange>>,
}

impl TablePlan {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Self::default()
        }
    }

    fn finish(mut self) -> Self {
        self.changed = self.rebuild
            || !self.add_clauses.is_empty()
            || !self.modify_clauses.is_empty()
            || !self.default_clauses.is_empty()
            || !self.index_actions.is_empty()
            || !self.comment_actions.is_empty();
        self
    }
}

const INTEGER_RANKS: [(&str, u8); 6] = [
    ("tinyint", 1),
    ("smallint", 2),
    ("mediumint", 3),
    ("int", 4),
    ("integer", 4),
    ("bigint", 5),
];

const TEXT_RANKS: [(&str, u8); 8] = [
    ("char", 1),
    ("character", 1),
    ("varchar", 1),
    ("character varying", 1),
    ("tinytext", 1),
    ("text", 2),
    ("mediumtext", 3),
    ("longtext", 4),
];

fn rank(ranks: &[(&str, u8)], ty: &str) -> Option<u8> {
    ranks.iter().find(|(name, _)| *name == ty).map(|(_, r)| *r)
}

/// Reduces a catalog type to its comparable base form: lower case, without
/// length, precision or signedness.
#[must_use]
pub fn canonical_type(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let base = match lower.find('(') {
        Some(i) => &lower[..i],
        None => lower.as_str(),
    };
    let base = base.trim().trim_end_matches("unsigned").trim();
    match base {
        "integer" => "int".to_string(),
        other => other.to_string(),
    }
}

/// Whether moving a column from `current` to `expected` never loses data.
/// Only integer-size and text-width escalations qualify.
#[must_use]
pub fn is_compatible_type_change(current: &str, expected: &str) -> bool {
    let current = canonical_type(current);
    let expected = canonical_type(expected);
    if current == expected {
        return true;
    }
    for ranks in [&INTEGER_RANKS[..], &TEXT_RANKS[..]] {
        if let (Some(from), Some(to)) = (rank(ranks, &current), rank(ranks, &expected)) {
            return to > from;
        }
    }
    false
}

/// Normalizes a catalog default for comparison: drops a trailing `::type`
/// cast and surrounding quotes, and unescapes doubled quotes.
#[must_use]
pub fn normalize_live_default(raw: Option<&str>) -> Option<String> {
    let uncast = TYPE_CAST.replace(raw?.trim(), "");
    let value = uncast.trim();
    if value.eq_ignore_ascii_case("null") {
        return None;
    }
    let unquoted = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .map_or_else(|| value.to_string(), |inner| inner.replace("''", "'"));
    Some(unquoted)
}

/// Lists every difference between a declared field and its live column.
#[must_use]
pub fn compare_field_with_column(
    dialect: &dyn SyncDialect,
    field: &FieldDefinition,
    column: &ColumnInfo,
) -> Vec<FieldChange> {
    let caps = dialect.capabilities();
    let mut changes = Vec::new();

    if caps.length_diff && field.field_type.is_sized() && column.max != Some(field.max) {
        changes.push(FieldChange::new(
            ChangeKind::Length,
            column.max.map_or_else(|| "none".to_string(), |m| m.to_string()),
            field.max.to_string(),
        ));
    }

    if caps.comment_diff {
        let current = column.comment.as_deref().unwrap_or_default();
        if current != field.name {
            changes.push(FieldChange::new(ChangeKind::Comment, current, field.name.as_str()));
        }
    }

    let expected_type = dialect.expected_data_type(field.field_type);
    if canonical_type(&column.data_type) != canonical_type(expected_type) {
        changes.push(FieldChange::new(
            ChangeKind::Datatype,
            column.data_type.as_str(),
            expected_type,
        ));
    }

    if column.nullable != field.nullable {
        changes.push(FieldChange::new(
            ChangeKind::Nullable,
            column.nullable.to_string(),
            field.nullable.to_string(),
        ));
    }

    let resolved = field.resolved_default();
    let live = normalize_live_default(column.default_value.as_deref());
    if live != resolved.comparable() {
        changes.push(FieldChange::new(
            ChangeKind::Default,
            live.unwrap_or_else(|| "no default".to_string()),
            resolved.to_string(),
        ));
    }

    changes
}

fn is_shrink(change: &FieldChange) -> Option<i64> {
    let current = change.current.parse::<i64>().ok()?;
    let expected = change.expected.parse::<i64>().ok()?;
    (expected < current).then_some(current)
}

/// Builds the plan for an existing table from its live columns and
/// single-column indexes.
///
/// Fails with [`SyncError::IncompatibleTypeChange`] when a field would have
/// its type narrowed or moved to another family.
pub fn build_table_plan(
    dialect: &dyn SyncDialect,
    table: &str,
    fields: &[(String, FieldDefinition)],
    columns: &IndexMap<String, ColumnInfo>,
    indexes: &IndexInfo,
) -> Result<TablePlan> {
    validate_fields(table, fields)?;
    let caps = dialect.capabilities();
    let separate_comments = caps.comment_diff && !caps.inline_comments;
    let mut plan = TablePlan::new(table);

    for column in SYSTEM_FIELDS.iter().filter(|c| **c != "id") {
        if columns.contains_key(*column) {
            continue;
        }
        plan.add_clauses.push(dialect.add_system_column_clause(column)?);
        if separate_comments {
            plan.comment_actions
                .extend(dialect.comment_sql(table, column, system_comment(column))?);
        }
    }

    for (key, field) in fields {
        let Some(column) = columns.get(key) else {
            plan.add_clauses.push(dialect.add_column_clause(key, field)?);
            if !dialect.can_add_in_place(field) {
                plan.rebuild = true;
            }
            if separate_comments {
                plan.comment_actions
                    .extend(dialect.comment_sql(table, key, &field.name)?);
            }
            continue;
        };

        let changes = compare_field_with_column(dialect, field, column);
        if changes.is_empty() {
            continue;
        }

        let mut effective = field.clone();
        let mut structural = Vec::new();
        let mut default_changed = false;
        for change in &changes {
            match change.kind {
                ChangeKind::Datatype => {
                    if !is_compatible_type_change(&change.current, &change.expected) {
                        return Err(SyncError::IncompatibleTypeChange {
                            table: table.to_string(),
                            field: key.clone(),
                            current: change.current.clone(),
                            expected: change.expected.clone(),
                        });
                    }
                    structural.push(change.clone());
                }
                ChangeKind::Length => {
                    if let Some(current) = is_shrink(change) {
                        warn!(
                            table = %table,
                            field = %key,
                            current = %change.current,
                            expected = %change.expected,
                            "Refusing to shrink column length"
                        );
                        effective.max = current;
                    } else {
                        structural.push(change.clone());
                    }
                }
                ChangeKind::Comment if separate_comments => {
                    plan.comment_actions
                        .extend(dialect.comment_sql(table, key, &field.name)?);
                }
                ChangeKind::Comment | ChangeKind::Nullable => structural.push(change.clone()),
                ChangeKind::Default => default_changed = true,
            }
        }

        if caps.rebuild_on_modify {
            plan.rebuild |= !structural.is_empty() || default_changed;
        } else if !structural.is_empty() {
            if default_changed {
                structural.extend(changes.iter().filter(|c| c.kind == ChangeKind::Default).cloned());
            }
            plan.modify_clauses
                .extend(dialect.modify_column_clauses(key, &effective, &structural)?);
        } else if default_changed {
            plan.default_clauses.push(dialect.default_clause(key, field)?);
        }

        plan.changes.insert(key.clone(), changes);
    }

    let wanted = SYSTEM_INDEX_FIELDS
        .iter()
        .map(|f| (f.to_string(), true))
        .chain(fields.iter().map(|(key, f)| (key.clone(), f.index && !f.unique)));
    for (field, want) in wanted {
        let index_name = dialect.index_name(table, &field);
        let exists = indexes
            .get(&index_name)
            .is_some_and(|cols| cols.len() == 1 && cols[0] == field);
        let action = match (want, exists) {
            (true, false) => IndexAction::Create,
            (false, true) => IndexAction::Drop,
            _ => continue,
        };
        plan.index_actions.push(IndexStep {
            action,
            index_name,
            field,
        });
    }

    let plan = plan.finish();
    debug!(
        table = %table,
        changed = plan.changed,
        rebuild = plan.rebuild,
        adds = plan.add_clauses.len(),
        modifies = plan.modify_clauses.len(),
        indexes = plan.index_actions.len(),
        "Planned table"
    );
    Ok(plan)
}

/// Reads the live state of `table` and plans its changes.
pub async fn plan_table<E: SqlExecutor>(
    runtime: &SyncRuntime<'_, E>,
    table: &str,
    fields: &[(String, FieldDefinition)],
) -> Result<TablePlan> {
    let columns = table_columns(runtime, table).await?;
    let indexes = table_indexes(runtime, table).await?;
    build_table_plan(runtime.dialect, table, fields, &columns, &indexes)
}
