//! Synchronization entry point.
//!
//! [`sync_tables`] validates the invocation context, checks the server
//! version once, then creates or alters every table definition in order.
//! The column cache of every touched table is invalidated in one batch at
//! the end of the run.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::apply::{apply_table_plan, create_table};
use crate::cache::{invalidate_tables, CacheInvalidator};
use crate::dialect::{DialectKind, SyncDialect};
use crate::error::{Result, SyncError};
use crate::executor::{DryRun, SqlExecutor};
use crate::field::{normalize, validate_fields, FieldDefinition, FieldInput};
use crate::introspect::{ensure_db_version, table_exists};
use crate::plan::plan_table;

/// Item kind consumed by the synchronizer.
pub const TABLE_KIND: &str = "table";

/// Database part of the invocation config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbConfig {
    /// Dialect name: `mysql`, `postgres` or `sqlite`.
    #[serde(default)]
    pub dialect: Option<String>,
    /// Database (catalog) name. Required for the server dialects.
    #[serde(default)]
    pub database: Option<String>,
}

/// Invocation config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Database settings.
    #[serde(default)]
    pub db: Option<DbConfig>,
}

impl SyncConfig {
    /// Config for `dialect` and `database`.
    #[must_use]
    pub fn new(dialect: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            db: Some(DbConfig {
                dialect: Some(dialect.into()),
                database: Some(database.into()),
            }),
        }
    }
}

/// Collaborators handed in by the caller. The engine never owns them.
pub struct SyncContext<'a, E, C> {
    /// SQL executor.
    pub db: &'a E,
    /// Cache to invalidate after the run.
    pub cache: &'a C,
    /// Invocation config.
    pub config: &'a SyncConfig,
}

impl<'a, E, C> SyncContext<'a, E, C> {
    /// Bundles the collaborators of one run.
    pub fn new(db: &'a E, cache: &'a C, config: &'a SyncConfig) -> Self {
        Self { db, cache, config }
    }
}

/// Where a table definition comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    /// Application tables.
    App,
    /// Addon tables, namespaced by addon name.
    Addon,
    /// Built-in tables.
    Core,
}

impl FromStr for SyncSource {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "app" => Ok(Self::App),
            "addon" => Ok(Self::Addon),
            "core" => Ok(Self::Core),
            _ => Err(()),
        }
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::App => "app",
            Self::Addon => "addon",
            Self::Core => "core",
        })
    }
}

/// One loaded definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    /// Item kind; only `table` items are synchronized.
    #[serde(rename = "type")]
    pub kind: String,
    /// Source tag: `app`, `addon` or `core`.
    pub source: String,
    /// File name without extension.
    pub file_name: String,
    /// Addon name, required for addon items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addon_name: Option<String>,
    /// Field key to field definition, in column order.
    #[serde(default)]
    pub content: IndexMap<String, FieldInput>,
}

impl SyncItem {
    /// A table item from `source`.
    #[must_use]
    pub fn table(
        source: SyncSource,
        file_name: impl Into<String>,
        content: IndexMap<String, FieldInput>,
    ) -> Self {
        Self {
            kind: TABLE_KIND.to_string(),
            source: source.to_string(),
            file_name: file_name.into(),
            addon_name: None,
            content,
        }
    }

    /// Sets the addon name.
    #[must_use]
    pub fn with_addon(mut self, addon: impl Into<String>) -> Self {
        self.addon_name = Some(addon.into());
        self
    }

    /// Normalized fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> Vec<(String, FieldDefinition)> {
        self.content
            .iter()
            .map(|(key, input)| (key.clone(), normalize(input)))
            .collect()
    }
}

/// Converts `camelCase`, `PascalCase`, `kebab-case` and spaced names to
/// `snake_case`.
#[must_use]
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let boundary = i > 0 && {
                let prev = chars[i - 1];
                let next_lower = chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
                prev.is_ascii_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_ascii_uppercase() && next_lower)
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Resolves the physical table name of a table item.
pub fn resolve_table_name(item: &SyncItem) -> Result<String> {
    let source: SyncSource = item.source.parse().map_err(|()| SyncError::UnknownSource {
        source_tag: item.source.clone(),
        file_name: item.file_name.clone(),
    })?;
    match source {
        SyncSource::App | SyncSource::Core => Ok(snake_case(&item.file_name)),
        SyncSource::Addon => {
            let addon = item
                .addon_name
                .as_deref()
                .filter(|name| !name.trim().is_empty())
                .ok_or_else(|| SyncError::MissingAddonName(item.file_name.clone()))?;
            Ok(format!(
                "addon_{}_{}",
                snake_case(addon),
                snake_case(&item.file_name)
            ))
        }
    }
}

/// Per-run state: the adapter, the executor and the target database.
pub struct SyncRuntime<'a, E> {
    /// Active dialect.
    pub dialect: &'a dyn SyncDialect,
    /// SQL executor.
    pub executor: &'a E,
    /// Database (catalog) name.
    pub database: String,
}

impl<'a, E: SqlExecutor> SyncRuntime<'a, E> {
    /// Creates a runtime.
    pub fn new(dialect: &'a dyn SyncDialect, executor: &'a E, database: impl Into<String>) -> Self {
        Self {
            dialect,
            executor,
            database: database.into(),
        }
    }

    /// Validates `config` and builds the runtime for it.
    pub fn from_config(config: &SyncConfig, executor: &'a E) -> Result<Self> {
        let db = config.db.as_ref().ok_or(SyncError::MissingContext("config.db"))?;
        let kind: DialectKind = db
            .dialect
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .ok_or(SyncError::MissingContext("config.db.dialect"))?
            .parse()?;
        let database = match (kind, db.database.as_deref()) {
            (_, Some(name)) if !name.trim().is_empty() => name.to_string(),
            (DialectKind::Sqlite, _) => "main".to_string(),
            _ => return Err(SyncError::MissingContext("config.db.database")),
        };
        Ok(Self::new(kind.dialect(), executor, database))
    }
}

/// What happened to one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOutcome {
    /// The table did not exist and was created.
    Created,
    /// The table existed and was altered.
    Modified,
    /// The table already matched its definition.
    Unchanged,
}

/// Summary of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Newly created tables.
    pub created: Vec<String>,
    /// Altered tables.
    pub modified: Vec<String>,
    /// Tables already in sync.
    pub unchanged: Vec<String>,
    /// Cache entries removed.
    pub invalidated: usize,
}

impl SyncReport {
    /// Tables created or altered, in processing order.
    #[must_use]
    pub fn touched(&self) -> Vec<String> {
        self.created.iter().chain(&self.modified).cloned().collect()
    }

    fn record(&mut self, table: String, outcome: TableOutcome) {
        match outcome {
            TableOutcome::Created => self.created.push(table),
            TableOutcome::Modified => self.modified.push(table),
            TableOutcome::Unchanged => self.unchanged.push(table),
        }
    }
}

/// Logs a failed schema change and attaches `table` to driver errors.
fn execution_context(table: &str) -> impl FnOnce(SyncError) -> SyncError + '_ {
    move |err| {
        error!(table = %table, error = %err, "Schema change failed");
        match err {
            SyncError::Database(source) => SyncError::Execution {
                table: table.to_string(),
                message: source.to_string(),
            },
            SyncError::Execution { message, .. } => SyncError::Execution {
                table: table.to_string(),
                message,
            },
            other => other,
        }
    }
}

/// Creates or alters one table.
///
/// Statement failures surface as [`SyncError::Execution`] naming the table.
pub async fn sync_table<E: SqlExecutor>(
    runtime: &SyncRuntime<'_, E>,
    table: &str,
    fields: &[(String, FieldDefinition)],
) -> Result<TableOutcome> {
    if !table_exists(runtime, table).await? {
        create_table(runtime, table, fields)
            .await
            .map_err(execution_context(table))?;
        info!(table = %table, columns = fields.len(), "Created table");
        return Ok(TableOutcome::Created);
    }

    let plan = plan_table(runtime, table, fields).await?;
    if !plan.changed {
        debug!(table = %table, "Table is up to date");
        return Ok(TableOutcome::Unchanged);
    }
    apply_table_plan(runtime, &plan, fields)
        .await
        .map_err(execution_context(table))?;
    info!(
        table = %table,
        adds = plan.add_clauses.len(),
        modifies = plan.modify_clauses.len(),
        defaults = plan.default_clauses.len(),
        indexes = plan.index_actions.len(),
        rebuild = plan.rebuild,
        "Modified table"
    );
    Ok(TableOutcome::Modified)
}

/// Synchronizes every table item against the database in `ctx`.
///
/// Tables run strictly one after another; the first error aborts the run.
pub async fn sync_tables<E: SqlExecutor, C: CacheInvalidator>(
    ctx: &SyncContext<'_, E, C>,
    items: &[SyncItem],
) -> Result<SyncReport> {
    let runtime = SyncRuntime::from_config(ctx.config, ctx.db)?;

    let mut tables = Vec::new();
    for item in items {
        if item.kind != TABLE_KIND {
            debug!(kind = %item.kind, file = %item.file_name, "Skipping non-table item");
            continue;
        }
        let table = resolve_table_name(item)?;
        runtime.dialect.quote_identifier(&table)?;
        let fields = item.fields();
        for (key, _) in &fields {
            runtime.dialect.quote_identifier(key)?;
        }
        validate_fields(&table, &fields)?;
        tables.push((table, fields));
    }

    ensure_db_version(&runtime).await?;

    let mut report = SyncReport::default();
    for (table, fields) in tables {
        let outcome = sync_table(&runtime, &table, &fields).await?;
        report.record(table, outcome);
    }

    report.invalidated = invalidate_tables(ctx.cache, &report.touched()).await?;
    info!(
        created = report.created.len(),
        modified = report.modified.len(),
        unchanged = report.unchanged.len(),
        "Schema sync finished"
    );
    Ok(report)
}

/// Runs [`sync_tables`] without executing any DDL and returns the statements
/// that would have run. The cache is left untouched.
pub async fn sync_tables_dry_run<E: SqlExecutor, C: CacheInvalidator>(
    ctx: &SyncContext<'_, E, C>,
    items: &[SyncItem],
) -> Result<(SyncReport, Vec<String>)> {
    let dry = DryRun::new(ctx.db);
    let report = {
        let dry_ctx = SyncContext::new(&dry, &crate::cache::NoopCache, ctx.config);
        sync_tables(&dry_ctx, items).await?
    };
    Ok((report, dry.statements()))
}
