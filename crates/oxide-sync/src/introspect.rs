//! Read-only introspection of the live schema.
//!
//! Every query is built by the active dialect. Rows come back through the
//! [`SqlExecutor`] as JSON maps with the column labels the dialects agree on,
//! so the parsing here is shared.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::executor::{Row, SqlExecutor};
use crate::sync::SyncRuntime;

/// Metadata of one live column. Never cached, read fresh on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Base data type, lower case (`varchar`, `bigint`, `character varying`).
    pub data_type: String,
    /// Full column type (`varchar(100)`, `bigint unsigned`).
    pub column_type: String,
    /// Character length limit, if the catalog reports one.
    pub max: Option<i64>,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Default expression as reported by the catalog.
    pub default_value: Option<String>,
    /// Column comment.
    pub comment: Option<String>,
}

/// Index name to its ordered column list.
pub type IndexInfo = IndexMap<String, Vec<String>>;

pub(crate) fn row_str(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn row_i64(row: &Row, key: &str) -> Option<i64> {
    match row.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok())),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_column(row: &Row) -> Option<(String, ColumnInfo)> {
    let name = row_str(row, "column_name")?;
    let data_type = row_str(row, "data_type").unwrap_or_default().to_lowercase();
    let column_type = row_str(row, "column_type")
        .map_or_else(|| data_type.clone(), |t| t.to_lowercase());
    let nullable = row_str(row, "is_nullable").is_some_and(|v| v.eq_ignore_ascii_case("YES"));
    let comment = row_str(row, "column_comment").filter(|c| !c.is_empty());

    Some((
        name,
        ColumnInfo {
            data_type,
            column_type,
            max: row_i64(row, "max_length"),
            nullable,
            default_value: row_str(row, "column_default"),
            comment,
        },
    ))
}

/// Returns whether `table` exists in the target database.
pub async fn table_exists<E: SqlExecutor>(runtime: &SyncRuntime<'_, E>, table: &str) -> Result<bool> {
    let query = runtime
        .dialect
        .table_exists_query(&runtime.database, table);
    let rows = runtime.executor.execute(&query.sql, &query.params).await?;
    Ok(rows
        .first()
        .and_then(|row| row_i64(row, "count"))
        .is_some_and(|count| count > 0))
}

/// Reads the live columns of `table`, in table order.
pub async fn table_columns<E: SqlExecutor>(
    runtime: &SyncRuntime<'_, E>,
    table: &str,
) -> Result<IndexMap<String, ColumnInfo>> {
    let query = runtime.dialect.columns_query(&runtime.database, table);
    let rows = runtime.executor.execute(&query.sql, &query.params).await?;
    let mut columns: IndexMap<String, ColumnInfo> = rows.iter().filter_map(parse_column).collect();

    // Postgres keeps comments outside information_schema.
    if let Some(query) = runtime
        .dialect
        .column_comments_query(&runtime.database, table)
    {
        let rows = runtime.executor.execute(&query.sql, &query.params).await?;
        for row in &rows {
            let (Some(name), comment) = (row_str(row, "column_name"), row_str(row, "column_comment"))
            else {
                continue;
            };
            if let Some(column) = columns.get_mut(&name) {
                column.comment = comment.filter(|c| !c.is_empty());
            }
        }
    }

    debug!(table = %table, columns = columns.len(), "Read live columns");
    Ok(columns)
}

/// Reads every secondary index of `table`, including multi-column ones.
pub async fn all_table_indexes<E: SqlExecutor>(
    runtime: &SyncRuntime<'_, E>,
    table: &str,
) -> Result<IndexInfo> {
    let query = runtime.dialect.indexes_query(&runtime.database, table);
    let rows = runtime.executor.execute(&query.sql, &query.params).await?;
    let mut indexes = IndexInfo::new();
    for row in &rows {
        let (Some(index), Some(column)) = (row_str(row, "index_name"), row_str(row, "column_name"))
        else {
            continue;
        };
        indexes.entry(index).or_default().push(column);
    }
    Ok(indexes)
}

/// Reads the single-column indexes of `table`. Multi-column indexes are
/// dropped from the result and therefore never managed.
pub async fn table_indexes<E: SqlExecutor>(
    runtime: &SyncRuntime<'_, E>,
    table: &str,
) -> Result<IndexInfo> {
    let mut indexes = all_table_indexes(runtime, table).await?;
    indexes.retain(|_, columns| columns.len() == 1);
    Ok(indexes)
}

/// Fails unless the server meets the dialect's minimum version.
pub async fn ensure_db_version<E: SqlExecutor>(runtime: &SyncRuntime<'_, E>) -> Result<()> {
    let dialect = runtime.dialect;
    let rows = runtime
        .executor
        .execute(dialect.version_query(), &[])
        .await?;
    let raw = rows
        .first()
        .and_then(|row| row_str(row, "version"))
        .ok_or_else(|| SyncError::UnparsableVersion {
            dialect: dialect.name(),
            raw: String::new(),
        })?;
    dialect.check_version(&raw)?;
    info!(dialect = dialect.name(), version = %raw, "Database version supported");
    Ok(())
}
