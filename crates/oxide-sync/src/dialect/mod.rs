//! Database dialect implementations.
//!
//! Each dialect knows how to quote identifiers, map logical field types to
//! native column types, render DDL and query its own catalog. The planner and
//! the apply engine only ever talk to a `&dyn SyncDialect`.

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::executor::SqlExecutor;
use crate::field::{FieldDefinition, FieldType, ResolvedDefault, SYSTEM_FIELDS};
use crate::plan::{ChangeKind, FieldChange};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

static ALGORITHM_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*\b(?:ALGORITHM|LOCK)\s*=\s*\w+\s*,").expect("hint pattern is valid")
});

static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("version pattern is valid")
});

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialectKind {
    /// MySQL 8+.
    MySql,
    /// PostgreSQL 17+.
    Postgres,
    /// SQLite 3.50+.
    Sqlite,
}

impl DialectKind {
    /// Returns the canonical dialect name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    /// Returns the adapter for this dialect.
    #[must_use]
    pub fn dialect(self) -> &'static dyn SyncDialect {
        static MYSQL: MySqlDialect = MySqlDialect;
        static POSTGRES: PostgresDialect = PostgresDialect;
        static SQLITE: SqliteDialect = SqliteDialect;
        match self {
            Self::MySql => &MYSQL,
            Self::Postgres => &POSTGRES,
            Self::Sqlite => &SQLITE,
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DialectKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            _ => Err(SyncError::UnknownDialect(s.to_string())),
        }
    }
}

/// What a dialect can and cannot do, consulted by the planner instead of
/// branching on the dialect name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectCapabilities {
    /// Column length metadata is reliable enough to diff.
    pub length_diff: bool,
    /// Columns carry comments that can be diffed.
    pub comment_diff: bool,
    /// Comments are part of the column definition.
    pub inline_comments: bool,
    /// Column changes require rebuilding the table.
    pub rebuild_on_modify: bool,
    /// Failed ALTER statements are retried with weaker algorithm hints.
    pub algorithm_ladder: bool,
    /// Every DDL statement is written with IF [NOT] EXISTS.
    pub guarded_ddl: bool,
}

/// Whether an index is being created or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexAction {
    /// CREATE / ADD INDEX.
    Create,
    /// DROP INDEX.
    Drop,
}

impl fmt::Display for IndexAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Drop => "drop",
        })
    }
}

/// A statement plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// SQL text.
    pub sql: String,
    /// Positional parameters.
    pub params: Vec<Value>,
}

impl Query {
    pub(crate) fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Validates `name` and wraps it in the given quote character.
pub(crate) fn quote_with(name: &str, quote: char) -> Result<String> {
    if !IDENTIFIER.is_match(name) {
        return Err(SyncError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("{quote}{name}{quote}"))
}

/// Longest identifier every supported engine stores unchanged.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Shortens `name` to [`MAX_IDENTIFIER_LEN`] bytes. Long names keep a prefix
/// and end with eight hex digits of their SHA-256, so the result stays
/// stable across runs.
pub(crate) fn bounded_identifier(name: String) -> String {
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name;
    }
    let digest = Sha256::digest(name.as_bytes());
    let suffix = digest[..4].iter().fold(String::new(), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    });
    let mut cut = MAX_IDENTIFIER_LEN - suffix.len() - 1;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{suffix}", name[..cut].trim_end_matches('_'))
}

/// Escapes a string for use inside single quotes.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Comment attached to each system column.
pub(crate) fn system_comment(column: &str) -> &'static str {
    match column {
        "id" => "Primary key",
        "created_at" => "Created at",
        "updated_at" => "Updated at",
        "deleted_at" => "Deleted at",
        "state" => "State",
        _ => "",
    }
}

/// Extracts `(major, minor, patch)` from a free-form version string.
pub(crate) fn parse_version(raw: &str) -> Option<(u64, u64, u64)> {
    let caps = VERSION.captures(raw)?;
    let part = |i: usize| {
        caps.get(i)
            .map_or(Some(0), |m| m.as_str().parse::<u64>().ok())
    };
    Some((part(1)?, part(2)?, part(3)?))
}

pub(crate) fn require_version(
    dialect: &'static str,
    raw: &str,
    minimum: (u64, u64, u64),
    required: &'static str,
) -> Result<()> {
    let found = parse_version(raw).ok_or_else(|| SyncError::UnparsableVersion {
        dialect,
        raw: raw.to_string(),
    })?;
    if found < minimum {
        return Err(SyncError::UnsupportedVersion {
            dialect,
            found: raw.to_string(),
            required,
        });
    }
    Ok(())
}

/// Removes every `ALGORITHM=...` and `LOCK=...` hint from a MySQL statement.
pub(crate) fn strip_algorithm_hints(sql: &str) -> String {
    ALGORITHM_HINT.replace_all(sql, "").into_owned()
}

/// Per-dialect SQL generation and catalog access.
pub trait SyncDialect: Send + Sync {
    /// Returns the dialect tag.
    fn kind(&self) -> DialectKind;

    /// Returns the dialect name.
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Returns the capability flags.
    fn capabilities(&self) -> DialectCapabilities;

    /// Validates and quotes an identifier.
    fn quote_identifier(&self, name: &str) -> Result<String>;

    /// Maps a logical type to the native column type.
    fn sql_type(&self, field_type: FieldType, max: i64, unsigned: bool) -> String;

    /// Base data type the catalog reports for a logical type, lower case.
    fn expected_data_type(&self, field_type: FieldType) -> &'static str;

    /// Full definition of a system column.
    fn system_column_definition(&self, column: &str) -> Result<String>;

    /// Suffix appended after the closing parenthesis of CREATE TABLE.
    fn table_options(&self) -> &'static str {
        ""
    }

    /// Column definition without UNIQUE, as used by MODIFY.
    fn column_definition(&self, column: &str, field: &FieldDefinition) -> Result<String>;

    /// Column definition for CREATE TABLE and ADD COLUMN.
    fn new_column_definition(&self, column: &str, field: &FieldDefinition) -> Result<String> {
        let mut sql = self.column_definition(column, field)?;
        if field.unique {
            sql.push_str(" UNIQUE");
        }
        Ok(sql)
    }

    /// System columns followed by the business columns.
    fn table_column_definitions(&self, fields: &[(String, FieldDefinition)]) -> Result<Vec<String>> {
        let mut columns = SYSTEM_FIELDS
            .iter()
            .map(|c| self.system_column_definition(c))
            .collect::<Result<Vec<_>>>()?;
        for (column, field) in fields {
            columns.push(self.new_column_definition(column, field)?);
        }
        Ok(columns)
    }

    /// Renders the full CREATE TABLE statement.
    fn create_table_sql(&self, table: &str, fields: &[(String, FieldDefinition)]) -> Result<String> {
        let columns = self.table_column_definitions(fields)?;
        self.create_table_from_columns(table, &columns)
    }

    /// Renders CREATE TABLE from already rendered column definitions.
    fn create_table_from_columns(&self, table: &str, columns: &[String]) -> Result<String> {
        let guard = if self.capabilities().guarded_ddl {
            "IF NOT EXISTS "
        } else {
            ""
        };
        Ok(format!(
            "CREATE TABLE {guard}{} (\n  {}\n){}",
            self.quote_identifier(table)?,
            columns.join(",\n  "),
            self.table_options()
        ))
    }

    /// `ADD COLUMN ...` clause.
    fn add_column_clause(&self, column: &str, field: &FieldDefinition) -> Result<String> {
        Ok(format!(
            "ADD COLUMN {}",
            self.new_column_definition(column, field)?
        ))
    }

    /// `ADD COLUMN ...` clause retrofitting a system column.
    fn add_system_column_clause(&self, column: &str) -> Result<String> {
        Ok(format!("ADD COLUMN {}", self.system_column_definition(column)?))
    }

    /// Whether `field` can be added with a plain ALTER TABLE ADD COLUMN.
    fn can_add_in_place(&self, _field: &FieldDefinition) -> bool {
        true
    }

    /// Clauses rewriting an existing column to match `field`.
    fn modify_column_clauses(
        &self,
        column: &str,
        field: &FieldDefinition,
        changes: &[FieldChange],
    ) -> Result<Vec<String>>;

    /// `ALTER COLUMN ... SET DEFAULT` / `DROP DEFAULT` clause.
    fn default_clause(&self, column: &str, field: &FieldDefinition) -> Result<String> {
        let column = self.quote_identifier(column)?;
        Ok(match field.resolved_default().to_sql() {
            Some(literal) => format!("ALTER COLUMN {column} SET DEFAULT {literal}"),
            None => format!("ALTER COLUMN {column} DROP DEFAULT"),
        })
    }

    /// Joins clauses into one ALTER TABLE statement.
    fn alter_table_sql(&self, table: &str, clauses: &[String]) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} {}",
            self.quote_identifier(table)?,
            clauses.join(", ")
        ))
    }

    /// Standalone comment statement, for dialects without inline comments.
    fn comment_sql(&self, _table: &str, _column: &str, _comment: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Name of the single-column index managed for `field`, at most
    /// [`MAX_IDENTIFIER_LEN`] bytes long.
    fn index_name(&self, table: &str, field: &str) -> String;

    /// Renders an index create or drop statement.
    fn build_index_sql(
        &self,
        table: &str,
        index_name: &str,
        field: &str,
        action: IndexAction,
    ) -> Result<String>;

    /// Query returning one row with a `count` column.
    fn table_exists_query(&self, database: &str, table: &str) -> Query;

    /// Query returning one row per column, with the columns `column_name`,
    /// `data_type`, `column_type`, `max_length`, `is_nullable`,
    /// `column_default` and `column_comment`.
    fn columns_query(&self, database: &str, table: &str) -> Query;

    /// Extra query returning `column_name` / `column_comment` pairs.
    fn column_comments_query(&self, _database: &str, _table: &str) -> Option<Query> {
        None
    }

    /// Query returning `index_name` / `column_name` rows ordered by index
    /// name and column position.
    fn indexes_query(&self, database: &str, table: &str) -> Query;

    /// Query returning the `sql` text of every explicitly created index, used
    /// to restore indexes after a table rebuild.
    fn index_definitions_query(&self, _table: &str) -> Option<Query> {
        None
    }

    /// Query returning one row with a `version` column.
    fn version_query(&self) -> &'static str;

    /// Fails when `raw` is below the supported minimum.
    fn check_version(&self, raw: &str) -> Result<()>;
}

/// Column type/null/default fragment shared by the server dialects.
pub(crate) fn null_and_default(field: &FieldDefinition) -> String {
    let null = if field.nullable { " NULL" } else { " NOT NULL" };
    let default = match field.resolved_default().to_sql() {
        Some(literal) => format!(" DEFAULT {literal}"),
        None => String::new(),
    };
    format!("{null}{default}")
}

/// Whether `changes` contains a change on `kind`.
pub(crate) fn has_change(changes: &[FieldChange], kind: ChangeKind) -> bool {
    changes.iter().any(|c| c.kind == kind)
}

/// Whether `field` would be added without any usable value.
pub(crate) fn lacks_value(field: &FieldDefinition) -> bool {
    !field.nullable && field.resolved_default() == ResolvedDefault::NoDefault
}

/// Executes a DDL statement, degrading the MySQL algorithm hints on failure:
/// the statement as given, then `ALGORITHM=INPLACE`, then no hints at all.
pub async fn execute_ddl_safely<E: SqlExecutor>(
    dialect: &dyn SyncDialect,
    executor: &E,
    sql: &str,
) -> Result<()> {
    if !dialect.capabilities().algorithm_ladder {
        executor.execute(sql, &[]).await?;
        return Ok(());
    }

    let mut attempts = vec![sql.to_string()];
    if sql.contains("ALGORITHM=INSTANT") {
        attempts.push(sql.replace("ALGORITHM=INSTANT", "ALGORITHM=INPLACE"));
    }
    let stripped = strip_algorithm_hints(sql);
    if stripped != sql {
        attempts.push(stripped);
    }

    let total = attempts.len();
    let mut last_error = None;
    for (i, statement) in attempts.iter().enumerate() {
        match executor.execute(statement, &[]).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                if i + 1 < total {
                    warn!(
                        attempt = i + 1,
                        sql = %statement,
                        error = %err,
                        "DDL rejected, retrying with a weaker algorithm"
                    );
                }
                last_error = Some(err);
            }
        }
    }
    match last_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockExecutor;

    #[test]
    fn test_quote_rejects_injection() {
        for dialect in [DialectKind::MySql, DialectKind::Postgres, DialectKind::Sqlite] {
            let d = dialect.dialect();
            assert!(d.quote_identifier("users").is_ok());
            assert!(d.quote_identifier("_tmp_1").is_ok());
            for bad in ["", "1abc", "a-b", "a b", "x`; DROP TABLE y; --", "é"] {
                assert!(
                    matches!(d.quote_identifier(bad), Err(SyncError::InvalidIdentifier(_))),
                    "{dialect} accepted {bad:?}"
                );
            }
        }
    }

    #[test]
    fn test_quote_styles() {
        assert_eq!(DialectKind::MySql.dialect().quote_identifier("t").unwrap(), "`t`");
        assert_eq!(DialectKind::Postgres.dialect().quote_identifier("t").unwrap(), "\"t\"");
        assert_eq!(DialectKind::Sqlite.dialect().quote_identifier("t").unwrap(), "\"t\"");
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("MySQL".parse::<DialectKind>().unwrap(), DialectKind::MySql);
        assert_eq!("postgresql".parse::<DialectKind>().unwrap(), DialectKind::Postgres);
        assert_eq!("sqlite".parse::<DialectKind>().unwrap(), DialectKind::Sqlite);
        assert!(matches!(
            "oracle".parse::<DialectKind>(),
            Err(SyncError::UnknownDialect(_))
        ));
    }

    #[test]
    fn test_long_index_names_are_bounded() {
        let table = "addon_shop_cart_order_item_history";
        let field = "customer_reference_code_for_invoices";
        for kind in [DialectKind::MySql, DialectKind::Postgres, DialectKind::Sqlite] {
            let d = kind.dialect();
            let name = d.index_name(table, field);
            assert!(name.len() <= MAX_IDENTIFIER_LEN, "{kind}: {name}");
            assert_eq!(name, d.index_name(table, field));
            assert!(d.quote_identifier(&name).is_ok());
        }

        let pg = DialectKind::Postgres.dialect();
        let long = pg.index_name(table, field);
        assert!(long.starts_with("idx_addon_shop_cart_order_item_history_customer"));
        assert_ne!(long, pg.index_name(table, "customer_reference_code_for_invoices2"));
        assert_eq!(pg.index_name("users", "email"), "idx_users_email");
        assert_eq!(
            DialectKind::MySql.dialect().index_name(table, field),
            "idx_customer_reference_code_for_invoices"
        );
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("8.0.36-log"), Some((8, 0, 36)));
        assert_eq!(
            parse_version("PostgreSQL 17.2 on x86_64-pc-linux-gnu"),
            Some((17, 2, 0))
        );
        assert_eq!(parse_version("3.50.1"), Some((3, 50, 1)));
        assert_eq!(parse_version("unknown"), None);
    }

    #[test]
    fn test_version_minimums() {
        let mysql = DialectKind::MySql.dialect();
        assert!(mysql.check_version("8.0.36").is_ok());
        assert!(matches!(
            mysql.check_version("5.7.44"),
            Err(SyncError::UnsupportedVersion { .. })
        ));

        let pg = DialectKind::Postgres.dialect();
        assert!(pg.check_version("PostgreSQL 17.0").is_ok());
        assert!(pg.check_version("PostgreSQL 16.4 on aarch64").is_err());

        let sqlite = DialectKind::Sqlite.dialect();
        assert!(sqlite.check_version("3.50.0").is_ok());
        assert!(sqlite.check_version("3.49.9").is_err());
        assert!(matches!(
            sqlite.check_version("n/a"),
            Err(SyncError::UnparsableVersion { .. })
        ));
    }

    #[test]
    fn test_strip_algorithm_hints() {
        assert_eq!(
            strip_algorithm_hints("ALTER TABLE `t` ALGORITHM=INPLACE, LOCK=NONE, ADD INDEX `idx_a` (`a`)"),
            "ALTER TABLE `t` ADD INDEX `idx_a` (`a`)"
        );
        assert_eq!(
            strip_algorithm_hints("ALTER TABLE `t` ALGORITHM=INSTANT, ADD COLUMN `a` TEXT"),
            "ALTER TABLE `t` ADD COLUMN `a` TEXT"
        );
    }

    #[tokio::test]
    async fn test_ladder_falls_back_to_inplace() {
        let db = MockExecutor::new().fail_when("ALGORITHM=INSTANT");
        let sql = "ALTER TABLE `t` ALGORITHM=INSTANT, MODIFY COLUMN `a` BIGINT";
        execute_ddl_safely(DialectKind::MySql.dialect(), &db, sql)
            .await
            .unwrap();
        assert_eq!(
            db.statements(),
            vec![
                sql.to_string(),
                "ALTER TABLE `t` ALGORITHM=INPLACE, MODIFY COLUMN `a` BIGINT".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_ladder_strips_hints_last() {
        let db = MockExecutor::new().fail_when("ALGORITHM=");
        let sql = "ALTER TABLE `t` ALGORITHM=INSTANT, MODIFY COLUMN `a` BIGINT";
        execute_ddl_safely(DialectKind::MySql.dialect(), &db, sql)
            .await
            .unwrap();
        let statements = db.statements();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[2], "ALTER TABLE `t` MODIFY COLUMN `a` BIGINT");
    }

    #[tokio::test]
    async fn test_ladder_errors_after_three_failures() {
        let db = MockExecutor::new().fail_when("ALTER TABLE");
        let sql = "ALTER TABLE `t` ALGORITHM=INSTANT, MODIFY COLUMN `a` BIGINT";
        let result = execute_ddl_safely(DialectKind::MySql.dialect(), &db, sql).await;
        assert!(result.is_err());
        assert_eq!(db.statements().len(), 3);
    }

    #[tokio::test]
    async fn test_no_ladder_outside_mysql() {
        let db = MockExecutor::new().fail_when("ALTER TABLE");
        let result = execute_ddl_safely(
            DialectKind::Postgres.dialect(),
            &db,
            "ALTER TABLE \"t\" ADD COLUMN \"a\" TEXT",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(db.statements().len(), 1);
    }
}
