//! MySQL dialect.
//!
//! Column comments are inline, ALTER statements carry `ALGORITHM` hints and
//! are applied through the degradation ladder in
//! [`execute_ddl_safely`](super::execute_ddl_safely).

use serde_json::json;

use crate::error::Result;
use crate::field::{FieldDefinition, FieldType};
use crate::plan::FieldChange;

use super::{
    bounded_identifier, null_and_default, quote_literal, quote_with, require_version, system_comment,
    DialectCapabilities, DialectKind, IndexAction, Query, SyncDialect,
};

/// MySQL 8+ dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SyncDialect for MySqlDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::MySql
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities {
            length_diff: true,
            comment_diff: true,
            inline_comments: true,
            rebuild_on_modify: false,
            algorithm_ladder: true,
            guarded_ddl: false,
        }
    }

    fn quote_identifier(&self, name: &str) -> Result<String> {
        quote_with(name, '`')
    }

    fn sql_type(&self, field_type: FieldType, max: i64, unsigned: bool) -> String {
        match field_type {
            FieldType::Number if unsigned => "BIGINT UNSIGNED".to_string(),
            FieldType::Number => "BIGINT".to_string(),
            t if t.is_sized() => format!("VARCHAR({max})"),
            _ => "MEDIUMTEXT".to_string(),
        }
    }

    fn expected_data_type(&self, field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::Number => "bigint",
            t if t.is_sized() => "varchar",
            _ => "mediumtext",
        }
    }

    fn system_column_definition(&self, column: &str) -> Result<String> {
        let quoted = self.quote_identifier(column)?;
        let comment = quote_literal(system_comment(column));
        Ok(if column == "id" {
            format!("{quoted} BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY COMMENT {comment}")
        } else {
            format!("{quoted} BIGINT UNSIGNED NOT NULL DEFAULT 0 COMMENT {comment}")
        })
    }

    fn table_options(&self) -> &'static str {
        " ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_0900_ai_ci"
    }

    fn column_definition(&self, column: &str, field: &FieldDefinition) -> Result<String> {
        Ok(format!(
            "{} {}{} COMMENT {}",
            self.quote_identifier(column)?,
            self.sql_type(field.field_type, field.max, field.unsigned),
            null_and_default(field),
            quote_literal(&field.name)
        ))
    }

    fn modify_column_clauses(
        &self,
        column: &str,
        field: &FieldDefinition,
        _changes: &[FieldChange],
    ) -> Result<Vec<String>> {
        Ok(vec![format!(
            "MODIFY COLUMN {}",
            self.column_definition(column, field)?
        )])
    }

    fn alter_table_sql(&self, table: &str, clauses: &[String]) -> Result<String> {
        Ok(format!(
            "ALTER TABLE {} ALGORITHM=INSTANT, {}",
            self.quote_identifier(table)?,
            clauses.join(", ")
        ))
    }

    fn index_name(&self, _table: &str, field: &str) -> String {
        bounded_identifier(format!("idx_{field}"))
    }

    fn build_index_sql(
        &self,
        table: &str,
        index_name: &str,
        field: &str,
        action: IndexAction,
    ) -> Result<String> {
        let table = self.quote_identifier(table)?;
        let index = self.quote_identifier(index_name)?;
        Ok(match action {
            IndexAction::Create => format!(
                "ALTER TABLE {table} ALGORITHM=INPLACE, LOCK=NONE, ADD INDEX {index} ({})",
                self.quote_identifier(field)?
            ),
            IndexAction::Drop => {
                format!("ALTER TABLE {table} ALGORITHM=INPLACE, LOCK=NONE, DROP INDEX {index}")
            }
        })
    }

    fn table_exists_query(&self, database: &str, table: &str) -> Query {
        Query::new(
            "SELECT COUNT(*) AS count FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
            vec![json!(database), json!(table)],
        )
    }

    fn columns_query(&self, database: &str, table: &str) -> Query {
        Query::new(
            "SELECT COLUMN_NAME AS column_name, DATA_TYPE AS data_type, \
             COLUMN_TYPE AS column_type, CHARACTER_MAXIMUM_LENGTH AS max_length, \
             IS_NULLABLE AS is_nullable, COLUMN_DEFAULT AS column_default, \
             COLUMN_COMMENT AS column_comment \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            vec![json!(database), json!(table)],
        )
    }

    fn indexes_query(&self, database: &str, table: &str) -> Query {
        Query::new(
            "SELECT INDEX_NAME AS index_name, COLUMN_NAME AS column_name \
             FROM information_schema.STATISTICS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND INDEX_NAME <> 'PRIMARY' \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
            vec![json!(database), json!(table)],
        )
    }

    fn version_query(&self) -> &'static str {
        "SELECT VERSION() AS version"
    }

    fn check_version(&self, raw: &str) -> Result<()> {
        require_version("mysql", raw, (8, 0, 0), "8.0")
    }
}
