//! SQLite dialect for schema synchronization.
//!
//! SQLite has limited ALTER TABLE support: a column cannot be modified in
//! place and defaults cannot be changed, so such changes use the "table
//! recreation" strategy: create a new table, copy data, drop the old table,
//! rename the new table. Every statement carries IF [NOT] EXISTS guards.

use serde_json::json;

use crate::error::Result;
use crate::field::{FieldDefinition, FieldType};
use crate::plan::FieldChange;

use super::{
    bounded_identifier, lacks_value, null_and_default, quote_with, require_version, DialectCapabilities,
    DialectKind, IndexAction, Query, SyncDialect,
};

/// SQLite 3.50+ dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SyncDialect for SqliteDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Sqlite
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities {
            length_diff: false,
            comment_diff: false,
            inline_comments: false,
            rebuild_on_modify: true,
            algorithm_ladder: false,
            guarded_ddl: true,
        }
    }

    fn quote_identifier(&self, name: &str) -> Result<String> {
        quote_with(name, '"')
    }

    fn sql_type(&self, field_type: FieldType, _max: i64, _unsigned: bool) -> String {
        match field_type {
            FieldType::Number => "INTEGER".to_string(),
            _ => "TEXT".to_string(),
        }
    }

    fn expected_data_type(&self, field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::Number => "integer",
            _ => "text",
        }
    }

    fn system_column_definition(&self, column: &str) -> Result<String> {
        let quoted = self.quote_identifier(column)?;
        Ok(if column == "id" {
            format!("{quoted} INTEGER PRIMARY KEY")
        } else {
            format!("{quoted} INTEGER NOT NULL DEFAULT 0")
        })
    }

    fn column_definition(&self, column: &str, field: &FieldDefinition) -> Result<String> {
        Ok(format!(
            "{} {}{}",
            self.quote_identifier(column)?,
            self.sql_type(field.field_type, field.max, field.unsigned),
            null_and_default(field)
        ))
    }

    /// SQLite rejects ADD COLUMN for UNIQUE columns and for NOT NULL columns
    /// without a default; those go through a rebuild instead.
    fn can_add_in_place(&self, field: &FieldDefinition) -> bool {
        !field.unique && !lacks_value(field)
    }

    fn modify_column_clauses(
        &self,
        _column: &str,
        _field: &FieldDefinition,
        _changes: &[FieldChange],
    ) -> Result<Vec<String>> {
        // Applied by rebuilding the table.
        Ok(Vec::new())
    }

    fn index_name(&self, table: &str, field: &str) -> String {
        bounded_identifier(format!("idx_{table}_{field}"))
    }

    fn build_index_sql(
        &self,
        table: &str,
        index_name: &str,
        field: &str,
        action: IndexAction,
    ) -> Result<String> {
        let index = self.quote_identifier(index_name)?;
        Ok(match action {
            IndexAction::Create => format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {} ({})",
                self.quote_identifier(table)?,
                self.quote_identifier(field)?
            ),
            IndexAction::Drop => format!("DROP INDEX IF EXISTS {index}"),
        })
    }

    fn table_exists_query(&self, _database: &str, table: &str) -> Query {
        Query::new(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
            vec![json!(table)],
        )
    }

    fn columns_query(&self, _database: &str, table: &str) -> Query {
        Query::new(
            "SELECT name AS column_name, lower(type) AS data_type, lower(type) AS column_type, \
             NULL AS max_length, \
             CASE WHEN \"notnull\" = 0 AND pk = 0 THEN 'YES' ELSE 'NO' END AS is_nullable, \
             dflt_value AS column_default, NULL AS column_comment \
             FROM pragma_table_info(?) ORDER BY cid",
            vec![json!(table)],
        )
    }

    fn indexes_query(&self, _database: &str, table: &str) -> Query {
        Query::new(
            "SELECT il.name AS index_name, ii.name AS column_name \
             FROM pragma_index_list(?) AS il, pragma_index_info(il.name) AS ii \
             WHERE il.origin = 'c' \
             ORDER BY il.name, ii.seqno",
            vec![json!(table)],
        )
    }

    fn index_definitions_query(&self, table: &str) -> Option<Query> {
        Some(Query::new(
            "SELECT sql FROM sqlite_master \
             WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL \
             ORDER BY name",
            vec![json!(table)],
        ))
    }

    fn version_query(&self) -> &'static str {
        "SELECT sqlite_version() AS version"
    }

    fn check_version(&self, raw: &str) -> Result<()> {
        require_version("sqlite", raw, (3, 50, 0), "3.50.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{normalize, FieldInput};

    fn dialect() -> SqliteDialect {
        SqliteDialect
    }

    #[test]
    fn test_type_names() {
        let d = dialect();
        assert_eq!(d.sql_type(FieldType::Number, 0, true), "INTEGER");
        assert_eq!(d.sql_type(FieldType::String, 255, true), "TEXT");
        assert_eq!(d.sql_type(FieldType::ArrayNumberText, 0, true), "TEXT");
    }

    #[test]
    fn test_create_table_is_guarded() {
        let fields = vec![(
            "title".to_string(),
            normalize(&FieldInput::new("Title", FieldType::String)),
        )];
        let sql = dialect().create_table_sql("posts", &fields).unwrap();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"posts\" ("));
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY"));
        assert!(sql.contains("\"state\" INTEGER NOT NULL DEFAULT 0"));
        assert!(sql.contains("\"title\" TEXT NOT NULL DEFAULT ''"));
    }

    #[test]
    fn test_index_sql_is_guarded() {
        let d = dialect();
        assert_eq!(
            d.build_index_sql("posts", "idx_posts_title", "title", IndexAction::Create)
                .unwrap(),
            "CREATE INDEX IF NOT EXISTS \"idx_posts_title\" ON \"posts\" (\"title\")"
        );
        assert_eq!(
            d.build_index_sql("posts", "idx_posts_title", "title", IndexAction::Drop)
                .unwrap(),
            "DROP INDEX IF EXISTS \"idx_posts_title\""
        );
    }

    #[test]
    fn test_in_place_add_rules() {
        let d = dialect();
        assert!(d.can_add_in_place(&normalize(&FieldInput::new("A", FieldType::String))));
        assert!(d.can_add_in_place(&normalize(&FieldInput::new("B", FieldType::Text).nullable())));
        assert!(!d.can_add_in_place(&normalize(&FieldInput::new("C", FieldType::Text))));
        assert!(!d.can_add_in_place(&normalize(
            &FieldInput::new("D", FieldType::String).unique()
        )));
    }

    #[test]
    fn test_modify_is_a_rebuild() {
        let field = normalize(&FieldInput::new("A", FieldType::Number));
        assert!(dialect()
            .modify_column_clauses("a", &field, &[])
            .unwrap()
            .is_empty());
        assert!(dialect().capabilities().rebuild_on_modify);
    }
}
