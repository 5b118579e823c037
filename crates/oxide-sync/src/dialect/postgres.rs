//! PostgreSQL dialect.

use serde_json::json;

use crate::error::Result;
use crate::field::{FieldDefinition, FieldType};
use crate::plan::{ChangeKind, FieldChange};

use super::{
    bounded_identifier, has_change, null_and_default, quote_literal, quote_with, require_version,
    DialectCapabilities, DialectKind, IndexAction, Query, SyncDialect,
};

/// PostgreSQL 17+ dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SyncDialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities {
            length_diff: true,
            comment_diff: true,
            inline_comments: false,
            rebuild_on_modify: false,
            algorithm_ladder: false,
            guarded_ddl: false,
        }
    }

    fn quote_identifier(&self, name: &str) -> Result<String> {
        quote_with(name, '"')
    }

    fn sql_type(&self, field_type: FieldType, max: i64, _unsigned: bool) -> String {
        match field_type {
            FieldType::Number => "BIGINT".to_string(),
            t if t.is_sized() => format!("character varying({max})"),
            _ => "TEXT".to_string(),
        }
    }

    fn expected_data_type(&self, field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::Number => "bigint",
            t if t.is_sized() => "character varying",
            _ => "text",
        }
    }

    fn system_column_definition(&self, column: &str) -> Result<String> {
        let quoted = self.quote_identifier(column)?;
        Ok(if column == "id" {
            format!("{quoted} BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY")
        } else {
            format!("{quoted} BIGINT NOT NULL DEFAULT 0")
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

    fn modify_column_clauses(
        &self,
        column: &str,
        field: &FieldDefinition,
        changes: &[FieldChange],
    ) -> Result<Vec<String>> {
        let quoted = self.quote_identifier(column)?;
        let mut clauses = Vec::new();
        if has_change(changes, ChangeKind::Datatype) || has_change(changes, ChangeKind::Length) {
            clauses.push(format!(
                "ALTER COLUMN {quoted} TYPE {}",
                self.sql_type(field.field_type, field.max, field.unsigned)
            ));
        }
        if has_change(changes, ChangeKind::Nullable) {
            clauses.push(if field.nullable {
                format!("ALTER COLUMN {quoted} DROP NOT NULL")
            } else {
                format!("ALTER COLUMN {quoted} SET NOT NULL")
            });
        }
        if has_change(changes, ChangeKind::Default) {
            clauses.push(self.default_clause(column, field)?);
        }
        Ok(clauses)
    }

    fn comment_sql(&self, table: &str, column: &str, comment: &str) -> Result<Option<String>> {
        Ok(Some(format!(
            "COMMENT ON COLUMN {}.{} IS {}",
            self.quote_identifier(table)?,
            self.quote_identifier(column)?,
            quote_literal(comment)
        )))
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
                "CREATE INDEX CONCURRENTLY IF NOT EXISTS {index} ON {} ({})",
                self.quote_identifier(table)?,
                self.quote_identifier(field)?
            ),
            IndexAction::Drop => format!("DROP INDEX CONCURRENTLY IF EXISTS {index}"),
        })
    }

    fn table_exists_query(&self, database: &str, table: &str) -> Query {
        Query::new(
            "SELECT COUNT(*)::int8 AS count FROM information_schema.tables \
             WHERE table_catalog = $1 AND table_schema = current_schema() AND table_name = $2",
            vec![json!(database), json!(table)],
        )
    }

    fn columns_query(&self, database: &str, table: &str) -> Query {
        Query::new(
            "SELECT column_name::text AS column_name, data_type::text AS data_type, \
             CASE WHEN character_maximum_length IS NULL THEN data_type::text \
             ELSE data_type::text || '(' || character_maximum_length || ')' END AS column_type, \
             character_maximum_length::int8 AS max_length, is_nullable::text AS is_nullable, \
             column_default::text AS column_default, NULL::text AS column_comment \
             FROM information_schema.columns \
             WHERE table_catalog = $1 AND table_schema = current_schema() AND table_name = $2 \
             ORDER BY ordinal_position",
            vec![json!(database), json!(table)],
        )
    }

    fn column_comments_query(&self, _database: &str, table: &str) -> Option<Query> {
        Some(Query::new(
            "SELECT a.attname::text AS column_name, \
             col_description(c.oid, a.attnum) AS column_comment \
             FROM pg_class c \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_attribute a ON a.attrelid = c.oid \
             WHERE n.nspname = current_schema() AND c.relname = $1 \
             AND a.attnum > 0 AND NOT a.attisdropped",
            vec![json!(table)],
        ))
    }

    fn indexes_query(&self, _database: &str, table: &str) -> Query {
        Query::new(
            "SELECT i.relname::text AS index_name, a.attname::text AS column_name \
             FROM pg_index ix \
             JOIN pg_class t ON t.oid = ix.indrelid \
             JOIN pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
             WHERE n.nspname = current_schema() AND t.relname = $1 AND NOT ix.indisprimary \
             ORDER BY i.relname, k.ord",
            vec![json!(table)],
        )
    }

    fn version_query(&self) -> &'static str {
        "SELECT version() AS version"
    }

    fn check_version(&self, raw: &str) -> Result<()> {
        require_version("postgres", raw, (17, 0, 0), "17")
    }
}
