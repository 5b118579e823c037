//! Applying table plans.
//!
//! No statement group runs inside a transaction. A failure halfway through a
//! table leaves the statements already executed in place; re-running the sync
//! picks up from there.

use std::collections::HashSet;
use std::sync::LazyLock;

use futures::future::try_join_all;
use regex::Regex;
use tracing::{debug, error};

use crate::dialect::{execute_ddl_safely, lacks_value, system_comment, IndexAction};
use crate::error::Result;
use crate::executor::SqlExecutor;
use crate::field::{validate_fields, FieldDefinition, SYSTEM_FIELDS, SYSTEM_INDEX_FIELDS};
use crate::introspect::{row_str, table_columns, ColumnInfo};
use crate::plan::{IndexStep, TablePlan};
use crate::sync::SyncRuntime;

static CREATE_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*CREATE\s+(UNIQUE\s+)?INDEX\s+(IF\s+NOT\s+EXISTS\s+)?")
        .expect("create index pattern is valid")
});

async fn run_index_step<E: SqlExecutor>(
    runtime: &SyncRuntime<'_, E>,
    table: &str,
    step: &IndexStep,
) -> Result<()> {
    let dialect = runtime.dialect;
    let result = match dialect.build_index_sql(table, &step.index_name, &step.field, step.action) {
        Ok(sql) => execute_ddl_safely(dialect, runtime.executor, &sql).await,
        Err(err) => Err(err),
    };
    result.map_err(|err| {
        error!(
            table = %table,
            index = %step.index_name,
            field = %step.field,
            action = %step.action,
            error = %err,
            "Index change failed"
        );
        err
    })
}

/// Creates `table` with the system columns, the given fields and their
/// indexes.
///
/// Index builds target independent names and run concurrently.
pub async fn create_table<E: SqlExecutor>(
    runtime: &SyncRuntime<'_, E>,
    table: &str,
    fields: &[(String, FieldDefinition)],
) -> Result<()> {
    validate_fields(table, fields)?;
    let dialect = runtime.dialect;
    let sql = dialect.create_table_sql(table, fields)?;
    runtime.executor.execute(&sql, &[]).await?;

    let caps = dialect.capabilities();
    if caps.comment_diff && !caps.inline_comments {
        let system = SYSTEM_FIELDS
            .iter()
            .map(|c| dialect.comment_sql(table, c, system_comment(c)));
        let business = fields
            .iter()
            .map(|(key, field)| dialect.comment_sql(table, key, &field.name));
        for statement in system.chain(business) {
            if let Some(sql) = statement? {
                runtime.executor.execute(&sql, &[]).await?;
            }
        }
    }

    let steps: Vec<IndexStep> = SYSTEM_INDEX_FIELDS
        .iter()
        .map(|f| f.to_string())
        .chain(
            fields
                .iter()
                .filter(|(_, f)| f.index && !f.unique)
                .map(|(key, _)| key.clone()),
        )
        .map(|field| IndexStep {
            action: IndexAction::Create,
            index_name: dialect.index_name(table, &field),
            field,
        })
        .collect();
    try_join_all(steps.iter().map(|step| run_index_step(runtime, table, step))).await?;

    debug!(table = %table, indexes = steps.len(), "Created table");
    Ok(())
}

/// Definition of a live column that is no longer declared, kept as-is.
fn preserved_column_sql(quoted: &str, column: &ColumnInfo) -> String {
    let mut sql = quoted.to_string();
    if !column.column_type.is_empty() {
        sql.push(' ');
        sql.push_str(&column.column_type.to_uppercase());
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    // The catalog reports expression defaults without their parentheses.
    if let Some(default) = &column.default_value {
        sql.push_str(&format!(" DEFAULT ({default})"));
    }
    sql
}

/// Adds `IF NOT EXISTS` to a captured CREATE INDEX statement.
fn guard_index_sql(sql: &str) -> String {
    CREATE_INDEX
        .replace(sql, |caps: &regex::Captures<'_>| {
            let unique = if caps.get(1).is_some() { "UNIQUE " } else { "" };
            format!("CREATE {unique}INDEX IF NOT EXISTS ")
        })
        .into_owned()
}

/// Recreates `table` with its declared schema: build a temporary table, copy
/// the shared columns, swap it in and restore the explicit indexes.
///
/// Live columns missing from the definition are carried over unchanged.
pub async fn rebuild_table<E: SqlExecutor>(
    runtime: &SyncRuntime<'_, E>,
    table: &str,
    fields: &[(String, FieldDefinition)],
) -> Result<()> {
    let dialect = runtime.dialect;
    let executor = runtime.executor;
    let live = table_columns(runtime, table).await?;

    let captured: Vec<String> = match dialect.index_definitions_query(table) {
        Some(query) => executor
            .execute(&query.sql, &query.params)
            .await?
            .iter()
            .filter_map(|row| row_str(row, "sql"))
            .collect(),
        None => Vec::new(),
    };

    let mut definitions = dialect.table_column_definitions(fields)?;
    let mut copies: Vec<(String, String)> = Vec::new();
    let declared: HashSet<&str> = SYSTEM_FIELDS
        .iter()
        .copied()
        .chain(fields.iter().map(|(key, _)| key.as_str()))
        .collect();

    for column in SYSTEM_FIELDS {
        if live.contains_key(column) {
            let quoted = dialect.quote_identifier(column)?;
            copies.push((quoted.clone(), quoted));
        }
    }
    for (key, field) in fields {
        let quoted = dialect.quote_identifier(key)?;
        let source = match (live.contains_key(key), field.resolved_default().to_sql()) {
            (true, Some(literal)) if !field.nullable => format!("COALESCE({quoted}, {literal})"),
            (true, None) if lacks_value(field) => format!("COALESCE({quoted}, '')"),
            (true, _) => quoted.clone(),
            // NOT NULL column without a default: fill existing rows.
            (false, None) if lacks_value(field) => "''".to_string(),
            (false, _) => continue,
        };
        copies.push((quoted, source));
    }
    for (name, column) in live.iter().filter(|(name, _)| !declared.contains(name.as_str())) {
        let quoted = dialect.quote_identifier(name)?;
        definitions.push(preserved_column_sql(&quoted, column));
        copies.push((quoted.clone(), quoted));
    }

    let tmp_name = format!("_oxide_sync_{table}");
    let tmp = dialect.quote_identifier(&tmp_name)?;
    let quoted_table = dialect.quote_identifier(table)?;
    let targets: Vec<&str> = copies.iter().map(|(target, _)| target.as_str()).collect();
    let sources: Vec<&str> = copies.iter().map(|(_, source)| source.as_str()).collect();

    let mut statements = vec![
        format!("DROP TABLE IF EXISTS {tmp}"),
        dialect.create_table_from_columns(&tmp_name, &definitions)?,
    ];
    if !copies.is_empty() {
        statements.push(format!(
            "INSERT INTO {tmp} ({}) SELECT {} FROM {quoted_table}",
            targets.join(", "),
            sources.join(", ")
        ));
    }
    statements.push(format!("DROP TABLE IF EXISTS {quoted_table}"));
    statements.push(format!("ALTER TABLE {tmp} RENAME TO {quoted_table}"));
    statements.extend(captured.iter().map(|sql| guard_index_sql(sql)));

    for sql in &statements {
        executor.execute(sql, &[]).await?;
    }
    debug!(
        table = %table,
        columns = definitions.len(),
        indexes = captured.len(),
        "Rebuilt table"
    );
    Ok(())
}

/// Executes a plan in order: structural changes, default-only changes,
/// index actions, then standalone comments.
pub async fn apply_table_plan<E: SqlExecutor>(
    runtime: &SyncRuntime<'_, E>,
    plan: &TablePlan,
    fields: &[(String, FieldDefinition)],
) -> Result<()> {
    let dialect = runtime.dialect;
    let executor = runtime.executor;
    let caps = dialect.capabilities();
    let table = plan.table.as_str();

    if plan.rebuild {
        rebuild_table(runtime, table, fields).await?;
    } else if caps.rebuild_on_modify {
        // One column per ALTER TABLE.
        for clause in &plan.add_clauses {
            let sql = dialect.alter_table_sql(table, std::slice::from_ref(clause))?;
            executor.execute(&sql, &[]).await?;
        }
    } else {
        let clauses: Vec<String> = plan
            .add_clauses
            .iter()
            .chain(&plan.modify_clauses)
            .cloned()
            .collect();
        if !clauses.is_empty() {
            let sql = dialect.alter_table_sql(table, &clauses)?;
            execute_ddl_safely(dialect, executor, &sql).await?;
        }
    }

    if !caps.rebuild_on_modify && !plan.default_clauses.is_empty() {
        let sql = dialect.alter_table_sql(table, &plan.default_clauses)?;
        execute_ddl_safely(dialect, executor, &sql).await?;
    }

    for step in &plan.index_actions {
        run_index_step(runtime, table, step).await?;
    }

    for sql in &plan.comment_actions {
        executor.execute(sql, &[]).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DialectKind;
    use crate::field::{normalize, FieldInput, FieldType};
    use crate::error::SyncError;
    use crate::introspect::{all_table_indexes, table_columns, table_indexes};
    use crate::plan::{normalize_live_default, plan_table};
    use crate::test_support::{memory_runtime, MockExecutor};
    use serde_json::json;

    fn fields(list: Vec<(&str, FieldInput)>) -> Vec<(String, FieldDefinition)> {
        list.into_iter()
            .map(|(k, input)| (k.to_string(), normalize(&input)))
            .collect()
    }

    #[test]
    fn test_guard_index_sql() {
        assert_eq!(
            guard_index_sql("CREATE INDEX idx_a ON t (a)"),
            "CREATE INDEX IF NOT EXISTS idx_a ON t (a)"
        );
        assert_eq!(
            guard_index_sql("create unique index u_a on t (a)"),
            "CREATE UNIQUE INDEX IF NOT EXISTS u_a on t (a)"
        );
        assert_eq!(
            guard_index_sql("CREATE INDEX IF NOT EXISTS \"i\" ON \"t\" (\"a\")"),
            "CREATE INDEX IF NOT EXISTS \"i\" ON \"t\" (\"a\")"
        );
    }

    #[test]
    fn test_preserved_column_sql() {
        let column = |default: Option<&str>, nullable: bool| ColumnInfo {
            data_type: "text".to_string(),
            column_type: "text".to_string(),
            max: None,
            nullable,
            default_value: default.map(str::to_string),
            comment: None,
        };
        assert_eq!(
            preserved_column_sql("\"stamp\"", &column(Some("datetime('now')"), true)),
            "\"stamp\" TEXT DEFAULT (datetime('now'))"
        );
        assert_eq!(
            preserved_column_sql("\"flag\"", &column(Some("'x'"), false)),
            "\"flag\" TEXT NOT NULL DEFAULT ('x')"
        );
        assert_eq!(preserved_column_sql("\"note\"", &column(None, true)), "\"note\" TEXT");
    }

    #[tokio::test]
    async fn test_create_table_rejects_invalid_default() {
        let db = MockExecutor::new();
        let runtime = SyncRuntime::new(DialectKind::Sqlite.dialect(), &db, "main");
        let defs = fields(vec![(
            "n",
            FieldInput::new("N", FieldType::Number).default_value("abc"),
        )]);
        let err = create_table(&runtime, "items", &defs).await.unwrap_err();
        assert!(
            matches!(&err, SyncError::InvalidDefinition { table, field, .. }
                if table == "items" && field == "n"),
            "{err}"
        );
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_create_table_mysql_statements() {
        let db = MockExecutor::new();
        let runtime = SyncRuntime::new(DialectKind::MySql.dialect(), &db, "app");
        let defs = fields(vec![
            ("email", FieldInput::new("Email", FieldType::String).max(100)),
            ("code", FieldInput::new("Code", FieldType::String).indexed()),
            ("slug", FieldInput::new("Slug", FieldType::String).indexed().unique()),
        ]);
        create_table(&runtime, "users", &defs).await.unwrap();

        let statements = db.statements();
        assert_eq!(statements.len(), 5);
        assert!(statements[0].starts_with("CREATE TABLE `users`"));
        for (sql, field) in statements[1..]
            .iter()
            .zip(["created_at", "updated_at", "state", "code"])
        {
            assert!(sql.ends_with(&format!("ADD INDEX `idx_{field}` (`{field}`)")), "{sql}");
        }
    }

    #[tokio::test]
    async fn test_create_table_postgres_comments() {
        let db = MockExecutor::new();
        let runtime = SyncRuntime::new(DialectKind::Postgres.dialect(), &db, "app");
        let defs = fields(vec![("email", FieldInput::new("Email", FieldType::String))]);
        create_table(&runtime, "users", &defs).await.unwrap();

        let statements = db.statements();
        let comments: Vec<_> = statements
            .iter()
            .filter(|s| s.starts_with("COMMENT ON COLUMN"))
            .collect();
        assert_eq!(comments.len(), 6);
        assert_eq!(
            comments[5],
            "COMMENT ON COLUMN \"users\".\"email\" IS 'Email'"
        );
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE INDEX CONCURRENTLY IF NOT EXISTS \"idx_users_state\"")));
    }

    #[tokio::test]
    async fn test_index_failure_is_rethrown() {
        let db = MockExecutor::new().fail_when("ADD INDEX `idx_state`");
        let runtime = SyncRuntime::new(DialectKind::MySql.dialect(), &db, "app");
        assert!(create_table(&runtime, "users", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_mysql_plan_is_one_batched_alter() {
        let db = MockExecutor::new();
        let runtime = SyncRuntime::new(DialectKind::MySql.dialect(), &db, "app");
        let plan = TablePlan {
            table: "users".to_string(),
            changed: true,
            add_clauses: vec!["ADD COLUMN `a` BIGINT".to_string()],
            modify_clauses: vec!["MODIFY COLUMN `b` BIGINT".to_string()],
            default_clauses: vec!["ALTER COLUMN `c` SET DEFAULT 1".to_string()],
            ..TablePlan::default()
        };
        apply_table_plan(&runtime, &plan, &[]).await.unwrap();
        assert_eq!(
            db.statements(),
            vec![
                "ALTER TABLE `users` ALGORITHM=INSTANT, ADD COLUMN `a` BIGINT, MODIFY COLUMN `b` BIGINT"
                    .to_string(),
                "ALTER TABLE `users` ALGORITHM=INSTANT, ALTER COLUMN `c` SET DEFAULT 1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_sqlite_adds_one_column_per_alter() {
        let (pool, dialect) = memory_runtime().await;
        let runtime = SyncRuntime::new(dialect, &pool, "main");
        create_table(&runtime, "notes", &[]).await.unwrap();

        let defs = fields(vec![
            ("title", FieldInput::new("Title", FieldType::String)),
            ("views", FieldInput::new("Views", FieldType::Number)),
        ]);
        let plan = plan_table(&runtime, "notes", &defs).await.unwrap();
        assert!(!plan.rebuild);
        assert_eq!(plan.add_clauses.len(), 2);
        apply_table_plan(&runtime, &plan, &defs).await.unwrap();

        let columns = table_columns(&runtime, "notes").await.unwrap();
        assert!(columns.contains_key("title"));
        assert!(columns.contains_key("views"));
        assert!(!plan_table(&runtime, "notes", &defs).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_sqlite_rebuild_keeps_rows_and_indexes() {
        let (pool, dialect) = memory_runtime().await;
        let runtime = SyncRuntime::new(dialect, &pool, "main");
        let before = fields(vec![
            ("title", FieldInput::new("Title", FieldType::String).indexed()),
            ("legacy", FieldInput::new("Legacy", FieldType::Number)),
        ]);
        create_table(&runtime, "posts", &before).await.unwrap();
        pool.execute(
            "INSERT INTO posts (title, legacy) VALUES (?, ?)",
            &[json!("hello"), json!(7)],
        )
        .await
        .unwrap();

        // `title` becomes nullable, `legacy` is no longer declared and
        // `body` cannot be added in place.
        let after = fields(vec![
            ("title", FieldInput::new("Title", FieldType::String).indexed().nullable()),
            ("body", FieldInput::new("Body", FieldType::Text)),
        ]);
        let plan = plan_table(&runtime, "posts", &after).await.unwrap();
        assert!(plan.rebuild);
        apply_table_plan(&runtime, &plan, &after).await.unwrap();

        let columns = table_columns(&runtime, "posts").await.unwrap();
        assert!(columns["title"].nullable);
        assert!(columns.contains_key("body"));
        assert!(columns.contains_key("legacy"));

        let rows = pool
            .execute("SELECT id, title, legacy FROM posts", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["title"], json!("hello"));
        assert_eq!(rows[0]["legacy"], json!(7));

        let indexes = table_indexes(&runtime, "posts").await.unwrap();
        assert!(indexes.contains_key("idx_posts_title"));
        assert!(indexes.contains_key("idx_posts_state"));
        assert!(pool
            .execute(
                "SELECT name FROM sqlite_master WHERE name = '_oxide_sync_posts'",
                &[],
            )
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_empty_default_round_trip() {
        let (pool, dialect) = memory_runtime().await;
        let runtime = SyncRuntime::new(dialect, &pool, "main");
        let defs = fields(vec![(
            "name",
            FieldInput::new("Name", FieldType::String).max(50),
        )]);
        create_table(&runtime, "people", &defs).await.unwrap();

        let columns = table_columns(&runtime, "people").await.unwrap();
        let name = &columns["name"];
        assert!(!name.nullable);
        assert_eq!(
            normalize_live_default(name.default_value.as_deref()),
            Some(String::new())
        );
        assert!(!plan_table(&runtime, "people", &defs).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_sqlite_rebuild_keeps_expression_defaults() {
        let (pool, dialect) = memory_runtime().await;
        let runtime = SyncRuntime::new(dialect, &pool, "main");
        let before = fields(vec![("title", FieldInput::new("Title", FieldType::String))]);
        create_table(&runtime, "pages", &before).await.unwrap();
        pool.execute(
            "ALTER TABLE pages ADD COLUMN stamp TEXT DEFAULT (datetime('now'))",
            &[],
        )
        .await
        .unwrap();
        pool.execute("INSERT INTO pages (title) VALUES ('first')", &[])
            .await
            .unwrap();

        let after = fields(vec![(
            "title",
            FieldInput::new("Title", FieldType::String).nullable(),
        )]);
        let plan = plan_table(&runtime, "pages", &after).await.unwrap();
        assert!(plan.rebuild);
        apply_table_plan(&runtime, &plan, &after).await.unwrap();

        // A second rebuild must accept the restored default as well.
        let again = fields(vec![("title", FieldInput::new("Title", FieldType::String))]);
        let plan = plan_table(&runtime, "pages", &again).await.unwrap();
        assert!(plan.rebuild);
        apply_table_plan(&runtime, &plan, &again).await.unwrap();

        pool.execute("INSERT INTO pages (title) VALUES ('second')", &[])
            .await
            .unwrap();
        let rows = pool
            .execute("SELECT title, stamp FROM pages ORDER BY id", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row["stamp"].is_string()));
    }

    #[tokio::test]
    async fn test_multi_column_indexes_are_left_alone() {
        let (pool, dialect) = memory_runtime().await;
        let runtime = SyncRuntime::new(dialect, &pool, "main");
        let before = fields(vec![
            ("title", FieldInput::new("Title", FieldType::String).indexed()),
            ("body", FieldInput::new("Body", FieldType::String)),
        ]);
        create_table(&runtime, "posts", &before).await.unwrap();
        pool.execute(
            "CREATE INDEX \"idx_posts_title_state\" ON \"posts\" (\"title\", \"state\")",
            &[],
        )
        .await
        .unwrap();
        // Same name as the index `body` would get, but over two columns.
        pool.execute(
            "CREATE INDEX \"idx_posts_body\" ON \"posts\" (\"body\", \"state\")",
            &[],
        )
        .await
        .unwrap();
        pool.execute("INSERT INTO posts (title, body) VALUES ('a', 'b')", &[])
            .await
            .unwrap();

        let after = fields(vec![
            ("title", FieldInput::new("Title", FieldType::String).nullable()),
            ("body", FieldInput::new("Body", FieldType::String)),
        ]);
        let plan = plan_table(&runtime, "posts", &after).await.unwrap();
        assert!(plan.rebuild);
        assert_eq!(
            plan.index_actions,
            vec![IndexStep {
                action: IndexAction::Drop,
                index_name: "idx_posts_title".to_string(),
                field: "title".to_string(),
            }]
        );
        apply_table_plan(&runtime, &plan, &after).await.unwrap();

        let indexes = all_table_indexes(&runtime, "posts").await.unwrap();
        assert_eq!(indexes["idx_posts_title_state"], vec!["title", "state"]);
        assert_eq!(indexes["idx_posts_body"], vec!["body", "state"]);
        assert!(!indexes.contains_key("idx_posts_title"));
        assert!(!plan_table(&runtime, "posts", &after).await.unwrap().changed);
    }
}
