//! SQL execution seam.
//!
//! The engine never opens or closes connections. It issues every statement
//! through a caller-supplied [`SqlExecutor`], which returns rows decoded into
//! JSON values. The trait is implemented for the three sqlx pool types.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Column, ColumnIndex, Decode, Type};
use tracing::debug;

use crate::error::Result;

/// One result row, keyed by column label.
pub type Row = serde_json::Map<String, Value>;

/// Runs raw SQL with positional parameters.
pub trait SqlExecutor: Sync {
    /// Executes `sql` and returns every produced row. DDL returns no rows.
    fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Result<Vec<Row>>> + Send;
}

impl<E: SqlExecutor> SqlExecutor for &E {
    fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Result<Vec<Row>>> + Send {
        (**self).execute(sql, params)
    }
}

/// Decodes column `idx` as `T`, or `None` if the column holds another type.
fn try_decode<'r, R, T>(row: &'r R, idx: usize) -> Option<Value>
where
    R: sqlx::Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database> + Into<Value>,
{
    row.try_get::<Option<T>, _>(idx)
        .ok()
        .map(|v| v.map_or(Value::Null, Into::into))
}

fn try_decode_bytes<'r, R>(row: &'r R, idx: usize) -> Option<Value>
where
    R: sqlx::Row,
    usize: ColumnIndex<R>,
    Vec<u8>: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<Vec<u8>>, _>(idx).ok().map(|v| {
        v.map_or(Value::Null, |bytes| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    })
}

fn collect_row<R: sqlx::Row>(row: &R, decode: impl Fn(&R, usize) -> Option<Value>) -> Row {
    row.columns()
        .iter()
        .map(|column| {
            let value = decode(row, column.ordinal()).unwrap_or(Value::Null);
            (column.name().to_string(), value)
        })
        .collect()
}

fn decode_sqlite(row: &SqliteRow) -> Row {
    collect_row(row, |row, i| {
        try_decode::<_, i64>(row, i)
            .or_else(|| try_decode::<_, f64>(row, i))
            .or_else(|| try_decode::<_, String>(row, i))
            .or_else(|| try_decode_bytes(row, i))
    })
}

fn decode_mysql(row: &MySqlRow) -> Row {
    collect_row(row, |row, i| {
        try_decode::<_, i64>(row, i)
            .or_else(|| try_decode::<_, u64>(row, i))
            .or_else(|| try_decode::<_, f64>(row, i))
            .or_else(|| try_decode::<_, String>(row, i))
            .or_else(|| try_decode_bytes(row, i))
    })
}

fn decode_postgres(row: &PgRow) -> Row {
    collect_row(row, |row, i| {
        try_decode::<_, i64>(row, i)
            .or_else(|| try_decode::<_, i32>(row, i))
            .or_else(|| try_decode::<_, i16>(row, i))
            .or_else(|| try_decode::<_, f64>(row, i))
            .or_else(|| try_decode::<_, bool>(row, i))
            .or_else(|| try_decode::<_, String>(row, i))
            .or_else(|| try_decode_bytes(row, i))
    })
}

macro_rules! impl_pool_executor {
    ($pool:ty, $decode:ident) => {
        impl SqlExecutor for $pool {
            fn execute(
                &self,
                sql: &str,
                params: &[Value],
            ) -> impl Future<Output = Result<Vec<Row>>> + Send {
                async move {
                    debug!(sql = %sql, params = params.len(), "Executing SQL");
                    // Parameterless statements go through the simple protocol so
                    // that DDL such as CREATE INDEX CONCURRENTLY is accepted.
                    let rows = if params.is_empty() {
                        sqlx::raw_sql(sql).fetch_all(self).await?
                    } else {
                        let mut query = sqlx::query(sql);
                        for param in params {
                            query = match param {
                                Value::Null => query.bind(None::<String>),
                                Value::Bool(b) => query.bind(*b),
                                Value::Number(n) => match n.as_i64() {
                                    Some(i) => query.bind(i),
                                    None => query.bind(n.as_f64().unwrap_or_default()),
                                },
                                Value::String(s) => query.bind(s.clone()),
                                other => query.bind(other.to_string()),
                            };
                        }
                        query.fetch_all(self).await?
                    };
                    Ok(rows.iter().map($decode).collect())
                }
            }
        }
    };
}

impl_pool_executor!(SqlitePool, decode_sqlite);
impl_pool_executor!(MySqlPool, decode_mysql);
impl_pool_executor!(PgPool, decode_postgres);

/// Returns true for statements that only read data or metadata.
pub(crate) fn is_read_only(sql: &str) -> bool {
    let head = sql.trim_start();
    ["SELECT", "WITH", "PRAGMA", "SHOW"]
        .iter()
        .any(|kw| head.len() >= kw.len() && head[..kw.len()].eq_ignore_ascii_case(kw))
}

/// Wraps an executor so that reads pass through and every other statement is
/// printed and recorded instead of executed.
pub struct DryRun<'a, E> {
    inner: &'a E,
    statements: Mutex<Vec<String>>,
}

impl<'a, E: SqlExecutor> DryRun<'a, E> {
    /// Creates a dry-run wrapper around `inner`.
    pub fn new(inner: &'a E) -> Self {
        Self {
            inner,
            statements: Mutex::new(Vec::new()),
        }
    }

    /// Statements that would have been executed, in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<E: SqlExecutor> SqlExecutor for DryRun<'_, E> {
    fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Result<Vec<Row>>> + Send {
        async move {
            if is_read_only(sql) {
                return self.inner.execute(sql, params).await;
            }
            println!("{sql};");
            self.statements
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(sql.to_string());
            Ok(Vec::new())
        }
    }
}
