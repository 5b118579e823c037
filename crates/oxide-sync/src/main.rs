//! oxide-sync CLI
//!
//! Synchronizes a database schema with the table definitions in a directory.

use std::path::PathBuf;

use clap::Parser;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_sync::prelude::*;

/// Declarative schema synchronization for MySQL, PostgreSQL and SQLite.
#[derive(Parser)]
#[command(name = "oxide-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL.
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Database dialect (mysql, postgres or sqlite).
    #[arg(long, env = "OXIDE_SYNC_DIALECT", default_value = "sqlite")]
    dialect: DialectKind,

    /// Database (catalog) name. Required for mysql and postgres.
    #[arg(short = 'n', long, env = "OXIDE_SYNC_DATABASE")]
    schema_name: Option<String>,

    /// Directory holding one JSON definition file per table.
    #[arg(long, default_value = "tables")]
    definitions: PathBuf,

    /// Treat the definitions as tables of this addon.
    #[arg(long)]
    addon: Option<String>,

    /// Show SQL without executing (dry run).
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

async fn run<E: SqlExecutor>(
    executor: &E,
    config: &SyncConfig,
    items: &[SyncItem],
    dry_run: bool,
) -> anyhow::Result<()> {
    let ctx = SyncContext::new(executor, &NoopCache, config);
    if dry_run {
        info!("Dry run mode - SQL will be printed but not executed.");
        let (report, statements) = sync_tables_dry_run(&ctx, items).await?;
        info!(
            statements = statements.len(),
            created = report.created.len(),
            modified = report.modified.len(),
            "Dry run finished"
        );
    } else {
        let report = sync_tables(&ctx, items).await?;
        for table in &report.created {
            println!(" [+] {table}");
        }
        for table in &report.modified {
            println!(" [~] {table}");
        }
        for table in &report.unchanged {
            println!(" [=] {table}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let items = load_definitions(&cli.definitions, cli.addon.as_deref())?;
    info!(
        tables = items.len(),
        dir = %cli.definitions.display(),
        "Loaded table definitions"
    );

    let config = SyncConfig {
        db: Some(DbConfig {
            dialect: Some(cli.dialect.to_string()),
            database: cli.schema_name.clone(),
        }),
    };

    // Connect to database
    match cli.dialect {
        DialectKind::Sqlite => {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect(&cli.database)
                .await?;
            run(&pool, &config, &items, cli.dry_run).await?;
            pool.close().await;
        }
        DialectKind::MySql => {
            let pool = MySqlPoolOptions::new()
                .max_connections(2)
                .connect(&cli.database)
                .await?;
            run(&pool, &config, &items, cli.dry_run).await?;
            pool.close().await;
        }
        DialectKind::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(&cli.database)
                .await?;
            run(&pool, &config, &items, cli.dry_run).await?;
            pool.close().await;
        }
    }

    Ok(())
}
