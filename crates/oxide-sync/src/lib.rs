//! Declarative schema synchronization for MySQL, PostgreSQL and SQLite.
//!
//! `oxide-sync` reconciles a live database with file-based table definitions.
//! Each definition maps field keys to logical field definitions; missing
//! tables are created and existing ones are altered in place, without
//! hand-written migrations:
//! - Only widening type changes are applied; anything else aborts the run
//! - Columns are never dropped and never shrunk
//! - DDL is generated per dialect and applied with online strategies where
//!   the engine has them
//!
//! # Architecture
//!
//! - **Field** - Normalization of field definitions and default resolution
//! - **Dialect** - Quoting, type mapping, DDL and catalog queries per engine
//! - **Introspect** - Live columns, indexes and server version
//! - **Plan** - Diffing definitions against live columns
//! - **Apply** - Executing plans, including the SQLite table rebuild
//! - **Sync** - The orchestrator tying the above together
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_sync::prelude::*;
//!
//! let pool = sqlx::MySqlPool::connect("mysql://root@localhost/app").await?;
//! let config = SyncConfig::new("mysql", "app");
//! let ctx = SyncContext::new(&pool, &NoopCache, &config);
//!
//! let mut content = indexmap::IndexMap::new();
//! content.insert(
//!     "email".to_string(),
//!     FieldInput::new("Email", FieldType::String).max(100).unique(),
//! );
//! let report = sync_tables(&ctx, &[SyncItem::table(SyncSource::App, "users", content)]).await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Synchronize every definition in ./tables
//! oxide-sync --database sqlite:app.db --dialect sqlite --definitions tables
//!
//! # Print the DDL instead of running it
//! oxide-sync --database mysql://root@localhost/app --dialect mysql --dry-run
//! ```

pub mod apply;
pub mod cache;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod field;
pub mod introspect;
pub mod loader;
pub mod plan;
pub mod sync;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cache::{CacheInvalidator, NoopCache};
    pub use crate::dialect::{DialectKind, SyncDialect};
    pub use crate::error::{Result, SyncError};
    pub use crate::executor::{DryRun, SqlExecutor};
    pub use crate::field::{normalize, FieldDefinition, FieldInput, FieldType};
    pub use crate::loader::load_definitions;
    pub use crate::plan::{ChangeKind, FieldChange, TablePlan};
    pub use crate::sync::{
        sync_tables, sync_tables_dry_run, DbConfig, SyncConfig, SyncContext, SyncItem,
        SyncReport, SyncSource,
    };
}
