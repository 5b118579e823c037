//! Error types for schema synchronization.

use std::path::PathBuf;

/// Errors that can occur while synchronizing table schemas.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A required field of the invocation context is missing.
    #[error("Missing required context field: {0}")]
    MissingContext(&'static str),

    /// The configured dialect is not one of mysql, postgres or sqlite.
    #[error("Unknown database dialect '{0}'")]
    UnknownDialect(String),

    /// A table item carries a source tag other than app, addon or core.
    #[error("Unknown table source '{source_tag}' for '{file_name}'")]
    UnknownSource {
        /// The offending source tag.
        source_tag: String,
        /// File the table definition came from.
        file_name: String,
    },

    /// An addon table was supplied without its addon name.
    #[error("Addon table '{0}' is missing its addon name")]
    MissingAddonName(String),

    /// The database server is older than the supported minimum.
    #[error("{dialect} {found} is not supported, at least {required} is required")]
    UnsupportedVersion {
        /// Dialect name.
        dialect: &'static str,
        /// Version reported by the server.
        found: String,
        /// Minimum supported version.
        required: &'static str,
    },

    /// The server version string could not be parsed.
    #[error("Could not parse {dialect} version from '{raw}'")]
    UnparsableVersion {
        /// Dialect name.
        dialect: &'static str,
        /// Raw version string.
        raw: String,
    },

    /// A generated identifier failed validation.
    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    /// A column type change that would narrow or reinterpret existing data.
    #[error(
        "Refusing to change {table}.{field} from '{current}' to '{expected}': \
         only widening type changes are applied automatically"
    )]
    IncompatibleTypeChange {
        /// Table name.
        table: String,
        /// Field (column) name.
        field: String,
        /// Live column type.
        current: String,
        /// Requested column type.
        expected: String,
    },

    /// A field definition cannot be turned into DDL.
    #[error("Invalid definition for {table}.{field}: {message}")]
    InvalidDefinition {
        /// Table name (or file name when loading).
        table: String,
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },

    /// A DDL statement failed; for MySQL, after every fallback was exhausted.
    #[error("Statement failed on table '{table}': {message}")]
    Execution {
        /// Table the statement targeted.
        table: String,
        /// Error message.
        message: String,
    },

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error while reading definition files.
    #[error("IO error on '{path}': {source}")]
    Io {
        /// File or directory being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
