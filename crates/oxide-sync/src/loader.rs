//! Loading table definitions from disk.
//!
//! Each `*.json` file in a directory holds one table: an object mapping field
//! keys to field definitions. The file stem becomes the item's file name.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::field::FieldInput;
use crate::sync::{SyncItem, SyncSource};

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SyncError + '_ {
    move |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Parses one definition file.
pub fn load_definition(path: &Path, addon: Option<&str>) -> Result<SyncItem> {
    let file_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| SyncError::InvalidDefinition {
            table: path.display().to_string(),
            field: String::new(),
            message: "file name is not valid UTF-8".to_string(),
        })?
        .to_string();
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    let content: IndexMap<String, FieldInput> =
        serde_json::from_str(&text).map_err(|err| SyncError::InvalidDefinition {
            table: file_name.clone(),
            field: String::new(),
            message: err.to_string(),
        })?;

    let item = match addon {
        Some(name) => SyncItem::table(SyncSource::Addon, file_name, content).with_addon(name),
        None => SyncItem::table(SyncSource::App, file_name, content),
    };
    debug!(file = %path.display(), fields = item.content.len(), "Loaded table definition");
    Ok(item)
}

/// Loads every `*.json` file in `dir`, sorted by file name. Items are tagged
/// as addon tables when `addon` is given.
pub fn load_definitions(dir: &Path, addon: Option<&str>) -> Result<Vec<SyncItem>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    paths
        .iter()
        .map(|path| load_definition(path, addon))
        .collect()
}
