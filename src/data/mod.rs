pub mod migrations;
pub mod repository;
pub mod tag_store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;

const DATABASE_FILE: &str = "marksmith.db";

/// Platform data directory for the engine's SQLite file, e.g.
/// `~/.local/share/marksmith/marksmith.db` on Linux.
pub fn default_database_path() -> Result<PathBuf, AppError> {
    let dirs = directories::ProjectDirs::from("dev", "marksmith", "marksmith")
        .ok_or_else(|| AppError::Config("failed to resolve app data dir".to_string()))?;
    Ok(dirs.data_dir().join(DATABASE_FILE))
}

pub fn open_database(path: &Path) -> Result<rusqlite::Connection, AppError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}
