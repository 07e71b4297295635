pub mod cursors;
pub mod groups;
pub mod mailboxes;
pub mod notifications;
pub mod pool;
pub mod schema;

// Re-export the pool type so callers can do `use crate::store::DbPool`
// instead of `use crate::store::pool::DbPool`
pub use pool::DbPool;

use std::path::Path;

use crate::error::EngineError;

/// Open (or create) the engine database and apply the schema.
pub fn open(db_path: &Path) -> Result<DbPool, EngineError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::Database(format!("cannot create {}: {}", parent.display(), e)))?;
    }
    let pool = pool::create_pool(db_path)?;
    schema::initialize_schema(&*pool.get()?)?;
    Ok(pool)
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<DbPool, EngineError> {
    let pool = pool::create_memory_pool()?;
    schema::initialize_schema(&*pool.get()?)?;
    Ok(pool)
}
