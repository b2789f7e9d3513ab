//! SQLite indexes for layerkit.
//!
//! The database holds the small mutable indexes: the step cache, image
//! tags and imported bases. Content lives in the blob store. Each row
//! keeps its record as JSON next to the columns that are queried.
//!
//! The schema is a list of numbered migrations (`schema::MIGRATIONS`).
//! Opening a home applies the ones it has not seen yet in one transaction.

mod bases;
mod cache;
mod images;
mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

pub use bases::BaseRecordStore;
pub use cache::CacheStore;
pub use images::ImageRecordStore;

/// Map a rusqlite error into `LayerkitError::Database`.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| LayerkitError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

/// Shared connection to `<home>/db/layerkit.db`.
///
/// `CacheStore`, `ImageRecordStore` and `BaseRecordStore` each wrap a clone.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database and bring its schema up to date.
    pub fn open(db_path: &Path) -> LayerkitResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = db_err!(Connection::open(db_path))?;
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            "
        ))?;

        let version = migrate(&mut conn)?;
        tracing::debug!(path = %db_path.display(), schema_version = version, "Opened database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Schema version recorded in the database (0 before any migration).
    pub fn schema_version(&self) -> LayerkitResult<i32> {
        Ok(recorded_version(&self.conn())?.unwrap_or(0))
    }
}

fn recorded_version(conn: &Connection) -> LayerkitResult<Option<i32>> {
    db_err!(
        conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
    )
}

/// Apply pending migrations and return the resulting schema version.
fn migrate(conn: &mut Connection) -> LayerkitResult<i32> {
    db_err!(conn.execute_batch(schema::VERSION_TABLE))?;
    let current = recorded_version(conn)?.unwrap_or(0);
    let latest = schema::latest_version();
    if current > latest {
        return Err(LayerkitError::Database(format!(
            "database schema version {} is newer than supported {}, upgrade layerkit",
            current, latest
        )));
    }
    if current == latest {
        return Ok(current);
    }

    let tx = db_err!(conn.transaction())?;
    for migration in schema::MIGRATIONS.iter().filter(|m| m.version > current) {
        db_err!(tx.execute_batch(migration.sql))?;
        tracing::info!(
            version = migration.version,
            migration = migration.name,
            "Applied database migration"
        );
    }
    db_err!(tx.execute(
        "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
        rusqlite::params![latest, Utc::now().to_rfc3339()],
    ))?;
    db_err!(tx.commit())?;
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table_exists(db: &Database, name: &str) -> bool {
        db.conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get::<_, i64>(0),
            )
            .unwrap()
            == 1
    }

    #[test]
    fn test_db_open_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("db/layerkit.db");
        drop(Database::open(&db_path).unwrap());
        let db = Database::open(&db_path).unwrap();

        assert_eq!(db.schema_version().unwrap(), schema::latest_version());
        for table in ["build_cache", "images", "bases"] {
            assert!(table_exists(&db, table), "{}", table);
        }
    }

    #[test]
    fn test_older_home_is_migrated_forward() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("layerkit.db");
        let db = Database::open(&db_path).unwrap();
        db.conn()
            .execute_batch("DROP TABLE bases; UPDATE schema_version SET version = 2 WHERE id = 1;")
            .unwrap();
        drop(db);

        let db = Database::open(&db_path).unwrap();
        assert!(table_exists(&db, "bases"));
        assert_eq!(db.schema_version().unwrap(), 3);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("layerkit.db");
        let db = Database::open(&db_path).unwrap();
        db.conn()
            .execute("UPDATE schema_version SET version = 99 WHERE id = 1", [])
            .unwrap();
        drop(db);

        let err = Database::open(&db_path).err().unwrap();
        assert!(matches!(err, LayerkitError::Database(_)));
    }
}
