//! Step cache rows.

use chrono::Utc;
use rusqlite::OptionalExtension;

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use super::{Database, db_err};
use crate::cache::CachedStep;

#[derive(Clone)]
pub struct CacheStore {
    db: Database,
}

impl CacheStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, key: &str) -> LayerkitResult<Option<CachedStep>> {
        let conn = self.db.conn();
        let json: Option<String> = db_err!(
            conn.query_row(
                "SELECT json FROM build_cache WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
        )?;
        json.map(|j| serde_json::from_str(&j).map_err(LayerkitError::from))
            .transpose()
    }

    /// Insert or replace the entry for `key`.
    pub fn put(&self, key: &str, step: &CachedStep) -> LayerkitResult<()> {
        let json = serde_json::to_string(step)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT OR REPLACE INTO build_cache (key, step, created_by, json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![key, step.step, step.created_by, json, now],
        ))?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> LayerkitResult<bool> {
        let conn = self.db.conn();
        let rows = db_err!(conn.execute("DELETE FROM build_cache WHERE key = ?1", [key]))?;
        Ok(rows > 0)
    }

    pub fn count(&self) -> LayerkitResult<u64> {
        let conn = self.db.conn();
        let n: i64 = db_err!(conn.query_row("SELECT COUNT(*) FROM build_cache", [], |row| {
            row.get(0)
        }))?;
        Ok(n as u64)
    }
}
