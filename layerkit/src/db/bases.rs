//! Imported base environment rows.

use rusqlite::OptionalExtension;

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use super::{Database, db_err};
use crate::bases::BaseRecord;

#[derive(Clone)]
pub struct BaseRecordStore {
    db: Database,
}

impl BaseRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn put(&self, record: &BaseRecord) -> LayerkitResult<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT OR REPLACE INTO bases (reference, name, layer_digest, json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                record.reference.to_string(),
                record.reference.name,
                record.layer.digest.as_str(),
                json,
                record.imported_at.to_rfc3339(),
            ],
        ))?;
        Ok(())
    }

    /// Look up by full reference string (`python:3.11-slim`).
    pub fn get(&self, reference: &str) -> LayerkitResult<Option<BaseRecord>> {
        self.query_one("SELECT json FROM bases WHERE reference = ?1", &[reference])
    }

    /// Look up by environment name and layer digest (`python@sha256:...`).
    pub fn find_by_layer(&self, name: &str, digest: &str) -> LayerkitResult<Option<BaseRecord>> {
        self.query_one(
            "SELECT json FROM bases WHERE name = ?1 AND layer_digest = ?2 ORDER BY reference LIMIT 1",
            &[name, digest],
        )
    }

    pub fn list(&self) -> LayerkitResult<Vec<BaseRecord>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare("SELECT json FROM bases ORDER BY reference"))?;
        let rows = db_err!(stmt.query_map([], |row| row.get::<_, String>(0)))?;

        let mut records = Vec::new();
        for row in rows {
            let json = db_err!(row)?;
            records.push(serde_json::from_str(&json)?);
        }
        Ok(records)
    }

    fn query_one(&self, sql: &str, params: &[&str]) -> LayerkitResult<Option<BaseRecord>> {
        let conn = self.db.conn();
        let json: Option<String> = db_err!(
            conn.query_row(sql, rusqlite::params_from_iter(params.iter()), |row| {
                row.get(0)
            })
            .optional()
        )?;
        json.map(|j| serde_json::from_str(&j).map_err(LayerkitError::from))
            .transpose()
    }
}
