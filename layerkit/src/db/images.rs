//! Image tag rows.

use rusqlite::OptionalExtension;

use layerkit_shared::errors::{LayerkitError, LayerkitResult};

use super::{Database, db_err};
use crate::images::ImageRecord;

#[derive(Clone)]
pub struct ImageRecordStore {
    db: Database,
}

impl ImageRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Point `record.name` at a new image, replacing any previous one.
    pub fn put(&self, record: &ImageRecord) -> LayerkitResult<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT OR REPLACE INTO images (name, manifest_digest, config_digest, json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                record.name,
                record.manifest_digest.as_str(),
                record.config_digest.as_str(),
                json,
                record.created_at.to_rfc3339(),
            ],
        ))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> LayerkitResult<Option<ImageRecord>> {
        let conn = self.db.conn();
        let json: Option<String> = db_err!(
            conn.query_row("SELECT json FROM images WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()
        )?;
        json.map(|j| serde_json::from_str(&j).map_err(LayerkitError::from))
            .transpose()
    }

    /// Records ordered by name.
    pub fn list(&self) -> LayerkitResult<Vec<ImageRecord>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare("SELECT json FROM images ORDER BY name"))?;
        let rows = db_err!(stmt.query_map([], |row| row.get::<_, String>(0)))?;

        let mut records = Vec::new();
        for row in rows {
            let json = db_err!(row)?;
            records.push(serde_json::from_str(&json)?);
        }
        Ok(records)
    }

    pub fn remove(&self, name: &str) -> LayerkitResult<bool> {
        let conn = self.db.conn();
        let rows = db_err!(conn.execute("DELETE FROM images WHERE name = ?1", [name]))?;
        Ok(rows > 0)
    }
}
