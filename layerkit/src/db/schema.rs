//! SQL schema for the layerkit database, as numbered migrations.

/// A schema change applied once, in version order.
pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Step cache: one row per chained cache key.
const BUILD_CACHE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS build_cache (
    key TEXT PRIMARY KEY NOT NULL,
    step TEXT NOT NULL,
    created_by TEXT NOT NULL,
    json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// Committed images by tag.
const IMAGES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS images (
    name TEXT PRIMARY KEY NOT NULL,
    manifest_digest TEXT NOT NULL,
    config_digest TEXT NOT NULL,
    json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_images_manifest ON images(manifest_digest);
";

/// Imported base environments.
const BASES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS bases (
    reference TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    layer_digest TEXT NOT NULL,
    json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bases_layer ON bases(layer_digest);
";

/// Never edit a released migration; append a new one.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "build_cache",
        sql: BUILD_CACHE_TABLE,
    },
    Migration {
        version: 2,
        name: "images",
        sql: IMAGES_TABLE,
    },
    Migration {
        version: 3,
        name: "bases",
        sql: BASES_TABLE,
    },
];

pub fn latest_version() -> i32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}
