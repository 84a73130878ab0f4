//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: statistics tables and the catalog mirror
    r#"
    -- ============================================
    -- Stored statistics, keyed by (entity, period)
    -- ============================================

    CREATE TABLE IF NOT EXISTS ga_url (
        url              TEXT NOT NULL,
        period_name      TEXT NOT NULL,
        pageviews        INTEGER NOT NULL DEFAULT 0,
        visits           INTEGER NOT NULL DEFAULT 0,
        package_id       TEXT,
        updated_at       TEXT NOT NULL,

        PRIMARY KEY (url, period_name)
    );

    CREATE TABLE IF NOT EXISTS ga_stat (
        stat_name        TEXT NOT NULL,
        key              TEXT NOT NULL,
        period_name      TEXT NOT NULL,
        value            INTEGER NOT NULL DEFAULT 0,
        updated_at       TEXT NOT NULL,

        PRIMARY KEY (stat_name, key, period_name)
    );

    CREATE TABLE IF NOT EXISTS ga_referrer (
        url              TEXT NOT NULL,
        period_name      TEXT NOT NULL,
        count            INTEGER NOT NULL DEFAULT 0,
        updated_at       TEXT NOT NULL,

        PRIMARY KEY (url, period_name)
    );

    -- ============================================
    -- Mirror of the host catalog's dataset identifiers
    -- ============================================

    CREATE TABLE IF NOT EXISTS catalog_packages (
        name             TEXT PRIMARY KEY,
        id               TEXT NOT NULL,
        title            TEXT NOT NULL
    );
    "#,
    // Version 2: lookup indexes, and integer values for rows imported from
    // the legacy schema where keyed stat values were decimal strings
    r#"
    CREATE INDEX IF NOT EXISTS idx_ga_url_period ON ga_url(period_name);
    CREATE INDEX IF NOT EXISTS idx_ga_url_package ON ga_url(package_id);
    CREATE INDEX IF NOT EXISTS idx_ga_stat_period ON ga_stat(period_name);
    CREATE INDEX IF NOT EXISTS idx_ga_stat_key ON ga_stat(stat_name, key);
    CREATE INDEX IF NOT EXISTS idx_ga_referrer_period ON ga_referrer(period_name);

    UPDATE ga_stat
    SET value = CAST(TRIM(value) AS INTEGER)
    WHERE typeof(value) = 'text';
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
