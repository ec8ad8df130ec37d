//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order. A
//! `schema_migrations` table tracks which versions have been applied.

use rusqlite::Connection;
use reel_core::{Error, Result};

/// V1: asset status, stream variants and image derivatives.
const V1_INITIAL: &str = r#"
CREATE TABLE media_assets (
    entity_id      TEXT NOT NULL,
    kind           TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'PENDING',
    job_id         TEXT,
    diagnostic     TEXT,
    master_locator TEXT,
    duration_secs  REAL,
    source_width   INTEGER,
    source_height  INTEGER,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    PRIMARY KEY (entity_id, kind)
);

CREATE INDEX idx_media_assets_status ON media_assets(status);

CREATE TABLE stream_variants (
    entity_id     TEXT NOT NULL,
    kind          TEXT NOT NULL,
    variant_index INTEGER NOT NULL,
    width         INTEGER NOT NULL,
    height        INTEGER NOT NULL,
    bitrate_kbps  INTEGER NOT NULL,
    locator       TEXT NOT NULL,
    PRIMARY KEY (entity_id, kind, variant_index),
    FOREIGN KEY (entity_id, kind) REFERENCES media_assets(entity_id, kind) ON DELETE CASCADE
);

CREATE TABLE derivatives (
    entity_id       TEXT NOT NULL,
    kind            TEXT NOT NULL,
    position        INTEGER NOT NULL,
    width           INTEGER NOT NULL,
    height          INTEGER NOT NULL,
    derivative_kind TEXT NOT NULL,
    locator         TEXT NOT NULL,
    PRIMARY KEY (entity_id, kind, position),
    FOREIGN KEY (entity_id, kind) REFERENCES media_assets(entity_id, kind) ON DELETE CASCADE
);
"#;

/// V2: which instance holds a PROCESSING row, and until when (unix millis).
const V2_PROCESSING_LEASE: &str = r#"
ALTER TABLE media_assets ADD COLUMN owner_id TEXT;
ALTER TABLE media_assets ADD COLUMN lease_expires_at INTEGER;
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL), (2, V2_PROCESSING_LEASE)];

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies each outstanding migration inside a transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }

    #[test]
    fn lease_columns_exist() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO media_assets (entity_id, kind, owner_id, lease_expires_at, created_at, updated_at)
             VALUES ('clip', 'video', 'a', 0, '', '')",
            [],
        )
        .unwrap();
    }
}
