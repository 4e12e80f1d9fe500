//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "migrated chunk store schema");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per (origin, channel, era)
        CREATE TABLE chunks (
            origin TEXT NOT NULL,             -- '' for local content, else end-to-end sender
            uri TEXT NOT NULL,
            era INTEGER NOT NULL,             -- u32 era value
            meta BLOB NOT NULL,               -- CBOR ChannelMeta
            hops BLOB NOT NULL,               -- CBOR Vec<Hop>
            PRIMARY KEY (origin, uri, era)
        );

        CREATE INDEX idx_chunks_era ON chunks(origin, era);
        CREATE INDEX idx_chunks_uri ON chunks(uri);

        -- Message bodies in append order
        CREATE TABLE messages (
            origin TEXT NOT NULL,
            uri TEXT NOT NULL,
            era INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            body BLOB NOT NULL,
            PRIMARY KEY (origin, uri, era, seq)
        );

        -- Delivery bookkeeping, insert-only
        CREATE TABLE deliveries (
            origin TEXT NOT NULL,
            uri TEXT NOT NULL,
            era INTEGER NOT NULL,
            peer TEXT NOT NULL,
            PRIMARY KEY (origin, uri, era, peer)
        );

        -- Engine state snapshots, one per format
        CREATE TABLE engine_state (
            format TEXT PRIMARY KEY,
            state BLOB NOT NULL,              -- CBOR EngineState
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
