//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS credential_providers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            config_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS destinations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            config_json TEXT NOT NULL,
            credential_provider_id INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (credential_provider_id) REFERENCES credential_providers(id)
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            source_type TEXT NOT NULL,
            source_config_json TEXT NOT NULL,
            schedule TEXT,
            retention_days INTEGER NOT NULL DEFAULT 30,
            retry_count INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            credential_provider_id INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (credential_provider_id) REFERENCES credential_providers(id)
        );

        CREATE TABLE IF NOT EXISTS job_destinations (
            job_id INTEGER NOT NULL,
            destination_id INTEGER NOT NULL,
            PRIMARY KEY (job_id, destination_id),
            FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE,
            FOREIGN KEY (destination_id) REFERENCES destinations(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS backup_history (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            job_id INTEGER NOT NULL,
            destination_id INTEGER,
            trigger TEXT NOT NULL DEFAULT 'manual',
            status TEXT NOT NULL DEFAULT 'pending',
            attempt INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            heartbeat_at TEXT,
            file_size INTEGER,
            file_path TEXT,
            error_message TEXT,
            execution_log TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE (run_id, destination_id)
        );

        CREATE INDEX IF NOT EXISTS idx_history_run ON backup_history(run_id);
        CREATE INDEX IF NOT EXISTS idx_history_job ON backup_history(job_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_history_status ON backup_history(status);",
    )?;

    Ok(())
}
