use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::Result;

/// Ordered schema migrations. Append only; never edit a shipped entry.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT    NOT NULL UNIQUE,
            app_name        TEXT    NOT NULL,
            schedule        TEXT    NOT NULL,   -- cron expression
            region          TEXT    NOT NULL DEFAULT '',
            command         TEXT    NOT NULL,
            command_timeout INTEGER NOT NULL DEFAULT 30,
            enabled         INTEGER NOT NULL DEFAULT 0,
            config          TEXT    NOT NULL DEFAULT '{}'  -- JSON machine config
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            schedule_id INTEGER NOT NULL REFERENCES schedules (id) ON DELETE CASCADE,
            status      TEXT    NOT NULL DEFAULT 'pending',
            machine_id  TEXT,
            exit_code   INTEGER,
            stdout      TEXT,
            stderr      TEXT,
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL,
            finished_at TEXT
        );
        ",
    ),
    (
        2,
        "
        -- Monitor and reconciler scan by status; reconciler looks up by machine.
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
        CREATE INDEX IF NOT EXISTS idx_jobs_machine_id ON jobs (machine_id);
        CREATE INDEX IF NOT EXISTS idx_jobs_schedule_id ON jobs (schedule_id, id);
        ",
    ),
];

/// Open the state database with the pragmas every role relies on.
///
/// WAL lets the cron-triggered engine, the monitor and the API each hold
/// their own connection; the busy timeout serialises their writes.
pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/// Apply pending migrations. Safe to call on every startup (idempotent).
///
/// Returns the number of migrations applied by this call.
pub fn init_db(conn: &Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT    NOT NULL
        );",
    )?;

    let mut applied = 0;
    for (version, sql) in MIGRATIONS {
        let exists = conn
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_some() {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now()],
        )?;
        tx.commit()?;
        applied += 1;
    }

    if applied > 0 {
        info!(count = applied, "applied database migrations");
    }
    Ok(applied)
}
