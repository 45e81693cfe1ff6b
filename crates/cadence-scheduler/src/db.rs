use rusqlite::Connection;

use crate::error::StoreResult;

/// Initialise the store schema in `conn`.
///
/// Rows carry their full JSON body; the extra columns exist only so the
/// acquisition and lookup queries can use indexes.
pub fn init_db(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            job_group   TEXT    NOT NULL,
            job_name    TEXT    NOT NULL,
            body        TEXT    NOT NULL,   -- JSON-encoded JobDetail
            PRIMARY KEY (job_group, job_name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS triggers (
            trigger_group   TEXT    NOT NULL,
            trigger_name    TEXT    NOT NULL,
            job_group       TEXT    NOT NULL,
            job_name        TEXT    NOT NULL,
            state           TEXT    NOT NULL,
            next_fire_ms    INTEGER,            -- NULL once exhausted
            priority        INTEGER NOT NULL,
            calendar_name   TEXT,
            body            TEXT    NOT NULL,   -- JSON-encoded StoredTrigger
            PRIMARY KEY (trigger_group, trigger_name)
        ) STRICT;

        -- Acquisition: WHERE state = 'waiting' AND next_fire_ms <= ? ORDER BY next_fire_ms, priority DESC
        CREATE INDEX IF NOT EXISTS idx_triggers_due
            ON triggers (state, next_fire_ms, priority DESC);
        CREATE INDEX IF NOT EXISTS idx_triggers_job ON triggers (job_group, job_name);
        CREATE INDEX IF NOT EXISTS idx_triggers_calendar ON triggers (calendar_name);

        CREATE TABLE IF NOT EXISTS calendars (
            name    TEXT    NOT NULL PRIMARY KEY,
            body    TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS paused_trigger_groups (
            trigger_group   TEXT    NOT NULL PRIMARY KEY
        ) STRICT;

        CREATE TABLE IF NOT EXISTS fired_triggers (
            entry_id        TEXT    NOT NULL PRIMARY KEY,
            instance_id     TEXT    NOT NULL,
            job_group       TEXT    NOT NULL,
            job_name        TEXT    NOT NULL,
            body            TEXT    NOT NULL    -- JSON-encoded FiredTriggerRecord
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_fired_instance ON fired_triggers (instance_id);
        CREATE INDEX IF NOT EXISTS idx_fired_job ON fired_triggers (job_group, job_name);

        CREATE TABLE IF NOT EXISTS scheduler_state (
            instance_id         TEXT    NOT NULL PRIMARY KEY,
            last_checkin_ms     INTEGER NOT NULL,
            checkin_interval_ms INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Initialise the lease table used by [`SqliteLock`](crate::lock::SqliteLock).
///
/// Leases live in their own database file so that taking or renewing one
/// never waits on a writer holding the data file.
pub fn init_lock_db(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cluster_locks (
            resource    TEXT    NOT NULL PRIMARY KEY,
            owner       TEXT    NOT NULL,
            token       TEXT    NOT NULL,
            expires_ms  INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Pragmas shared by the data and lock connections.
pub fn configure(conn: &Connection, busy_timeout_ms: u64) -> StoreResult<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout={busy_timeout_ms};"
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        init_lock_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
    }
}
