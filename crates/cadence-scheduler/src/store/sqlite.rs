use std::sync::Mutex;

use cadence_core::{JobKey, TriggerKey};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use tracing::info;

use super::backend::{StoreBackend, StoreTx};
use crate::calendar::Calendar;
use crate::db::{configure, init_db};
use crate::error::{StoreError, StoreResult};
use crate::job::JobDetail;
use crate::types::{FiredTriggerRecord, SchedulerStateRecord, StoredTrigger, TriggerState};

/// Rows persisted in a SQLite database file.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &str, busy_timeout_ms: u64) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        configure(&conn, busy_timeout_ms)?;
        info!(path, "sqlite job store opened");
        Self::from_connection(conn)
    }

    /// Wrap an already configured connection, creating the schema if needed.
    pub fn from_connection(conn: Connection) -> StoreResult<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StoreBackend for SqliteBackend {
    fn transaction<T>(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTx) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        // IMMEDIATE takes the write lock up front so two nodes never both
        // read a trigger as WAITING and then race to acquire it.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&mut SqliteTx { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

struct SqliteTx<'c> {
    conn: &'c Connection,
}

fn decode<T: DeserializeOwned>(body: &str) -> StoreResult<T> {
    Ok(serde_json::from_str(body)?)
}

fn millis(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp_millis())
}

impl SqliteTx<'_> {
    fn bodies<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<T>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(decode(&body?)?);
        }
        Ok(out)
    }

    fn body<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Option<T>> {
        let body: Option<String> = self
            .conn
            .prepare_cached(sql)?
            .query_row(params, |row| row.get(0))
            .optional()?;
        body.as_deref().map(decode).transpose()
    }

    fn strings(&self, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn key_pairs(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

impl StoreTx for SqliteTx<'_> {
    fn job(&mut self, key: &JobKey) -> StoreResult<Option<JobDetail>> {
        self.body(
            "SELECT body FROM jobs WHERE job_group = ?1 AND job_name = ?2",
            params![key.group, key.name],
        )
    }

    fn put_job(&mut self, job: &JobDetail) -> StoreResult<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO jobs (job_group, job_name, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT (job_group, job_name) DO UPDATE SET body = excluded.body",
            )?
            .execute(params![job.key.group, job.key.name, serde_json::to_string(job)?])?;
        Ok(())
    }

    fn delete_job(&mut self, key: &JobKey) -> StoreResult<bool> {
        let n = self
            .conn
            .prepare_cached("DELETE FROM jobs WHERE job_group = ?1 AND job_name = ?2")?
            .execute(params![key.group, key.name])?;
        Ok(n > 0)
    }

    fn job_keys(&mut self, group: Option<&str>) -> StoreResult<Vec<JobKey>> {
        let pairs = self.key_pairs(
            "SELECT job_group, job_name FROM jobs
             WHERE ?1 IS NULL OR job_group = ?1
             ORDER BY job_group, job_name",
            params![group],
        )?;
        Ok(pairs
            .into_iter()
            .map(|(group, name)| JobKey::new(name, group))
            .collect())
    }

    fn trigger(&mut self, key: &TriggerKey) -> StoreResult<Option<StoredTrigger>> {
        self.body(
            "SELECT body FROM triggers WHERE trigger_group = ?1 AND trigger_name = ?2",
            params![key.group, key.name],
        )
    }

    fn put_trigger(&mut self, st: &StoredTrigger) -> StoreResult<()> {
        let t = &st.trigger;
        self.conn
            .prepare_cached(
                "INSERT INTO triggers
                 (trigger_group, trigger_name, job_group, job_name, state,
                  next_fire_ms, priority, calendar_name, body)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                 ON CONFLICT (trigger_group, trigger_name) DO UPDATE SET
                    job_group = excluded.job_group,
                    job_name = excluded.job_name,
                    state = excluded.state,
                    next_fire_ms = excluded.next_fire_ms,
                    priority = excluded.priority,
                    calendar_name = excluded.calendar_name,
                    body = excluded.body",
            )?
            .execute(params![
                t.key.group,
                t.key.name,
                t.job_key.group,
                t.job_key.name,
                st.state.to_string(),
                millis(t.next_fire_time),
                t.priority,
                t.calendar_name,
                serde_json::to_string(st)?,
            ])?;
        Ok(())
    }

    fn delete_trigger(&mut self, key: &TriggerKey) -> StoreResult<bool> {
        let n = self
            .conn
            .prepare_cached("DELETE FROM triggers WHERE trigger_group = ?1 AND trigger_name = ?2")?
            .execute(params![key.group, key.name])?;
        Ok(n > 0)
    }

    fn trigger_keys(&mut self, group: Option<&str>) -> StoreResult<Vec<TriggerKey>> {
        let pairs = self.key_pairs(
            "SELECT trigger_group, trigger_name FROM triggers
             WHERE ?1 IS NULL OR trigger_group = ?1
             ORDER BY trigger_group, trigger_name",
            params![group],
        )?;
        Ok(pairs
            .into_iter()
            .map(|(group, name)| TriggerKey::new(name, group))
            .collect())
    }

    fn triggers_for_job(&mut self, key: &JobKey) -> StoreResult<Vec<StoredTrigger>> {
        self.bodies(
            "SELECT body FROM triggers WHERE job_group = ?1 AND job_name = ?2
             ORDER BY trigger_group, trigger_name",
            params![key.group, key.name],
        )
    }

    fn triggers_for_calendar(&mut self, name: &str) -> StoreResult<Vec<StoredTrigger>> {
        self.bodies(
            "SELECT body FROM triggers WHERE calendar_name = ?1
             ORDER BY trigger_group, trigger_name",
            params![name],
        )
    }

    fn triggers_in_state(&mut self, state: TriggerState) -> StoreResult<Vec<StoredTrigger>> {
        self.bodies(
            "SELECT body FROM triggers WHERE state = ?1 ORDER BY trigger_group, trigger_name",
            params![state.to_string()],
        )
    }

    fn waiting_triggers_due(
        &mut self,
        no_later_than: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<StoredTrigger>> {
        // LIMIT -1 is "no limit" in SQLite.
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        self.bodies(
            "SELECT body FROM triggers
             WHERE state = 'waiting' AND next_fire_ms IS NOT NULL AND next_fire_ms <= ?1
             ORDER BY next_fire_ms ASC, priority DESC, trigger_group, trigger_name
             LIMIT ?2",
            params![no_later_than.timestamp_millis(), limit],
        )
    }

    fn calendar(&mut self, name: &str) -> StoreResult<Option<Calendar>> {
        self.body("SELECT body FROM calendars WHERE name = ?1", params![name])
    }

    fn put_calendar(&mut self, name: &str, calendar: &Calendar) -> StoreResult<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO calendars (name, body) VALUES (?1, ?2)
                 ON CONFLICT (name) DO UPDATE SET body = excluded.body",
            )?
            .execute(params![name, serde_json::to_string(calendar)?])?;
        Ok(())
    }

    fn delete_calendar(&mut self, name: &str) -> StoreResult<bool> {
        let n = self
            .conn
            .prepare_cached("DELETE FROM calendars WHERE name = ?1")?
            .execute(params![name])?;
        Ok(n > 0)
    }

    fn calendar_names(&mut self) -> StoreResult<Vec<String>> {
        self.strings("SELECT name FROM calendars ORDER BY name", [])
    }

    fn paused_groups(&mut self) -> StoreResult<Vec<String>> {
        self.strings(
            "SELECT trigger_group FROM paused_trigger_groups ORDER BY trigger_group",
            [],
        )
    }

    fn add_paused_group(&mut self, group: &str) -> StoreResult<()> {
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO paused_trigger_groups (trigger_group) VALUES (?1)")?
            .execute(params![group])?;
        Ok(())
    }

    fn remove_paused_group(&mut self, group: &str) -> StoreResult<()> {
        self.conn
            .prepare_cached("DELETE FROM paused_trigger_groups WHERE trigger_group = ?1")?
            .execute(params![group])?;
        Ok(())
    }

    fn fired(&mut self, entry_id: &str) -> StoreResult<Option<FiredTriggerRecord>> {
        self.body(
            "SELECT body FROM fired_triggers WHERE entry_id = ?1",
            params![entry_id],
        )
    }

    fn put_fired(&mut self, record: &FiredTriggerRecord) -> StoreResult<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO fired_triggers (entry_id, instance_id, job_group, job_name, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (entry_id) DO UPDATE SET
                    instance_id = excluded.instance_id,
                    body = excluded.body",
            )?
            .execute(params![
                record.entry_id,
                record.instance_id,
                record.job_key.group,
                record.job_key.name,
                serde_json::to_string(record)?,
            ])?;
        Ok(())
    }

    fn delete_fired(&mut self, entry_id: &str) -> StoreResult<bool> {
        let n = self
            .conn
            .prepare_cached("DELETE FROM fired_triggers WHERE entry_id = ?1")?
            .execute(params![entry_id])?;
        Ok(n > 0)
    }

    fn fired_records(&mut self, instance_id: Option<&str>) -> StoreResult<Vec<FiredTriggerRecord>> {
        self.bodies(
            "SELECT body FROM fired_triggers WHERE ?1 IS NULL OR instance_id = ?1 ORDER BY entry_id",
            params![instance_id],
        )
    }

    fn fired_for_job(&mut self, key: &JobKey) -> StoreResult<Vec<FiredTriggerRecord>> {
        self.bodies(
            "SELECT body FROM fired_triggers WHERE job_group = ?1 AND job_name = ?2",
            params![key.group, key.name],
        )
    }

    fn scheduler_states(&mut self) -> StoreResult<Vec<SchedulerStateRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT instance_id, last_checkin_ms, checkin_interval_ms
             FROM scheduler_state ORDER BY instance_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (instance_id, last_ms, interval_ms) = row?;
            let last_checkin = DateTime::<Utc>::from_timestamp_millis(last_ms).ok_or_else(|| {
                StoreError::Corrupt(format!("check-in time {last_ms} of {instance_id}"))
            })?;
            out.push(SchedulerStateRecord {
                instance_id,
                last_checkin,
                checkin_interval_ms: u64::try_from(interval_ms).unwrap_or(0),
            });
        }
        Ok(out)
    }

    fn put_scheduler_state(&mut self, record: &SchedulerStateRecord) -> StoreResult<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO scheduler_state (instance_id, last_checkin_ms, checkin_interval_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (instance_id) DO UPDATE SET
                    last_checkin_ms = excluded.last_checkin_ms,
                    checkin_interval_ms = excluded.checkin_interval_ms",
            )?
            .execute(params![
                record.instance_id,
                record.last_checkin.timestamp_millis(),
                i64::try_from(record.checkin_interval_ms).unwrap_or(i64::MAX),
            ])?;
        Ok(())
    }

    fn delete_scheduler_state(&mut self, instance_id: &str) -> StoreResult<bool> {
        let n = self
            .conn
            .prepare_cached("DELETE FROM scheduler_state WHERE instance_id = ?1")?
            .execute(params![instance_id])?;
        Ok(n > 0)
    }
}
