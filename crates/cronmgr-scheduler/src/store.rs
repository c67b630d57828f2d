use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db;
use crate::error::{Result, SchedulerError};
use crate::types::{Job, JobStatus, Schedule};

const SCHEDULE_COLUMNS: &str =
    "id, name, app_name, schedule, region, command, command_timeout, enabled, config";
const JOB_COLUMNS: &str = "id, schedule_id, status, machine_id, exit_code, stdout, stderr,
     created_at, updated_at, finished_at";

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Persistence for schedules and jobs.
///
/// Every write is a single statement (schedule deletion aside), so several
/// processes may share the database file, each through its own `Store`.
/// The connection lock is never held across an `.await`.
pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Wrap an open connection, applying migrations first.
    pub fn new(conn: Connection) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        Self::new(db::open(path, busy_timeout)?)
    }

    // --- schedules ---------------------------------------------------------

    /// Insert a schedule and return it with its assigned ID.
    pub fn create_schedule(&self, schedule: &Schedule) -> Result<Schedule> {
        let config = serde_json::to_string(&schedule.config)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO schedules
             (name, app_name, schedule, region, command, command_timeout, enabled, config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                schedule.name,
                schedule.app_name,
                schedule.schedule,
                schedule.region,
                schedule.command,
                schedule.command_timeout,
                schedule.enabled,
                config,
            ],
        )?;
        let id = db.last_insert_rowid();
        info!(schedule_id = id, name = %schedule.name, "schedule created");
        Ok(Schedule {
            id,
            ..schedule.clone()
        })
    }

    /// Overwrite every field of the schedule with the same `name`.
    pub fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        let config = serde_json::to_string(&schedule.config)?;
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE schedules SET app_name = ?1, schedule = ?2, region = ?3, command = ?4,
                    command_timeout = ?5, enabled = ?6, config = ?7
             WHERE name = ?8",
            rusqlite::params![
                schedule.app_name,
                schedule.schedule,
                schedule.region,
                schedule.command,
                schedule.command_timeout,
                schedule.enabled,
                config,
                schedule.name,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::schedule_not_found(&schedule.name));
        }
        info!(name = %schedule.name, "schedule updated");
        Ok(())
    }

    /// Delete a schedule together with its job history.
    pub fn delete_schedule(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let tx = db.unchecked_transaction()?;
        let jobs = tx.execute("DELETE FROM jobs WHERE schedule_id = ?1", [id])?;
        let n = tx.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::schedule_not_found(id));
        }
        tx.commit()?;
        info!(schedule_id = id, jobs_deleted = jobs, "schedule deleted");
        Ok(())
    }

    pub fn delete_schedule_by_name(&self, name: &str) -> Result<()> {
        let schedule = self.find_schedule_by_name(name)?;
        self.delete_schedule(schedule.id)
    }

    pub fn find_schedule(&self, id: i64) -> Result<Schedule> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
            [id],
            row_to_schedule,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::schedule_not_found(id))
    }

    pub fn find_schedule_by_name(&self, name: &str) -> Result<Schedule> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE name = ?1"),
            [name],
            row_to_schedule,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::schedule_not_found(name))
    }

    /// All schedules in insertion order.
    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.query_schedules(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY id"
        ))
    }

    /// Enabled schedules only; this is what the crontab is generated from.
    pub fn list_enabled_schedules(&self) -> Result<Vec<Schedule>> {
        self.query_schedules(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE enabled = 1 ORDER BY id"
        ))
    }

    fn query_schedules(&self, sql: &str) -> Result<Vec<Schedule>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(sql)?;
        let schedules = stmt
            .query_map([], row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    // --- jobs --------------------------------------------------------------

    /// Insert a `pending` job and return the stored row.
    pub fn create_job(&self, schedule_id: i64) -> Result<Job> {
        let now = Utc::now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO jobs (schedule_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            rusqlite::params![schedule_id, JobStatus::Pending, now],
        )?;
        let id = db.last_insert_rowid();
        debug!(job_id = id, schedule_id, "job created");
        db.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            row_to_job,
        )
        .map_err(SchedulerError::from)
    }

    pub fn update_job_status(&self, id: i64, status: JobStatus) -> Result<()> {
        self.update_job(
            id,
            "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status, Utc::now(), id],
        )
    }

    pub fn update_job_machine(&self, id: i64, machine_id: &str) -> Result<()> {
        self.update_job(
            id,
            "UPDATE jobs SET machine_id = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![machine_id, Utc::now(), id],
        )
    }

    /// Terminal failure. `message` lands in `stderr`.
    ///
    /// Not guarded against an earlier terminal write; the last write wins.
    pub fn fail_job(&self, id: i64, exit_code: i32, message: &str) -> Result<()> {
        let now = Utc::now();
        self.update_job(
            id,
            "UPDATE jobs SET status = ?1, exit_code = ?2, stderr = ?3,
                    updated_at = ?4, finished_at = ?4
             WHERE id = ?5",
            rusqlite::params![JobStatus::Failed, exit_code, message, now, id],
        )
    }

    /// Terminal success.
    pub fn complete_job(&self, id: i64, exit_code: i32, stdout: &str) -> Result<()> {
        let now = Utc::now();
        self.update_job(
            id,
            "UPDATE jobs SET status = ?1, exit_code = ?2, stdout = ?3,
                    updated_at = ?4, finished_at = ?4
             WHERE id = ?5",
            rusqlite::params![JobStatus::Completed, exit_code, stdout, now, id],
        )
    }

    fn update_job(&self, id: i64, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(sql, params)?;
        if n == 0 {
            return Err(SchedulerError::job_not_found(id));
        }
        Ok(())
    }

    pub fn find_job(&self, id: i64) -> Result<Job> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            row_to_job,
        )
        .optional()?
        .ok_or_else(|| SchedulerError::job_not_found(id))
    }

    /// The job bound to `machine_id`, if any.
    pub fn find_job_by_machine_id(&self, machine_id: &str) -> Result<Option<Job>> {
        let db = self.db.lock().unwrap();
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE machine_id = ?1"),
                [machine_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Most recent first.
    pub fn list_jobs(&self, schedule_id: i64, limit: usize) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE schedule_id = ?1 ORDER BY id DESC LIMIT ?2"
            ),
            rusqlite::params![schedule_id, limit as i64],
        )
    }

    pub fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY id"),
            [status],
        )
    }

    /// Jobs whose outcome is still open: `pending` or `running`.
    pub fn list_reconcilable_jobs(&self) -> Result<Vec<Job>> {
        self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE status IN (?1, ?2) ORDER BY id"),
            [JobStatus::Pending, JobStatus::Running],
        )
    }

    fn query_jobs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Job>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(sql)?;
        let jobs = stmt
            .query_map(params, row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Shift a job's `updated_at` into the past.
    #[cfg(test)]
    pub(crate) fn backdate_job(&self, id: i64, secs: i64) {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE jobs SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now() - chrono::Duration::seconds(secs), id],
        )
        .expect("backdate job");
    }

    /// Run raw SQL against the connection, e.g. to install a failing trigger.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) {
        self.db.lock().unwrap().execute_batch(sql).expect("execute batch");
    }
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    let config: String = row.get(8)?;
    let config = serde_json::from_str(&config).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        app_name: row.get(2)?,
        schedule: row.get(3)?,
        region: row.get(4)?,
        command: row.get(5)?,
        command_timeout: row.get(6)?,
        enabled: row.get(7)?,
        config,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        status: row.get(2)?,
        machine_id: row.get(3)?,
        exit_code: row.get(4)?,
        stdout: row.get(5)?,
        stderr: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_store, uptime_check};

    #[test]
    fn create_and_find_schedule() {
        let store = test_store();
        let created = store.create_schedule(&uptime_check()).expect("create");
        assert!(created.id > 0);

        let by_id = store.find_schedule(created.id).expect("by id");
        let by_name = store.find_schedule_by_name("uptime-check").expect("by name");
        assert_eq!(by_id, created);
        assert_eq!(by_name, created);
        assert_eq!(by_id.config.image, "ghcr.io/livebook-dev/livebook:0.11.4");
    }

    #[test]
    fn missing_rows_surface_not_found() {
        let store = test_store();
        assert!(store.find_schedule(99).unwrap_err().is_not_found());
        assert!(store.find_schedule_by_name("nope").unwrap_err().is_not_found());
        assert!(store.find_job(42).unwrap_err().is_not_found());
        assert!(store.fail_job(42, 1, "x").unwrap_err().is_not_found());
        assert!(store.find_job_by_machine_id("m-1").expect("query").is_none());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let store = test_store();
        store.create_schedule(&uptime_check()).expect("create");
        assert!(matches!(
            store.create_schedule(&uptime_check()),
            Err(SchedulerError::Database(_))
        ));
    }

    #[test]
    fn update_overwrites_by_name() {
        let store = test_store();
        let created = store.create_schedule(&uptime_check()).expect("create");
        let mut changed = uptime_check();
        changed.region = "ord".to_string();
        changed.enabled = false;
        store.update_schedule(&changed).expect("update");

        let stored = store.find_schedule(created.id).expect("find");
        assert_eq!(stored.region, "ord");
        assert!(!stored.enabled);
        assert!(store.list_enabled_schedules().expect("list").is_empty());
    }

    #[test]
    fn delete_cascades_to_jobs() {
        let store = test_store();
        let schedule = store.create_schedule(&uptime_check()).expect("create");
        let job = store.create_job(schedule.id).expect("job");

        store.delete_schedule(schedule.id).expect("delete");
        assert!(store.find_job(job.id).unwrap_err().is_not_found());
        assert!(store.delete_schedule(schedule.id).unwrap_err().is_not_found());
    }

    #[test]
    fn job_lifecycle_sets_finished_at_only_when_terminal() {
        let store = test_store();
        let schedule = store.create_schedule(&uptime_check()).expect("create");

        let job = store.create_job(schedule.id).expect("job");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.finished_at.is_none());

        store.update_job_machine(job.id, "m-1").expect("machine");
        store
            .update_job_status(job.id, JobStatus::Running)
            .expect("running");
        let running = store.find_job(job.id).expect("find");
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.machine_id.as_deref(), Some("m-1"));
        assert!(running.finished_at.is_none());

        store.complete_job(job.id, 0, "up 3 days").expect("complete");
        let done = store.find_job(job.id).expect("find");
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.stdout.as_deref(), Some("up 3 days"));
        assert!(done.finished_at.is_some());

        let found = store.find_job_by_machine_id("m-1").expect("query");
        assert_eq!(found.map(|j| j.id), Some(job.id));
    }

    #[test]
    fn list_queries_filter_and_order() {
        let store = test_store();
        let schedule = store.create_schedule(&uptime_check()).expect("create");
        let first = store.create_job(schedule.id).expect("job");
        let second = store.create_job(schedule.id).expect("job");
        let third = store.create_job(schedule.id).expect("job");

        store
            .update_job_status(second.id, JobStatus::Running)
            .expect("running");
        store.fail_job(third.id, -1, "boom").expect("fail");

        let recent: Vec<i64> = store
            .list_jobs(schedule.id, 2)
            .expect("list")
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(recent, vec![third.id, second.id]);

        let running = store.list_jobs_by_status(JobStatus::Running).expect("list");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, second.id);

        let open: Vec<i64> = store
            .list_reconcilable_jobs()
            .expect("list")
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(open, vec![first.id, second.id]);

        let failed = store.find_job(third.id).expect("find");
        assert_eq!(failed.stderr.as_deref(), Some("boom"));
        assert_eq!(failed.exit_code, Some(-1));
    }
}
