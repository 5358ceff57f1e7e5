//! Job persistence.
//!
//! Provides the [`JobStore`] boundary and its SQLite implementation. Every
//! status change is a guarded update (`WHERE status = ...`), so a job only
//! ever moves along the transitions the state machine allows.

use super::models::{now_millis, Job, JobCounts, JobParameters, JobStatus};
use super::retry_policy::RetryPolicy;
use super::schema::JOB_STORE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::prepare_database;
use anyhow::{Context, Result};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Storage operations needed by job queues and masters.
pub trait JobStore: Send + Sync {
    // === Writes ===

    /// Persist `job` as given and assign its id.
    fn insert(&self, job: &mut Job) -> Result<i64>;

    /// Persist `job` unless a pending job with the same action and an equal
    /// parameter map exists. Check and insert happen in one transaction.
    fn insert_if_absent(&self, job: &mut Job) -> Result<bool>;

    /// Overwrite a persisted job, parameters included.
    fn save(&self, job: &Job) -> Result<()>;

    fn delete(&self, id: i64) -> Result<bool>;

    // === Reads ===

    fn get(&self, id: i64) -> Result<Option<Job>>;

    /// Most recently added job of `action` whose parameters include every
    /// entry of `filter`.
    fn find_by_parameters(&self, action: &str, filter: &JobParameters) -> Result<Option<Job>>;

    /// Jobs of `action`, oldest first.
    fn list(
        &self,
        action: &str,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>>;

    fn count(&self, action: &str, status: Option<JobStatus>) -> Result<usize>;

    fn counts(&self, action: &str) -> Result<JobCounts>;

    /// Distinct action identifiers present in the store.
    fn actions(&self) -> Result<Vec<String>>;

    // === State machine ===

    /// Atomically move the oldest due NEW job of `action` to PROCESSING.
    fn claim_next(&self, action: &str, now: i64) -> Result<Option<Job>>;

    /// PROCESSING to FINISHED.
    fn mark_finished(&self, id: i64) -> Result<bool>;

    /// PROCESSING back to NEW without counting an attempt, for a claimed
    /// job whose work never started.
    fn unclaim(&self, id: i64) -> Result<bool>;

    /// PROCESSING to ERROR with `tries + 1`, then on to NEW after the
    /// policy's backoff or to MAX_TRIES_EXCEEDED, in one transaction.
    /// Returns the job as it ends up, `None` if it was not PROCESSING.
    fn fail_attempt(&self, id: i64, error: &str, policy: &RetryPolicy) -> Result<Option<Job>>;

    /// Fail every job of `action` that has been PROCESSING since before
    /// `started_before` as an abandoned attempt, and move on any job left
    /// in ERROR. Returns the jobs that moved.
    fn reset_stale(
        &self,
        action: &str,
        started_before: i64,
        policy: &RetryPolicy,
    ) -> Result<Vec<Job>>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open an existing database or create a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open job database {:?}", db_path.as_ref()))?;
        prepare_database(&conn, JOB_STORE_VERSIONED_SCHEMAS, "job store")?;
        info!("Opened job store at {:?}", db_path.as_ref());
        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        prepare_database(&conn, JOB_STORE_VERSIONED_SCHEMAS, "job store")?;
        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status: String = row.get("status")?;
        Ok(Job {
            id: Some(row.get("id")?),
            action: row.get("action")?,
            parameters: JobParameters::new(),
            status: JobStatus::from_db_str(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    Type::Text,
                    format!("Unknown job status {}", status).into(),
                )
            })?,
            tries: row.get("tries")?,
            added_at: row.get("added_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            last_error: row.get("last_error")?,
            next_attempt_at: row.get("next_attempt_at")?,
        })
    }

    fn load_parameters(conn: &Connection, job: &mut Job) -> Result<()> {
        let Some(id) = job.id else {
            return Ok(());
        };
        let mut stmt = conn.prepare_cached("SELECT name, value FROM job_parameters WHERE job_id = ?1")?;
        job.parameters = stmt
            .query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(())
    }

    fn load_job(conn: &Connection, id: i64) -> Result<Option<Job>> {
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", [id], Self::row_to_job)
            .optional()?;
        match job {
            Some(mut job) => {
                Self::load_parameters(conn, &mut job)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    fn query_jobs(conn: &Connection, sql: &str, values: Vec<Value>) -> Result<Vec<Job>> {
        let mut stmt = conn.prepare(sql)?;
        let mut jobs = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for job in jobs.iter_mut() {
            Self::load_parameters(conn, job)?;
        }
        Ok(jobs)
    }

    fn insert_with(conn: &Connection, job: &mut Job) -> Result<i64> {
        conn.execute(
            r#"INSERT INTO jobs (
                action, status, tries, added_at, started_at, finished_at,
                last_error, next_attempt_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                job.action,
                job.status.as_db_str(),
                job.tries,
                job.added_at,
                job.started_at,
                job.finished_at,
                job.last_error,
                job.next_attempt_at,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::write_parameters(conn, id, &job.parameters)?;
        job.id = Some(id);
        Ok(id)
    }

    fn write_parameters(conn: &Connection, id: i64, parameters: &JobParameters) -> Result<()> {
        let mut stmt =
            conn.prepare_cached("INSERT INTO job_parameters (job_id, name, value) VALUES (?1, ?2, ?3)")?;
        for (name, value) in parameters {
            stmt.execute(params![id, name, value])?;
        }
        Ok(())
    }

    /// `WHERE` fragment matching jobs that carry every entry of `filter`,
    /// with its bound values appended to `values`.
    fn parameter_clause(filter: &JobParameters, values: &mut Vec<Value>) -> String {
        let mut clause = String::new();
        for (name, value) in filter {
            clause.push_str(
                " AND EXISTS (SELECT 1 FROM job_parameters p WHERE p.job_id = j.id AND p.name = ? AND p.value = ?)",
            );
            values.push(Value::Text(name.clone()));
            values.push(Value::Text(value.clone()));
        }
        clause
    }

    /// Guarded status update; false if the job was not in `from`.
    fn transition(&self, id: i64, from: JobStatus, to: JobStatus, extra: &str, values: Vec<Value>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "UPDATE jobs SET status = ?1{} WHERE id = ?2 AND status = ?3",
            extra
        );
        let mut bound: Vec<Value> = vec![
            Value::Text(to.as_db_str().to_string()),
            Value::Integer(id),
            Value::Text(from.as_db_str().to_string()),
        ];
        bound.extend(values);
        let changed = conn.execute(&sql, params_from_iter(bound.iter()))?;
        if changed == 1 {
            debug!("Job {} {} -> {}", id, from, to);
        }
        Ok(changed == 1)
    }

    /// ERROR to NEW or MAX_TRIES_EXCEEDED depending on the tries so far.
    fn reschedule(conn: &Connection, id: i64, policy: &RetryPolicy, now: i64) -> Result<()> {
        let tries: u32 = conn.query_row("SELECT tries FROM jobs WHERE id = ?1", [id], |row| row.get(0))?;
        if policy.should_retry(tries) {
            conn.execute(
                "UPDATE jobs SET status = 'NEW', next_attempt_at = ?2 WHERE id = ?1 AND status = 'ERROR'",
                params![id, policy.next_attempt_at(tries, now)],
            )?;
            debug!("Job {} ERROR -> NEW", id);
        } else {
            conn.execute(
                "UPDATE jobs SET status = 'MAX_TRIES_EXCEEDED' WHERE id = ?1 AND status = 'ERROR'",
                [id],
            )?;
            debug!("Job {} ERROR -> MAX_TRIES_EXCEEDED", id);
        }
        Ok(())
    }
}

impl JobStore for SqliteJobStore {
    // === Writes ===

    fn insert(&self, job: &mut Job) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let id = Self::insert_with(&tx, job)?;
        tx.commit()?;
        Ok(id)
    }

    fn insert_if_absent(&self, job: &mut Job) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut values = vec![Value::Text(job.action.clone())];
        let clause = Self::parameter_clause(&job.parameters, &mut values);
        values.push(Value::Integer(job.parameters.len() as i64));
        let sql = format!(
            r#"SELECT j.id FROM jobs j
               WHERE j.action = ? AND j.status IN ('NEW', 'PROCESSING', 'ERROR'){}
               AND (SELECT COUNT(*) FROM job_parameters p WHERE p.job_id = j.id) = ?
               LIMIT 1"#,
            clause
        );
        let existing: Option<i64> = tx
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
            .optional()?;
        if let Some(existing) = existing {
            debug!(
                "Job for {} with {:?} already queued as {}",
                job.action, job.parameters, existing
            );
            return Ok(false);
        }

        Self::insert_with(&tx, job)?;
        tx.commit()?;
        Ok(true)
    }

    fn save(&self, job: &Job) -> Result<()> {
        let id = job.id.context("Cannot save a job that was never inserted")?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            r#"UPDATE jobs SET
                action = ?2, status = ?3, tries = ?4, added_at = ?5, started_at = ?6,
                finished_at = ?7, last_error = ?8, next_attempt_at = ?9
               WHERE id = ?1"#,
            params![
                id,
                job.action,
                job.status.as_db_str(),
                job.tries,
                job.added_at,
                job.started_at,
                job.finished_at,
                job.last_error,
                job.next_attempt_at,
            ],
        )?;
        if changed == 0 {
            anyhow::bail!("Job {} does not exist", id);
        }
        tx.execute("DELETE FROM job_parameters WHERE job_id = ?1", [id])?;
        Self::write_parameters(&tx, id, &job.parameters)?;
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM jobs WHERE id = ?1", [id])? == 1)
    }

    // === Reads ===

    fn get(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        Self::load_job(&conn, id)
    }

    fn find_by_parameters(&self, action: &str, filter: &JobParameters) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut values = vec![Value::Text(action.to_string())];
        let clause = Self::parameter_clause(filter, &mut values);
        let sql = format!(
            "SELECT j.* FROM jobs j WHERE j.action = ?{} ORDER BY j.id DESC LIMIT 1",
            clause
        );
        Ok(Self::query_jobs(&conn, &sql, values)?.into_iter().next())
    }

    fn list(
        &self,
        action: &str,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut values = vec![Value::Text(action.to_string())];
        let mut sql = "SELECT j.* FROM jobs j WHERE j.action = ?".to_string();
        if let Some(status) = status {
            sql.push_str(" AND j.status = ?");
            values.push(Value::Text(status.as_db_str().to_string()));
        }
        sql.push_str(" ORDER BY j.added_at ASC, j.id ASC LIMIT ? OFFSET ?");
        values.push(Value::Integer(limit as i64));
        values.push(Value::Integer(offset as i64));
        Self::query_jobs(&conn, &sql, values)
    }

    fn count(&self, action: &str, status: Option<JobStatus>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = match status {
            Some(status) => conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE action = ?1 AND status = ?2",
                params![action, status.as_db_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE action = ?1",
                [action],
                |row| row.get(0),
            )?,
        };
        Ok(count as usize)
    }

    fn counts(&self, action: &str) -> Result<JobCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM jobs WHERE action = ?1 GROUP BY status")?;
        let rows = stmt
            .query_map([action], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            if let Some(status) = JobStatus::from_db_str(&status) {
                counts.set(status, count as usize);
            }
        }
        Ok(counts)
    }

    fn actions(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT action FROM jobs ORDER BY action")?;
        let actions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(actions)
    }

    // === State machine ===

    fn claim_next(&self, action: &str, now: i64) -> Result<Option<Job>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id: Option<i64> = tx
            .query_row(
                r#"SELECT id FROM jobs
                   WHERE action = ?1 AND status = 'NEW'
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
                   ORDER BY added_at ASC, id ASC
                   LIMIT 1"#,
                params![action, now],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = 'PROCESSING', started_at = ?2, finished_at = NULL WHERE id = ?1 AND status = 'NEW'",
            params![id, now],
        )?;
        let job = Self::load_job(&tx, id)?;
        tx.commit()?;
        debug!("Claimed job {} for {}", id, action);
        Ok(job)
    }

    fn mark_finished(&self, id: i64) -> Result<bool> {
        self.transition(
            id,
            JobStatus::Processing,
            JobStatus::Finished,
            ", finished_at = ?4, last_error = NULL",
            vec![Value::Integer(now_millis())],
        )
    }

    fn unclaim(&self, id: i64) -> Result<bool> {
        self.transition(
            id,
            JobStatus::Processing,
            JobStatus::New,
            ", started_at = NULL",
            vec![],
        )
    }

    fn fail_attempt(&self, id: i64, error: &str, policy: &RetryPolicy) -> Result<Option<Job>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        let changed = tx.execute(
            r#"UPDATE jobs SET status = 'ERROR', tries = tries + 1, finished_at = ?2,
               last_error = ?3
               WHERE id = ?1 AND status = 'PROCESSING'"#,
            params![id, now, error],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        debug!("Job {} PROCESSING -> ERROR", id);
        Self::reschedule(&tx, id, policy, now)?;
        let job = Self::load_job(&tx, id)?;
        tx.commit()?;
        Ok(job)
    }

    fn reset_stale(
        &self,
        action: &str,
        started_before: i64,
        policy: &RetryPolicy,
    ) -> Result<Vec<Job>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        tx.execute(
            r#"UPDATE jobs SET status = 'ERROR', tries = tries + 1, finished_at = ?3,
               last_error = 'Abandoned while processing'
               WHERE action = ?1 AND status = 'PROCESSING'
               AND (started_at IS NULL OR started_at < ?2)"#,
            params![action, started_before, now],
        )?;

        // Freshly abandoned jobs and any left in ERROR by an interrupted failure
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs WHERE action = ?1 AND status = 'ERROR' ORDER BY id",
            )?;
            let ids = stmt
                .query_map([action], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        let mut moved = Vec::with_capacity(ids.len());
        for id in ids {
            Self::reschedule(&tx, id, policy, now)?;
            if let Some(job) = Self::load_job(&tx, id)? {
                moved.push(job);
            }
        }
        tx.commit()?;
        Ok(moved)
    }
}
