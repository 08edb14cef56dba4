//! Execution log recorder.
//!
//! A run is recorded in two steps: [`LogRecorder::begin`] writes a `running`
//! row when the run starts and [`LogRecorder::finalize`] closes it exactly
//! once. Finalized rows are never rewritten. Listings and retention cleanup
//! only ever see finalized rows.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Row};
use serde::Serialize;

use super::{encode_ts, opt_ts_column, ts_column, uuid_column, Pool, StoreError};
use crate::config::LogsConfig;
use crate::model::{JobId, JobLog, LogStatus};

const LOG_COLUMNS: &str = "id, job_id, started_at, finished_at, duration_ms, status, \
                           response_code, error, response_body, attempts";

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<JobLog> {
    let status: String = row.get(5)?;
    let status: LogStatus = status.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into())
    })?;
    let response_code: Option<i64> = row.get(6)?;
    let attempts: i64 = row.get(9)?;

    Ok(JobLog {
        id: uuid_column(row, 0)?,
        job_id: uuid_column(row, 1)?,
        started_at: ts_column(row, 2)?,
        finished_at: opt_ts_column(row, 3)?,
        duration_ms: row.get(4)?,
        status,
        response_code: response_code.and_then(|c| u16::try_from(c).ok()),
        error: row.get(7)?,
        response_body: row.get(8)?,
        attempts: attempts.clamp(0, i64::from(u32::MAX)) as u32,
    })
}

/// Which finalized logs survive a cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    /// Evict logs that started longer ago than this.
    pub max_age: Option<Duration>,
    /// Keep at most this many of the most recent logs per job.
    pub max_per_job: Option<usize>,
}

impl From<&LogsConfig> for RetentionPolicy {
    fn from(cfg: &LogsConfig) -> Self {
        Self {
            max_age: (cfg.retention_days > 0).then(|| Duration::days(i64::from(cfg.retention_days))),
            max_per_job: (cfg.max_per_job > 0).then_some(cfg.max_per_job),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CleanupReport {
    pub expired: usize,
    pub over_cap: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.expired + self.over_cap
    }
}

#[derive(Clone)]
pub struct LogRecorder {
    pool: Pool,
}

impl LogRecorder {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Write the unfinalized record for a run that just started.
    pub fn begin(&self, log: &JobLog) -> Result<(), StoreError> {
        self.insert(log)
    }

    /// Close a run started with [`begin`](Self::begin). Returns `false` if the
    /// row is gone (its job was deleted) or was already finalized.
    pub fn finalize(&self, log: &JobLog) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE job_logs SET finished_at = ?2, duration_ms = ?3, status = ?4,
                    response_code = ?5, error = ?6, response_body = ?7, attempts = ?8
             WHERE id = ?1 AND status = 'running'",
            params![
                log.id.to_string(),
                log.finished_at.map(encode_ts),
                log.duration_ms,
                log.status.as_str(),
                log.response_code,
                log.error,
                log.response_body,
                log.attempts,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Store a record in one step.
    pub fn append(&self, log: &JobLog) -> Result<(), StoreError> {
        self.insert(log)
    }

    fn insert(&self, log: &JobLog) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO job_logs ({LOG_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                log.id.to_string(),
                log.job_id.to_string(),
                encode_ts(log.started_at),
                log.finished_at.map(encode_ts),
                log.duration_ms,
                log.status.as_str(),
                log.response_code,
                log.error,
                log.response_body,
                log.attempts,
            ],
        )?;
        Ok(())
    }

    /// Finalized logs of one job, newest first.
    pub fn list(&self, job_id: JobId, limit: u32, offset: u32) -> Result<Vec<JobLog>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM job_logs
             WHERE job_id = ?1 AND status != 'running'
             ORDER BY started_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let logs = stmt
            .query_map(params![job_id.to_string(), limit, offset], log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    /// Apply `policy` to every job's logs.
    pub fn cleanup(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<CleanupReport, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut report = CleanupReport::default();

        if let Some(max_age) = policy.max_age {
            report.expired = tx.execute(
                "DELETE FROM job_logs WHERE status != 'running' AND started_at < ?1",
                params![encode_ts(now - max_age)],
            )?;
        }

        if let Some(cap) = policy.max_per_job {
            report.over_cap = tx.execute(
                "DELETE FROM job_logs WHERE id IN (
                    SELECT id FROM (
                        SELECT id, ROW_NUMBER() OVER (
                            PARTITION BY job_id ORDER BY started_at DESC, rowid DESC
                        ) AS rn
                        FROM job_logs WHERE status != 'running'
                    ) WHERE rn > ?1
                )",
                params![cap as i64],
            )?;
        }

        tx.commit()?;
        Ok(report)
    }

    /// Trim one job's finalized logs down to the `cap` most recent.
    pub fn trim_job(&self, job_id: JobId, cap: usize) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM job_logs WHERE job_id = ?1 AND status != 'running' AND id NOT IN (
                SELECT id FROM job_logs WHERE job_id = ?1 AND status != 'running'
                ORDER BY started_at DESC, rowid DESC LIMIT ?2
            )",
            params![job_id.to_string(), cap as i64],
        )?;
        Ok(deleted)
    }
}
