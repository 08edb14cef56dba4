//! Durable job definitions. The source of truth the scheduler resyncs from.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

use super::{encode_ts, opt_ts_column, ts_column, uuid_column, Pool, StoreError};
use crate::model::{HttpMethod, Job, JobId, UserId};

const JOB_COLUMNS: &str = "id, user_id, name, schedule, endpoint, method, headers_json, body, \
                           active, timeout_secs, retries, created_at, updated_at, last_fired_at, armed_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let method: String = row.get(5)?;
    let method: HttpMethod = method
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    let headers_json: String = row.get(6)?;
    let headers: BTreeMap<String, String> = serde_json::from_str(&headers_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    let timeout_secs: Option<i64> = row.get(9)?;
    let retries: i64 = row.get(10)?;

    Ok(Job {
        id: uuid_column(row, 0)?,
        user_id: uuid_column(row, 1)?,
        name: row.get(2)?,
        schedule: row.get(3)?,
        endpoint: row.get(4)?,
        method,
        headers,
        body: row.get(7)?,
        active: row.get::<_, i64>(8)? != 0,
        timeout_secs: timeout_secs.map(|t| t.max(0) as u64),
        retries: retries.clamp(0, i64::from(u32::MAX)) as u32,
        created_at: ts_column(row, 11)?,
        updated_at: ts_column(row, 12)?,
        last_fired_at: opt_ts_column(row, 13)?,
        armed_at: ts_column(row, 14)?,
    })
}

#[derive(Clone)]
pub struct JobStore {
    pool: Pool,
}

impl JobStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                job.id.to_string(),
                job.user_id.to_string(),
                job.name,
                job.schedule,
                job.endpoint,
                job.method.as_str(),
                serde_json::to_string(&job.headers)?,
                job.body,
                job.active,
                job.timeout_secs.map(|t| t as i64),
                job.retries,
                encode_ts(job.created_at),
                encode_ts(job.updated_at),
                job.last_fired_at.map(encode_ts),
                encode_ts(job.armed_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.pool.get()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// A job visible to `owner`; other users' jobs read as absent.
    pub fn get_owned(&self, id: JobId, owner: UserId) -> Result<Option<Job>, StoreError> {
        Ok(self.get(id)?.filter(|job| job.user_id == owner))
    }

    /// Jobs of one owner, newest first.
    pub fn list_by_user(&self, owner: UserId, limit: u32, offset: u32) -> Result<Vec<Job>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let jobs = stmt
            .query_map(params![owner.to_string(), limit, offset], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Every active job, in creation order. Rows that fail to decode are
    /// skipped with a warning so one bad row cannot keep the scheduler down.
    pub fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE active = 1 ORDER BY created_at, rowid"
        ))?;
        let mut jobs = Vec::new();
        for row in stmt.query_map([], job_from_row)? {
            match row {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable job row"),
            }
        }
        Ok(jobs)
    }

    /// Persist every mutable field of `job`. Returns whether the row exists.
    pub fn update(&self, job: &Job) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE jobs SET name = ?2, schedule = ?3, endpoint = ?4, method = ?5,
                    headers_json = ?6, body = ?7, active = ?8, timeout_secs = ?9,
                    retries = ?10, updated_at = ?11, armed_at = ?12
             WHERE id = ?1",
            params![
                job.id.to_string(),
                job.name,
                job.schedule,
                job.endpoint,
                job.method.as_str(),
                serde_json::to_string(&job.headers)?,
                job.body,
                job.active,
                job.timeout_secs.map(|t| t as i64),
                job.retries,
                encode_ts(job.updated_at),
                encode_ts(job.armed_at),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Delete a job owned by `owner`; its logs go with it.
    pub fn delete(&self, id: JobId, owner: UserId) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "DELETE FROM jobs WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), owner.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Record the start of a scheduled fire; the anchor for catch-up on restart.
    pub fn mark_fired(&self, id: JobId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE jobs SET last_fired_at = ?2 WHERE id = ?1",
            params![id.to_string(), encode_ts(at)],
        )?;
        Ok(changed > 0)
    }
}
