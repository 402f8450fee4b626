//! Durable job queue operations.
//!
//! Enqueue upserts on the unique `dedupe_key`: arming a job that is queued,
//! running or done is a no-op, while arming a buried one puts it back in the
//! queue with a fresh attempt count. Claiming leases jobs for a bounded time; a
//! worker that dies mid-job leaves a lease that expires, after which the job
//! becomes claimable again (at-least-once delivery). A row that no longer
//! decodes is buried at claim time so it cannot block the rows behind it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Params, Row};
use tracing::{error, warn};
use verdict_core::ParseEnumError;

use super::super::RepositoryError;
use super::{from_millis, sql_err, to_millis};
use crate::jobs::{Job, JobCounts, JobKind, JobState, NewJob};

const JOB_COLUMNS: &str =
    "id, dedupe_key, kind_json, state, run_at, attempts, lease_until, last_error";

type RawJob = (
    i64,
    String,
    String,
    String,
    i64,
    i64,
    Option<i64>,
    Option<String>,
);

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode(raw: RawJob) -> Result<Job, RepositoryError> {
    let (id, dedupe_key, kind_json, state, run_at, attempts, lease_until, last_error) = raw;
    let kind: JobKind = serde_json::from_str(&kind_json)
        .map_err(|_| RepositoryError::corruption(format!("job {} kind JSON", id)))?;
    let state: JobState = state
        .parse()
        .map_err(|e: ParseEnumError| RepositoryError::corruption(format!("job {}: {}", id, e)))?;
    let attempts = u32::try_from(attempts)
        .map_err(|_| RepositoryError::corruption(format!("job {} attempts {}", id, attempts)))?;

    Ok(Job {
        id,
        dedupe_key,
        kind,
        state,
        run_at: from_millis(run_at, "job run_at")?,
        attempts,
        lease_until: lease_until
            .map(|ms| from_millis(ms, "job lease_until"))
            .transpose()?,
        last_error,
    })
}

fn query_raw<P: Params>(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: P,
) -> Result<Vec<RawJob>, RepositoryError> {
    let mut stmt = conn.prepare(sql).map_err(sql_err(operation))?;
    let rows = stmt
        .query_map(params, read_raw)
        .map_err(sql_err(operation))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_err(operation))
}

fn query_jobs<P: Params>(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: P,
) -> Result<Vec<Job>, RepositoryError> {
    let mut jobs = Vec::new();
    for raw in query_raw(conn, operation, sql, params)? {
        let id = raw.0;
        match decode(raw) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping job {} in {}: {}", id, operation, e),
        }
    }
    Ok(jobs)
}

pub(super) fn enqueue_sync(
    conn: &Connection,
    jobs: &[NewJob],
    now: DateTime<Utc>,
) -> Result<usize, RepositoryError> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO jobs (dedupe_key, kind_json, state, run_at, attempts, created_at)
             VALUES (?1, ?2, 'queued', ?3, 0, ?4)
             ON CONFLICT(dedupe_key) DO UPDATE SET
                 kind_json = excluded.kind_json,
                 state = 'queued',
                 run_at = excluded.run_at,
                 attempts = 0,
                 lease_until = NULL,
                 last_error = NULL,
                 created_at = excluded.created_at
             WHERE jobs.state = 'buried'",
        )
        .map_err(sql_err("enqueue jobs"))?;

    let mut inserted = 0;
    for job in jobs {
        let kind_json = serde_json::to_string(&job.kind)
            .map_err(|e| RepositoryError::storage("serialize job", e.to_string()))?;
        inserted += stmt
            .execute(params![
                job.dedupe_key,
                kind_json,
                to_millis(job.run_at),
                to_millis(now)
            ])
            .map_err(sql_err("enqueue jobs"))?;
    }
    Ok(inserted)
}

pub(super) fn claim_due_sync(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: i64,
    lease_until: DateTime<Utc>,
) -> Result<Vec<Job>, RepositoryError> {
    let now_ms = to_millis(now);
    let sql = format!(
        "SELECT {} FROM jobs
         WHERE (state = 'queued' AND run_at <= ?1)
            OR (state = 'running' AND lease_until <= ?1)
         ORDER BY run_at ASC, id ASC
         LIMIT ?2",
        JOB_COLUMNS
    );
    let due = query_raw(conn, "claim due jobs", &sql, params![now_ms, limit])?;

    let lease_ms = to_millis(lease_until);
    let mut claimed = Vec::with_capacity(due.len());
    for raw in due {
        let id = raw.0;
        let mut job = match decode(raw) {
            Ok(job) => job,
            Err(e) => {
                error!("Burying undecodable job {}: {}", id, e);
                conn.execute(
                    "UPDATE jobs SET state = 'buried', lease_until = NULL, last_error = ?2
                     WHERE id = ?1",
                    params![id, e.to_string()],
                )
                .map_err(sql_err("claim due jobs"))?;
                continue;
            }
        };
        conn.execute(
            "UPDATE jobs SET state = 'running', lease_until = ?2 WHERE id = ?1",
            params![job.id, lease_ms],
        )
        .map_err(sql_err("claim due jobs"))?;
        job.state = JobState::Running;
        job.lease_until = Some(lease_until);
        claimed.push(job);
    }
    Ok(claimed)
}

/// Run a single-row job update, failing if the job does not exist.
pub(super) fn update_job_sync<P: Params>(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: P,
) -> Result<(), RepositoryError> {
    let changed = conn.execute(sql, params).map_err(sql_err(operation))?;
    if changed == 0 {
        return Err(RepositoryError::storage(operation, "no such job"));
    }
    Ok(())
}

pub(super) fn counts_sync(conn: &Connection) -> Result<JobCounts, RepositoryError> {
    let mut stmt = conn
        .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
        .map_err(sql_err("job counts"))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(sql_err("job counts"))?;

    let mut counts = JobCounts::default();
    for row in rows {
        let (state, n) = row.map_err(sql_err("job counts"))?;
        let state: JobState = state
            .parse()
            .map_err(|e: ParseEnumError| RepositoryError::corruption(e.to_string()))?;
        counts.add(state, u64::try_from(n).unwrap_or(0));
    }
    Ok(counts)
}

pub(super) fn list_sync(
    conn: &Connection,
    state: Option<JobState>,
    limit: i64,
) -> Result<Vec<Job>, RepositoryError> {
    match state {
        Some(state) => query_jobs(
            conn,
            "list jobs",
            &format!(
                "SELECT {} FROM jobs WHERE state = ?1 ORDER BY id ASC LIMIT ?2",
                JOB_COLUMNS
            ),
            params![state.as_str(), limit],
        ),
        None => query_jobs(
            conn,
            "list jobs",
            &format!("SELECT {} FROM jobs ORDER BY id ASC LIMIT ?1", JOB_COLUMNS),
            params![limit],
        ),
    }
}
