//! Feedback record operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;
use verdict_core::{BusinessId, FeedbackRecord, RecordId};

use super::super::{order_key, CasOutcome, CreateRecordOutcome, RepositoryError};
use super::{jobs, sql_err, to_millis};
use crate::jobs::NewJob;

fn decode(json: &str) -> Result<FeedbackRecord, RepositoryError> {
    serde_json::from_str(json).map_err(|_| RepositoryError::corruption("record JSON"))
}

fn encode(record: &FeedbackRecord) -> Result<String, RepositoryError> {
    serde_json::to_string(record)
        .map_err(|e| RepositoryError::storage("serialize record", e.to_string()))
}

fn revision_to_i64(revision: u64) -> Result<i64, RepositoryError> {
    i64::try_from(revision).map_err(|_| {
        RepositoryError::storage(
            "store revision",
            format!("revision {} exceeds maximum storable value", revision),
        )
    })
}

pub(super) fn insert_record_sync(
    conn: &Connection,
    record: &FeedbackRecord,
) -> Result<(), RepositoryError> {
    conn.execute(
        "INSERT INTO feedback_records
             (id, business_id, status, revision, auto_publish_at, order_key,
              request_token, created_at, record_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id.to_string(),
            record.business_id.0,
            record.status.as_str(),
            revision_to_i64(record.revision)?,
            record.auto_publish_at.map(to_millis),
            order_key(record),
            record.origin.token().map(|t| t.0.clone()),
            to_millis(record.created_at),
            encode(record)?,
        ],
    )
    .map_err(sql_err("insert record"))?;
    Ok(())
}

pub(super) fn create_sync(
    conn: &Connection,
    record: &FeedbackRecord,
    review_limit: u32,
    jobs: &[NewJob],
) -> Result<CreateRecordOutcome, RepositoryError> {
    if let Some(key) = order_key(record) {
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM feedback_records WHERE order_key = ?1)",
                params![key],
                |row| row.get(0),
            )
            .map_err(sql_err("check order"))?;
        if exists {
            return Ok(CreateRecordOutcome::DuplicateOrder);
        }
    }

    let count = count_business_sync(conn, &record.business_id)?;
    if count >= u64::from(review_limit) {
        return Ok(CreateRecordOutcome::QuotaExceeded {
            limit: review_limit,
        });
    }

    insert_record_sync(conn, record)?;
    jobs::enqueue_sync(conn, jobs, record.created_at)?;
    Ok(CreateRecordOutcome::Created)
}

pub(super) fn get_sync(
    conn: &Connection,
    id: RecordId,
) -> Result<Option<FeedbackRecord>, RepositoryError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT record_json FROM feedback_records WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err("get record"))?;

    json.as_deref().map(decode).transpose()
}

pub(super) fn compare_and_set_sync(
    conn: &Connection,
    expected: &FeedbackRecord,
    updated: &FeedbackRecord,
    jobs: &[NewJob],
) -> Result<CasOutcome, RepositoryError> {
    let changed = conn
        .execute(
            "UPDATE feedback_records
             SET status = ?3, revision = ?4, auto_publish_at = ?5, record_json = ?6
             WHERE id = ?1 AND status = ?2 AND revision = ?7",
            params![
                expected.id.to_string(),
                expected.status.as_str(),
                updated.status.as_str(),
                revision_to_i64(updated.revision)?,
                updated.auto_publish_at.map(to_millis),
                encode(updated)?,
                revision_to_i64(expected.revision)?,
            ],
        )
        .map_err(sql_err("compare and set"))?;

    if changed > 0 {
        jobs::enqueue_sync(conn, jobs, updated.updated_at)?;
        return Ok(CasOutcome::Applied);
    }

    match get_sync(conn, expected.id)? {
        Some(current) => Ok(CasOutcome::Stale(current)),
        None => Ok(CasOutcome::NotFound),
    }
}

/// Decode rows of `record_json`, skipping (and logging) corrupt ones so one
/// bad row cannot stall the sweep for every other record.
fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<(String, String)>>,
    operation: &'static str,
) -> Vec<FeedbackRecord> {
    let mut records = Vec::new();
    for row in rows {
        let (id, json) = match row {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to read row in {}: {}", operation, e);
                continue;
            }
        };
        match decode(&json) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping feedback {} in {}: {}", id, operation, e),
        }
    }
    records
}

pub(super) fn list_due_pending_sync(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<FeedbackRecord>, RepositoryError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, record_json FROM feedback_records
             WHERE status = 'pending_moderation'
               AND auto_publish_at IS NOT NULL
               AND auto_publish_at <= ?1
             ORDER BY auto_publish_at ASC
             LIMIT ?2",
        )
        .map_err(sql_err("list due pending"))?;
    let rows = stmt
        .query_map(params![to_millis(now), limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(sql_err("list due pending"))?;
    let records = collect_records(rows, "list due pending");
    Ok(records)
}

pub(super) fn list_business_sync(
    conn: &Connection,
    business: &BusinessId,
) -> Result<Vec<FeedbackRecord>, RepositoryError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, record_json FROM feedback_records
             WHERE business_id = ?1
             ORDER BY created_at ASC",
        )
        .map_err(sql_err("list business records"))?;
    let rows = stmt
        .query_map(params![business.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(sql_err("list business records"))?;
    let records = collect_records(rows, "list business records");
    Ok(records)
}

pub(super) fn count_business_sync(
    conn: &Connection,
    business: &BusinessId,
) -> Result<u64, RepositoryError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM feedback_records WHERE business_id = ?1",
            params![business.0],
            |row| row.get(0),
        )
        .map_err(sql_err("count business records"))?;
    u64::try_from(count).map_err(|_| RepositoryError::corruption(format!("record count {}", count)))
}
