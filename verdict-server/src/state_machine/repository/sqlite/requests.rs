//! Feedback request (invitation token) operations.
//!
//! Redemption is the one multi-table operation here: it runs inside the
//! caller's `BEGIN IMMEDIATE` transaction so that two concurrent redemptions
//! of the same token serialize, and the loser sees `responded`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use verdict_core::{
    BusinessId, FeedbackRecord, FeedbackRequest, OrderId, RedeemRejection, RequestStatus,
    RequestToken,
};

use super::super::{InsertRequestOutcome, RedeemOutcome, RepositoryError};
use super::{from_millis, jobs, records, sql_err, to_millis};
use crate::jobs::NewJob;

pub(super) fn insert_request_sync(
    conn: &Connection,
    request: &FeedbackRequest,
) -> Result<InsertRequestOutcome, RepositoryError> {
    // The UNIQUE constraints on token and (business, order, contact) turn a
    // duplicate into an ignored insert.
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO feedback_requests
                 (token, business_id, order_id, customer_contact, status,
                  expires_at, created_at, responded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                request.token.0,
                request.business_id.0,
                request.order_id.0,
                request.customer_contact,
                request.status.as_str(),
                to_millis(request.expires_at),
                to_millis(request.created_at),
                request.responded_at.map(to_millis),
            ],
        )
        .map_err(sql_err("insert request"))?;

    Ok(if inserted > 0 {
        InsertRequestOutcome::Inserted
    } else {
        InsertRequestOutcome::Duplicate
    })
}

pub(super) fn get_request_sync(
    conn: &Connection,
    token: &RequestToken,
) -> Result<Option<FeedbackRequest>, RepositoryError> {
    let row = conn
        .query_row(
            "SELECT token, business_id, order_id, customer_contact, status,
                    expires_at, created_at, responded_at
             FROM feedback_requests WHERE token = ?1",
            params![token.0],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                ))
            },
        )
        .optional()
        .map_err(sql_err("get request"))?;

    let Some((token, business_id, order_id, contact, status, expires_at, created_at, responded_at)) =
        row
    else {
        return Ok(None);
    };

    let status: RequestStatus = status
        .parse()
        .map_err(|_| RepositoryError::corruption(format!("request status '{}'", status)))?;

    Ok(Some(FeedbackRequest {
        token: RequestToken(token),
        business_id: BusinessId(business_id),
        order_id: OrderId(order_id),
        customer_contact: contact,
        status,
        expires_at: from_millis(expires_at, "request expires_at")?,
        created_at: from_millis(created_at, "request created_at")?,
        responded_at: responded_at
            .map(|ms| from_millis(ms, "request responded_at"))
            .transpose()?,
    }))
}

pub(super) fn redeem_sync(
    conn: &Connection,
    token: &RequestToken,
    record: &FeedbackRecord,
    now: DateTime<Utc>,
    review_limit: u32,
    jobs: &[NewJob],
) -> Result<RedeemOutcome, RepositoryError> {
    let Some(request) = get_request_sync(conn, token)? else {
        return Ok(RedeemOutcome::UnknownToken);
    };

    if let Err(rejection) = request.check_redeemable(now) {
        if rejection == RedeemRejection::Expired && request.status == RequestStatus::Pending {
            conn.execute(
                "UPDATE feedback_requests SET status = 'expired'
                 WHERE token = ?1 AND status = 'pending'",
                params![token.0],
            )
            .map_err(sql_err("expire request"))?;
        }
        return Ok(RedeemOutcome::Rejected(rejection));
    }

    let count = records::count_business_sync(conn, &record.business_id)?;
    if count >= u64::from(review_limit) {
        return Ok(RedeemOutcome::QuotaExceeded {
            limit: review_limit,
        });
    }

    records::insert_record_sync(conn, record)?;

    let marked = conn
        .execute(
            "UPDATE feedback_requests SET status = 'responded', responded_at = ?2
             WHERE token = ?1 AND status = 'pending'",
            params![token.0, to_millis(now)],
        )
        .map_err(sql_err("mark request responded"))?;
    if marked == 0 {
        // Impossible under the write lock; roll back rather than leave a
        // record whose request is not marked responded.
        return Err(RepositoryError::storage(
            "mark request responded",
            format!("request {} changed during redemption", token.short()),
        ));
    }

    jobs::enqueue_sync(conn, jobs, now)?;
    Ok(RedeemOutcome::Redeemed)
}
