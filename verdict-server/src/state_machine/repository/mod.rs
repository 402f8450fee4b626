//! Repository abstraction for feedback persistence.
//!
//! This module defines the `FeedbackRepository` trait that abstracts storage
//! of feedback requests, feedback records, plans and the job queue.
//! Implementations provide different backends (in-memory, SQLite).
//!
//! Every operation that must be atomic is a single trait method: token
//! redemption, quota-checked creation, and compare-and-set all commit their
//! queued jobs in the same transaction as the row they change.

mod memory;
mod sqlite;
#[cfg(test)]
pub(crate) mod test_support;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use verdict_core::{
    BusinessId, FeedbackRecord, FeedbackRequest, Plan, RecordId, RedeemRejection, RequestToken,
};

use crate::jobs::{Job, JobCounts, JobState, NewJob};

/// Error type for repository operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// The backing store failed.
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    /// Stored data could not be decoded.
    #[error("corrupt {what} in storage")]
    Corruption { what: String },

    /// A compare-and-set kept losing to concurrent writers.
    #[error("feedback {record_id} still contended after {attempts} attempts")]
    Contention { record_id: String, attempts: u32 },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }
}

/// Result of inserting a new feedback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertRequestOutcome {
    Inserted,
    /// A request for the same (business, order, contact) already exists.
    Duplicate,
}

/// Result of an atomic token redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// Record created, request marked responded, jobs queued.
    Redeemed,
    UnknownToken,
    /// The request was not redeemable. An overdue pending request is marked
    /// expired as part of this call.
    Rejected(RedeemRejection),
    QuotaExceeded { limit: u32 },
}

/// Result of creating a record directly against an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateRecordOutcome {
    Created,
    /// The business already holds feedback for this order.
    DuplicateOrder,
    QuotaExceeded { limit: u32 },
}

/// Result of a compare-and-set on a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The stored record moved on; carries what is stored now.
    Stale(FeedbackRecord),
    NotFound,
}

/// Repository trait for persisting feedback state.
#[async_trait]
pub trait FeedbackRepository: Send + Sync {
    // =========================================================================
    // Feedback requests
    // =========================================================================

    /// Store a new pending request together with its jobs (the invitation).
    async fn insert_request(
        &self,
        request: &FeedbackRequest,
        jobs: &[NewJob],
    ) -> Result<InsertRequestOutcome, RepositoryError>;

    async fn get_request(
        &self,
        token: &RequestToken,
    ) -> Result<Option<FeedbackRequest>, RepositoryError>;

    /// Mark one pending request expired if it is past its deadline at `now`.
    /// Returns whether the request changed.
    async fn expire_request(
        &self,
        token: &RequestToken,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Mark every pending request past its deadline as expired.
    async fn expire_stale_requests(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError>;

    /// Mark a pending request invalid. Returns whether it changed.
    async fn mark_request_invalid(&self, token: &RequestToken) -> Result<bool, RepositoryError>;

    /// Redeem a token: check the request is pending and unexpired, check the
    /// business quota, insert the record, mark the request responded and
    /// queue the jobs, all in one transaction.
    async fn redeem_request(
        &self,
        token: &RequestToken,
        record: &FeedbackRecord,
        now: DateTime<Utc>,
        review_limit: u32,
        jobs: &[NewJob],
    ) -> Result<RedeemOutcome, RepositoryError>;

    // =========================================================================
    // Feedback records
    // =========================================================================

    /// Insert an order-direct record under the quota, one per (business, order).
    async fn create_record(
        &self,
        record: &FeedbackRecord,
        review_limit: u32,
        jobs: &[NewJob],
    ) -> Result<CreateRecordOutcome, RepositoryError>;

    async fn get_record(&self, id: RecordId) -> Result<Option<FeedbackRecord>, RepositoryError>;

    /// Replace `expected` with `updated` iff the stored record still has the
    /// status and revision of `expected`; queue `jobs` on success.
    async fn compare_and_set(
        &self,
        expected: &FeedbackRecord,
        updated: &FeedbackRecord,
        jobs: &[NewJob],
    ) -> Result<CasOutcome, RepositoryError>;

    /// Pending records whose deadline is at or before `now`, oldest deadline first.
    async fn list_due_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FeedbackRecord>, RepositoryError>;

    async fn list_business_records(
        &self,
        business: &BusinessId,
    ) -> Result<Vec<FeedbackRecord>, RepositoryError>;

    async fn count_business_records(&self, business: &BusinessId) -> Result<u64, RepositoryError>;

    // =========================================================================
    // Plans
    // =========================================================================

    async fn put_plan(&self, business: &BusinessId, plan: Plan) -> Result<(), RepositoryError>;

    // =========================================================================
    // Job queue
    // =========================================================================

    /// Queue jobs, skipping any whose dedupe key already exists unless that
    /// job was buried, in which case it is queued again. Returns the number
    /// inserted or revived.
    async fn enqueue_jobs(
        &self,
        jobs: &[NewJob],
        now: DateTime<Utc>,
    ) -> Result<usize, RepositoryError>;

    /// Lease up to `limit` due jobs. Running jobs whose lease ran out are
    /// claimable again.
    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Job>, RepositoryError>;

    async fn complete_job(&self, id: i64) -> Result<(), RepositoryError>;

    /// Count a failure and requeue the job for `run_at`.
    async fn retry_job(
        &self,
        id: i64,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), RepositoryError>;

    /// Requeue the job for `run_at` without counting a failure.
    async fn release_job(&self, id: i64, run_at: DateTime<Utc>) -> Result<(), RepositoryError>;

    /// Count a failure and stop retrying the job.
    async fn bury_job(&self, id: i64, error: &str) -> Result<(), RepositoryError>;

    async fn job_counts(&self) -> Result<JobCounts, RepositoryError>;

    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, RepositoryError>;
}

/// Source of the active plan for a business.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn plan_for(&self, business: &BusinessId) -> Result<Option<Plan>, RepositoryError>;
}

/// Key enforcing one order-direct record per (business, order).
pub(crate) fn order_key(record: &FeedbackRecord) -> Option<String> {
    match &record.origin {
        verdict_core::Origin::OrderSubmission { order_id } => {
            Some(format!("{}\u{1f}{}", record.business_id, order_id))
        }
        verdict_core::Origin::InvitationSubmission { .. } => None,
    }
}
