//! In-memory implementation of `FeedbackRepository`.
//!
//! All state lives behind a single `RwLock`, so every multi-step operation
//! (redemption, quota-checked insert, CAS plus job enqueue) holds one write
//! guard for its whole duration. State is lost on restart.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use verdict_core::{
    BusinessId, FeedbackRecord, FeedbackRequest, FeedbackStatus, Plan, RecordId, RedeemRejection,
    RequestStatus, RequestToken,
};

use super::{
    order_key, CasOutcome, CreateRecordOutcome, FeedbackRepository, InsertRequestOutcome,
    PlanSource, RedeemOutcome, RepositoryError,
};
use crate::jobs::{Job, JobCounts, JobState, NewJob};

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestToken, FeedbackRequest>,
    records: HashMap<RecordId, FeedbackRecord>,
    order_keys: HashSet<String>,
    plans: HashMap<BusinessId, Plan>,
    jobs: BTreeMap<i64, Job>,
    job_keys: HashSet<String>,
    next_job_id: i64,
}

impl Inner {
    fn enqueue(&mut self, jobs: &[NewJob]) -> usize {
        let mut inserted = 0;
        for job in jobs {
            if !self.job_keys.insert(job.dedupe_key.clone()) {
                let buried = self.jobs.values_mut().find(|existing| {
                    existing.dedupe_key == job.dedupe_key && existing.state == JobState::Buried
                });
                if let Some(existing) = buried {
                    existing.kind = job.kind.clone();
                    existing.state = JobState::Queued;
                    existing.run_at = job.run_at;
                    existing.attempts = 0;
                    existing.lease_until = None;
                    existing.last_error = None;
                    inserted += 1;
                }
                continue;
            }
            self.next_job_id += 1;
            let id = self.next_job_id;
            self.jobs.insert(
                id,
                Job {
                    id,
                    dedupe_key: job.dedupe_key.clone(),
                    kind: job.kind.clone(),
                    state: JobState::Queued,
                    run_at: job.run_at,
                    attempts: 0,
                    lease_until: None,
                    last_error: None,
                },
            );
            inserted += 1;
        }
        inserted
    }

    fn business_record_count(&self, business: &BusinessId) -> u64 {
        self.records
            .values()
            .filter(|r| &r.business_id == business)
            .count() as u64
    }

    fn job_mut(&mut self, id: i64, operation: &'static str) -> Result<&mut Job, RepositoryError> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::storage(operation, format!("no job with id {}", id)))
    }
}

/// In-memory feedback repository.
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedbackRepository for InMemoryRepository {
    // =========================================================================
    // Feedback requests
    // =========================================================================

    async fn insert_request(
        &self,
        request: &FeedbackRequest,
        jobs: &[NewJob],
    ) -> Result<InsertRequestOutcome, RepositoryError> {
        let mut inner = self.inner.write().await;
        let duplicate = inner.requests.contains_key(&request.token)
            || inner.requests.values().any(|r| {
                r.business_id == request.business_id
                    && r.order_id == request.order_id
                    && r.customer_contact == request.customer_contact
            });
        if duplicate {
            return Ok(InsertRequestOutcome::Duplicate);
        }
        inner.requests.insert(request.token.clone(), request.clone());
        inner.enqueue(jobs);
        Ok(InsertRequestOutcome::Inserted)
    }

    async fn get_request(
        &self,
        token: &RequestToken,
    ) -> Result<Option<FeedbackRequest>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.requests.get(token).cloned())
    }

    async fn expire_request(
        &self,
        token: &RequestToken,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        match inner.requests.get_mut(token) {
            Some(request)
                if request.status == RequestStatus::Pending && request.is_past_expiry(now) =>
            {
                request.status = RequestStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_stale_requests(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut inner = self.inner.write().await;
        let mut expired = 0;
        for request in inner.requests.values_mut() {
            if request.status == RequestStatus::Pending && request.is_past_expiry(now) {
                request.status = RequestStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn mark_request_invalid(&self, token: &RequestToken) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        match inner.requests.get_mut(token) {
            Some(request) if request.status == RequestStatus::Pending => {
                request.status = RequestStatus::Invalid;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn redeem_request(
        &self,
        token: &RequestToken,
        record: &FeedbackRecord,
        now: DateTime<Utc>,
        review_limit: u32,
        jobs: &[NewJob],
    ) -> Result<RedeemOutcome, RepositoryError> {
        let mut inner = self.inner.write().await;

        let Some(request) = inner.requests.get_mut(token) else {
            return Ok(RedeemOutcome::UnknownToken);
        };
        if let Err(rejection) = request.check_redeemable(now) {
            if rejection == RedeemRejection::Expired && request.status == RequestStatus::Pending {
                request.status = RequestStatus::Expired;
            }
            return Ok(RedeemOutcome::Rejected(rejection));
        }

        let count = inner.business_record_count(&record.business_id);
        if count >= u64::from(review_limit) {
            return Ok(RedeemOutcome::QuotaExceeded {
                limit: review_limit,
            });
        }

        if let Some(request) = inner.requests.get_mut(token) {
            request.status = RequestStatus::Responded;
            request.responded_at = Some(now);
        }
        inner.records.insert(record.id, record.clone());
        inner.enqueue(jobs);
        Ok(RedeemOutcome::Redeemed)
    }

    // =========================================================================
    // Feedback records
    // =========================================================================

    async fn create_record(
        &self,
        record: &FeedbackRecord,
        review_limit: u32,
        jobs: &[NewJob],
    ) -> Result<CreateRecordOutcome, RepositoryError> {
        let mut inner = self.inner.write().await;

        let key = order_key(record);
        if let Some(key) = &key {
            if inner.order_keys.contains(key) {
                return Ok(CreateRecordOutcome::DuplicateOrder);
            }
        }

        let count = inner.business_record_count(&record.business_id);
        if count >= u64::from(review_limit) {
            return Ok(CreateRecordOutcome::QuotaExceeded {
                limit: review_limit,
            });
        }

        if let Some(key) = key {
            inner.order_keys.insert(key);
        }
        inner.records.insert(record.id, record.clone());
        inner.enqueue(jobs);
        Ok(CreateRecordOutcome::Created)
    }

    async fn get_record(&self, id: RecordId) -> Result<Option<FeedbackRecord>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.records.get(&id).cloned())
    }

    async fn compare_and_set(
        &self,
        expected: &FeedbackRecord,
        updated: &FeedbackRecord,
        jobs: &[NewJob],
    ) -> Result<CasOutcome, RepositoryError> {
        let mut inner = self.inner.write().await;
        let Some(stored) = inner.records.get_mut(&expected.id) else {
            return Ok(CasOutcome::NotFound);
        };
        if stored.status != expected.status || stored.revision != expected.revision {
            return Ok(CasOutcome::Stale(stored.clone()));
        }
        *stored = updated.clone();
        inner.enqueue(jobs);
        Ok(CasOutcome::Applied)
    }

    async fn list_due_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FeedbackRecord>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut due: Vec<FeedbackRecord> = inner
            .records
            .values()
            .filter(|r| {
                r.status == FeedbackStatus::PendingModeration
                    && r.auto_publish_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.auto_publish_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn list_business_records(
        &self,
        business: &BusinessId,
    ) -> Result<Vec<FeedbackRecord>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut records: Vec<FeedbackRecord> = inner
            .records
            .values()
            .filter(|r| &r.business_id == business)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn count_business_records(&self, business: &BusinessId) -> Result<u64, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.business_record_count(business))
    }

    // =========================================================================
    // Plans
    // =========================================================================

    async fn put_plan(&self, business: &BusinessId, plan: Plan) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        inner.plans.insert(business.clone(), plan);
        Ok(())
    }

    // =========================================================================
    // Job queue
    // =========================================================================

    async fn enqueue_jobs(
        &self,
        jobs: &[NewJob],
        _now: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        let mut inner = self.inner.write().await;
        Ok(inner.enqueue(jobs))
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<Job>, RepositoryError> {
        let mut inner = self.inner.write().await;
        let mut due: Vec<&mut Job> = inner
            .jobs
            .values_mut()
            .filter(|job| match job.state {
                JobState::Queued => job.run_at <= now,
                JobState::Running => job.lease_until.is_some_and(|until| until <= now),
                JobState::Done | JobState::Buried => false,
            })
            .collect();
        due.sort_by_key(|job| (job.run_at, job.id));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.state = JobState::Running;
                job.lease_until = Some(now + lease);
                job.clone()
            })
            .collect())
    }

    async fn complete_job(&self, id: i64) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(id, "complete job")?;
        job.state = JobState::Done;
        job.lease_until = None;
        Ok(())
    }

    async fn retry_job(
        &self,
        id: i64,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(id, "retry job")?;
        job.state = JobState::Queued;
        job.attempts += 1;
        job.run_at = run_at;
        job.lease_until = None;
        job.last_error = Some(error.to_string());
        Ok(())
    }

    async fn release_job(&self, id: i64, run_at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(id, "release job")?;
        job.state = JobState::Queued;
        job.run_at = run_at;
        job.lease_until = None;
        Ok(())
    }

    async fn bury_job(&self, id: i64, error: &str) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        let job = inner.job_mut(id, "bury job")?;
        job.state = JobState::Buried;
        job.attempts += 1;
        job.lease_until = None;
        job.last_error = Some(error.to_string());
        Ok(())
    }

    async fn job_counts(&self) -> Result<JobCounts, RepositoryError> {
        let inner = self.inner.read().await;
        let mut counts = JobCounts::default();
        for job in inner.jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| state.map_or(true, |s| job.state == s))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PlanSource for InMemoryRepository {
    async fn plan_for(&self, business: &BusinessId) -> Result<Option<Plan>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.plans.get(business).copied())
    }
}
