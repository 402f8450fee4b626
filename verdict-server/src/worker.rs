//! Job worker: drains the durable job queue.
//!
//! Each poll claims a batch of due jobs under a lease and runs them
//! concurrently, each under its own timeout. Outcomes are settled one job at
//! a time, so a failing job never holds up the rest of the batch:
//!
//! - success: the job is marked done
//! - not yet due (an auto-publish claimed before its deadline): released
//!   back to the queue at the deadline
//! - transient failure: re-queued with exponential backoff
//! - retries exhausted or permanent failure: buried and logged at error level
//!
//! Reminder jobs get fewer attempts than everything else.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use serde_json::json;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use verdict_core::{RecordId, RequestStatus, RequestToken};

use crate::jobs::{Job, JobKind};
use crate::notify::{Audience, DispatchError, Notification, Notifier, Template};
use crate::scheduler::{AutoPublishScheduler, ExecuteOutcome, SkipReason};
use crate::state_machine::repository::{FeedbackRepository, RepositoryError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum jobs claimed per poll.
    pub batch_size: usize,
    /// How long a claimed job stays invisible to other workers.
    pub lease: Duration,
    pub job_timeout: std::time::Duration,
    pub max_attempts: u32,
    pub reminder_max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            lease: Duration::minutes(5),
            job_timeout: std::time::Duration::from_secs(30),
            max_attempts: 5,
            reminder_max_attempts: 2,
            retry_base: Duration::seconds(30),
            retry_max: Duration::hours(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("job timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

impl JobError {
    /// Failures that retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Dispatch(DispatchError::Rejected(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Done,
    Deferred(DateTime<Utc>),
}

/// What one poll did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub claimed: usize,
    pub completed: usize,
    pub deferred: usize,
    pub retried: usize,
    pub buried: usize,
}

/// Delay before retrying a job that has failed `failures` times:
/// `base * 2^(failures - 1)`, capped at `max`.
pub fn retry_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(20);
    let millis = base
        .num_milliseconds()
        .saturating_mul(2i64.saturating_pow(exponent));
    Duration::milliseconds(millis).min(max)
}

pub struct JobWorker {
    repo: Arc<dyn FeedbackRepository>,
    scheduler: AutoPublishScheduler,
    notifier: Arc<dyn Notifier>,
    config: WorkerConfig,
}

impl JobWorker {
    pub fn new(
        scheduler: AutoPublishScheduler,
        notifier: Arc<dyn Notifier>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            repo: scheduler.store().repository().clone(),
            scheduler,
            notifier,
            config,
        }
    }

    /// Claim and run one batch of due jobs.
    ///
    /// Only a failure to claim is returned as an error; failures of
    /// individual jobs are recorded on the jobs themselves.
    pub async fn run_due_jobs(&self) -> Result<WorkerReport, RepositoryError> {
        let now = self.scheduler.clock().now();
        let jobs = self
            .repo
            .claim_due_jobs(now, self.config.batch_size, self.config.lease)
            .await?;

        let mut report = WorkerReport {
            claimed: jobs.len(),
            ..Default::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }
        debug!("Claimed {} job(s)", jobs.len());

        let results = join_all(jobs.iter().map(|job| self.run_with_timeout(job))).await;

        for (job, result) in jobs.iter().zip(results) {
            if let Err(e) = self.settle(job, result, &mut report).await {
                // The lease will expire and the job will be claimed again.
                error!(
                    "Failed to record outcome of job {} ({}): {}",
                    job.id,
                    job.kind.label(),
                    e
                );
            }
        }

        Ok(report)
    }

    async fn run_with_timeout(&self, job: &Job) -> Result<JobOutcome, JobError> {
        match tokio::time::timeout(self.config.job_timeout, self.handle(&job.kind)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::TimedOut(self.config.job_timeout)),
        }
    }

    async fn handle(&self, kind: &JobKind) -> Result<JobOutcome, JobError> {
        match kind {
            JobKind::AutoPublish { record_id } => {
                match self.scheduler.execute(*record_id).await? {
                    ExecuteOutcome::Skipped(SkipReason::NotDue { due_at }) => {
                        Ok(JobOutcome::Deferred(due_at))
                    }
                    _ => Ok(JobOutcome::Done),
                }
            }
            JobKind::Reminder {
                record_id,
                days_remaining,
            } => self.send_reminder(*record_id, *days_remaining).await,
            JobKind::Notify {
                record_id,
                audience,
                template,
            } => self.send_record_notification(*record_id, *audience, *template).await,
            JobKind::Invite { token } => self.send_invitation(token).await,
        }
    }

    async fn send_reminder(
        &self,
        record_id: RecordId,
        days_remaining: u32,
    ) -> Result<JobOutcome, JobError> {
        let Some(record) = self.repo.get_record(record_id).await? else {
            warn!("Reminder for unknown feedback {}", record_id);
            return Ok(JobOutcome::Done);
        };
        if !record.is_pending() {
            debug!(
                "Reminder for feedback {} skipped: already {}",
                record_id, record.status
            );
            return Ok(JobOutcome::Done);
        }

        let notification = Notification::for_record(
            &record,
            Audience::Business,
            Template::BusinessReminder,
            &days_remaining.to_string(),
            json!({ "days_remaining": days_remaining }),
        );
        self.notifier.send(&notification).await?;
        info!(
            "Reminded {} about feedback {} ({} day(s) left)",
            record.business_id, record_id, days_remaining
        );
        Ok(JobOutcome::Done)
    }

    async fn send_record_notification(
        &self,
        record_id: RecordId,
        audience: Audience,
        template: Template,
    ) -> Result<JobOutcome, JobError> {
        let Some(record) = self.repo.get_record(record_id).await? else {
            warn!("Dropping {} for unknown feedback {}", template, record_id);
            return Ok(JobOutcome::Done);
        };
        let notification = Notification::for_record(&record, audience, template, "", json!({}));
        self.notifier.send(&notification).await?;
        Ok(JobOutcome::Done)
    }

    async fn send_invitation(&self, token: &RequestToken) -> Result<JobOutcome, JobError> {
        let Some(request) = self.repo.get_request(token).await? else {
            warn!("Dropping invitation for unknown request {}", token.short());
            return Ok(JobOutcome::Done);
        };
        if request.status != RequestStatus::Pending {
            debug!(
                "Invitation {} not sent: request is {}",
                token.short(),
                request.status
            );
            return Ok(JobOutcome::Done);
        }
        self.notifier
            .send(&Notification::invitation(&request))
            .await?;
        Ok(JobOutcome::Done)
    }

    fn max_attempts(&self, kind: &JobKind) -> u32 {
        match kind {
            JobKind::Reminder { .. } => self.config.reminder_max_attempts,
            _ => self.config.max_attempts,
        }
    }

    async fn settle(
        &self,
        job: &Job,
        result: Result<JobOutcome, JobError>,
        report: &mut WorkerReport,
    ) -> Result<(), RepositoryError> {
        match result {
            Ok(JobOutcome::Done) => {
                self.repo.complete_job(job.id).await?;
                report.completed += 1;
            }
            Ok(JobOutcome::Deferred(run_at)) => {
                self.repo.release_job(job.id, run_at).await?;
                report.deferred += 1;
            }
            Err(e) => {
                let failures = job.attempts.saturating_add(1);
                let max_attempts = self.max_attempts(&job.kind);
                if e.is_permanent() || failures >= max_attempts {
                    error!(
                        "Job {} ({}, {}) failed permanently after {} attempt(s): {}",
                        job.id,
                        job.kind.label(),
                        job.dedupe_key,
                        failures,
                        e
                    );
                    self.repo.bury_job(job.id, &e.to_string()).await?;
                    report.buried += 1;
                } else {
                    let delay =
                        retry_delay(self.config.retry_base, self.config.retry_max, failures);
                    let run_at = self.scheduler.clock().now() + delay;
                    warn!(
                        "Job {} ({}) failed (attempt {}/{}), retrying at {}: {}",
                        job.id,
                        job.kind.label(),
                        failures,
                        max_attempts,
                        run_at,
                        e
                    );
                    self.repo.retry_job(job.id, run_at, &e.to_string()).await?;
                    report.retried += 1;
                }
            }
        }
        Ok(())
    }
}

/// Poll the job queue forever.
pub async fn job_worker_loop(worker: Arc<JobWorker>, poll_interval: std::time::Duration) {
    let mut interval = interval(poll_interval);

    loop {
        interval.tick().await;

        match worker.run_due_jobs().await {
            Ok(report) if report.claimed > 0 => {
                info!(
                    "Ran {} job(s): {} done, {} deferred, {} retried, {} buried",
                    report.claimed,
                    report.completed,
                    report.deferred,
                    report.retried,
                    report.buried
                );
            }
            Ok(_) => {}
            Err(e) => error!("Error claiming jobs: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::jobs::{JobState, NewJob};
    use crate::notify::MemoryNotifier;
    use crate::state_machine::interpreter::jobs_for;
    use crate::state_machine::repository::test_support::*;
    use crate::state_machine::repository::InMemoryRepository;
    use crate::state_machine::{on_created, Event, RecordStore};
    use async_trait::async_trait;
    use verdict_core::{FeedbackRecord, FeedbackStatus, ModerationPolicy};

    struct Harness {
        repo: Arc<InMemoryRepository>,
        clock: Arc<ManualClock>,
        notifier: Arc<MemoryNotifier>,
        worker: JobWorker,
    }

    fn harness(config: WorkerConfig) -> Harness {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let notifier = Arc::new(MemoryNotifier::new());
        let scheduler = AutoPublishScheduler::new(RecordStore::new(repo.clone()), clock.clone());
        let worker = JobWorker::new(scheduler, notifier.clone(), config);
        Harness {
            repo,
            clock,
            notifier,
            worker,
        }
    }

    async fn create_with_jobs(repo: &InMemoryRepository, record: &FeedbackRecord) {
        let policy = ModerationPolicy::default();
        let reminders = policy.reminder_schedule(record.created_at, record.created_at);
        let jobs = jobs_for(record, &on_created(record, &reminders), record.created_at);
        repo.create_record(record, 100, &jobs).await.unwrap();
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let base = Duration::seconds(30);
        let max = Duration::minutes(5);
        assert_eq!(retry_delay(base, max, 1), Duration::seconds(30));
        assert_eq!(retry_delay(base, max, 2), Duration::seconds(60));
        assert_eq!(retry_delay(base, max, 3), Duration::seconds(120));
        assert_eq!(retry_delay(base, max, 5), max);
        assert_eq!(retry_delay(base, max, u32::MAX), max);
    }

    #[tokio::test]
    async fn test_positive_record_sends_thank_you() {
        let h = harness(WorkerConfig::default());
        let record = positive_record("acme", "o-1", t0());
        create_with_jobs(&h.repo, &record).await;

        let report = h.worker.run_due_jobs().await.unwrap();
        assert_eq!((report.claimed, report.completed), (1, 1));
        let sent = h.notifier.sent_with(Template::CustomerThankYou);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "customer@example.com");
        assert_eq!(h.repo.job_counts().await.unwrap().done, 1);
    }

    #[tokio::test]
    async fn test_negative_record_runs_through_deadline() {
        let h = harness(WorkerConfig::default());
        let record = pending_record("acme", "o-1", t0());
        create_with_jobs(&h.repo, &record).await;

        // Thank-you and the business alert go out immediately.
        let report = h.worker.run_due_jobs().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(h.notifier.sent_with(Template::BusinessNegativeFeedback).len(), 1);

        for day in 1..=7 {
            h.clock.set(t0() + Duration::days(day));
            h.worker.run_due_jobs().await.unwrap();
        }

        let reminders = h.notifier.sent_with(Template::BusinessReminder);
        let days: Vec<_> = reminders
            .iter()
            .map(|n| n.context["days_remaining"].as_u64().unwrap())
            .collect();
        assert_eq!(days, vec![4, 2, 1]);

        let stored = h.repo.get_record(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FeedbackStatus::AutoPublished);

        // The auto-publish transition queued its own notifications.
        h.worker.run_due_jobs().await.unwrap();
        assert_eq!(h.notifier.sent_with(Template::BusinessAutoPublished).len(), 1);
        assert_eq!(
            h.notifier.sent_with(Template::CustomerFeedbackPublished).len(),
            1
        );
        let counts = h.repo.job_counts().await.unwrap();
        assert_eq!((counts.queued, counts.running, counts.buried), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_early_auto_publish_job_is_deferred_to_deadline() {
        let h = harness(WorkerConfig::default());
        let record = pending_record("acme", "o-1", t0());
        h.repo.create_record(&record, 10, &[]).await.unwrap();
        let due = record.auto_publish_at.unwrap();
        h.repo
            .enqueue_jobs(&[NewJob::auto_publish(record.id, t0())], t0())
            .await
            .unwrap();

        let report = h.worker.run_due_jobs().await.unwrap();
        assert_eq!(report.deferred, 1);
        let queued = h.repo.list_jobs(Some(JobState::Queued), 10).await.unwrap();
        assert_eq!(queued[0].run_at, due);
        assert_eq!(queued[0].attempts, 0);

        h.clock.set(due);
        h.worker.run_due_jobs().await.unwrap();
        assert_eq!(
            h.repo.get_record(record.id).await.unwrap().unwrap().status,
            FeedbackStatus::AutoPublished
        );
    }

    #[tokio::test]
    async fn test_reminder_skipped_after_response() {
        let h = harness(WorkerConfig::default());
        let record = pending_record("acme", "o-1", t0());
        h.repo
            .create_record(
                &record,
                10,
                &[NewJob::reminder(record.id, t0() + Duration::days(3), 4)],
            )
            .await
            .unwrap();

        RecordStore::new(h.repo.clone())
            .apply(
                record.id,
                Event::StoreResponded {
                    response: "We refunded the order.".to_string(),
                    at: t0() + Duration::days(1),
                },
            )
            .await
            .unwrap();

        h.clock.set(t0() + Duration::days(3));
        let report = h.worker.run_due_jobs().await.unwrap();
        assert!(report.completed >= 1);
        assert!(h.notifier.sent_with(Template::BusinessReminder).is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_with_backoff() {
        let h = harness(WorkerConfig::default());
        let record = positive_record("acme", "o-1", t0());
        create_with_jobs(&h.repo, &record).await;

        h.notifier.fail_next(1);
        let report = h.worker.run_due_jobs().await.unwrap();
        assert_eq!(report.retried, 1);

        let queued = h.repo.list_jobs(Some(JobState::Queued), 10).await.unwrap();
        assert_eq!(queued[0].attempts, 1);
        assert_eq!(queued[0].run_at, t0() + Duration::seconds(30));
        assert!(queued[0].last_error.is_some());

        // Not due yet.
        assert_eq!(h.worker.run_due_jobs().await.unwrap().claimed, 0);

        h.clock.advance(Duration::seconds(30));
        let report = h.worker.run_due_jobs().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(h.notifier.sent_with(Template::CustomerThankYou).len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_job_is_buried_and_others_continue() {
        let h = harness(WorkerConfig {
            max_attempts: 2,
            ..WorkerConfig::default()
        });
        let first = positive_record("acme", "o-1", t0());
        create_with_jobs(&h.repo, &first).await;

        h.notifier.fail_next(2);
        h.worker.run_due_jobs().await.unwrap();
        h.clock.advance(Duration::minutes(1));
        let report = h.worker.run_due_jobs().await.unwrap();
        assert_eq!(report.buried, 1);

        let buried = h.repo.list_jobs(Some(JobState::Buried), 10).await.unwrap();
        assert_eq!(buried.len(), 1);
        assert_eq!(buried[0].attempts, 2);

        let second = positive_record("acme", "o-2", h.clock.now());
        create_with_jobs(&h.repo, &second).await;
        let report = h.worker.run_due_jobs().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(h.notifier.sent_with(Template::CustomerThankYou).len(), 1);
    }

    #[tokio::test]
    async fn test_reminders_get_fewer_attempts() {
        let h = harness(WorkerConfig {
            max_attempts: 5,
            reminder_max_attempts: 1,
            ..WorkerConfig::default()
        });
        let record = pending_record("acme", "o-1", t0());
        h.repo
            .create_record(&record, 10, &[NewJob::reminder(record.id, t0(), 4)])
            .await
            .unwrap();

        h.notifier.fail_next(1);
        let report = h.worker.run_due_jobs().await.unwrap();
        assert_eq!(report.buried, 1);
    }

    struct RejectingNotifier;

    #[async_trait]
    impl Notifier for RejectingNotifier {
        async fn send(&self, _: &Notification) -> Result<(), DispatchError> {
            Err(DispatchError::Rejected("mailbox does not exist".to_string()))
        }
    }

    struct StalledNotifier;

    #[async_trait]
    impl Notifier for StalledNotifier {
        async fn send(&self, _: &Notification) -> Result<(), DispatchError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn worker_with(
        repo: Arc<InMemoryRepository>,
        notifier: Arc<dyn Notifier>,
        config: WorkerConfig,
    ) -> JobWorker {
        let clock = Arc::new(ManualClock::new(t0()));
        JobWorker::new(
            AutoPublishScheduler::new(RecordStore::new(repo), clock),
            notifier,
            config,
        )
    }

    #[tokio::test]
    async fn test_rejected_dispatch_is_buried_immediately() {
        let repo = Arc::new(InMemoryRepository::new());
        let worker = worker_with(
            repo.clone(),
            Arc::new(RejectingNotifier),
            WorkerConfig::default(),
        );
        create_with_jobs(&repo, &positive_record("acme", "o-1", t0())).await;

        let report = worker.run_due_jobs().await.unwrap();
        assert_eq!(report.buried, 1);
    }

    #[tokio::test]
    async fn test_stalled_job_times_out() {
        let repo = Arc::new(InMemoryRepository::new());
        let worker = worker_with(
            repo.clone(),
            Arc::new(StalledNotifier),
            WorkerConfig {
                job_timeout: std::time::Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        );
        create_with_jobs(&repo, &positive_record("acme", "o-1", t0())).await;

        let report = worker.run_due_jobs().await.unwrap();
        assert_eq!(report.retried, 1);
        let queued = repo.list_jobs(Some(JobState::Queued), 10).await.unwrap();
        assert!(queued[0]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("timed out")));
    }
}
