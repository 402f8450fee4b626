//! Auto-publish scheduler.
//!
//! Arming a deadline enqueues a keyed `auto_publish` job; firing it goes
//! through the state machine like any other event. `execute` is safe to call
//! any number of times, from the job worker or from the reconciliation sweep:
//! it re-reads the record and only fires while the record is still pending
//! and its deadline has passed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use verdict_core::{FeedbackRecord, FeedbackStatus, RecordId};

use crate::clock::Clock;
use crate::jobs::NewJob;
use crate::state_machine::repository::RepositoryError;
use crate::state_machine::{Applied, Event, RecordStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("feedback {0} not found")]
    NotFound(RecordId),

    #[error("feedback {record_id} is {status}, not awaiting auto-publish")]
    NotPending {
        record_id: RecordId,
        status: FeedbackStatus,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Why an execution did not fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    /// Already resolved by a response, an earlier firing or a moderator.
    NotPending(FeedbackStatus),
    NoDeadline,
    NotDue { due_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Fired(FeedbackRecord),
    Skipped(SkipReason),
}

/// Why `record` cannot be auto-published at `now`, if it cannot.
pub fn skip_reason(record: &FeedbackRecord, now: DateTime<Utc>) -> Option<SkipReason> {
    if !record.is_pending() {
        return Some(SkipReason::NotPending(record.status));
    }
    match record.auto_publish_at {
        None => Some(SkipReason::NoDeadline),
        Some(due_at) if now < due_at => Some(SkipReason::NotDue { due_at }),
        Some(_) => None,
    }
}

#[derive(Clone)]
pub struct AutoPublishScheduler {
    store: RecordStore,
    clock: Arc<dyn Clock>,
}

impl AutoPublishScheduler {
    pub fn new(store: RecordStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Re-arm the auto-publish job for a pending record.
    ///
    /// Creation arms the job in the same transaction as the insert, so this
    /// is the operator path for a job that was buried or lost. It shares the
    /// creation job's dedupe key, and returns `false` if that deadline is
    /// already in the queue.
    pub async fn schedule(
        &self,
        record_id: RecordId,
        fire_at: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let record = self
            .store
            .get(record_id)
            .await?
            .ok_or(ScheduleError::NotFound(record_id))?;

        if !record.is_pending() || record.auto_publish_at.is_none() {
            return Err(ScheduleError::NotPending {
                record_id,
                status: record.status,
            });
        }

        let inserted = self
            .store
            .repository()
            .enqueue_jobs(&[NewJob::auto_publish(record_id, fire_at)], self.clock.now())
            .await?;
        if inserted == 0 {
            debug!("Auto-publish for {} at {} already armed", record_id, fire_at);
        }
        Ok(inserted > 0)
    }

    /// Fire the auto-publish transition if it is still due.
    pub async fn execute(&self, record_id: RecordId) -> Result<ExecuteOutcome, RepositoryError> {
        let now = self.clock.now();

        let Some(record) = self.store.get(record_id).await? else {
            return Ok(ExecuteOutcome::Skipped(SkipReason::NotFound));
        };
        if let Some(reason) = skip_reason(&record, now) {
            debug!("Auto-publish of {} skipped: {:?}", record_id, reason);
            return Ok(ExecuteOutcome::Skipped(reason));
        }

        match self
            .store
            .apply(record_id, Event::AutoPublishDue { at: now })
            .await?
        {
            Applied::Changed(record) => Ok(ExecuteOutcome::Fired(record)),
            // Lost a race with a response or another firing; report what won.
            Applied::Unchanged(record) => Ok(ExecuteOutcome::Skipped(
                skip_reason(&record, now).unwrap_or(SkipReason::NotPending(record.status)),
            )),
            Applied::NotFound => Ok(ExecuteOutcome::Skipped(SkipReason::NotFound)),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::JobState;
    use crate::state_machine::repository::test_support::*;
    use crate::state_machine::repository::{FeedbackRepository, InMemoryRepository};
    use chrono::Duration;

    fn setup() -> (Arc<InMemoryRepository>, Arc<ManualClock>, AutoPublishScheduler) {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = AutoPublishScheduler::new(RecordStore::new(repo.clone()), clock.clone());
        (repo, clock, scheduler)
    }

    #[tokio::test]
    async fn test_schedule_is_keyed() {
        let (repo, _clock, scheduler) = setup();
        let record = pending_record("acme", "o-1", t0());
        repo.create_record(&record, 10, &[]).await.unwrap();
        let due = record.auto_publish_at.unwrap();

        assert!(scheduler.schedule(record.id, due).await.unwrap());
        assert!(!scheduler.schedule(record.id, due).await.unwrap());
        assert_eq!(repo.list_jobs(Some(JobState::Queued), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_revives_buried_creation_job() {
        let (repo, clock, scheduler) = setup();
        let record = pending_record("acme", "o-1", t0());
        let due = record.auto_publish_at.unwrap();
        repo.create_record(&record, 10, &[NewJob::auto_publish(record.id, due)])
            .await
            .unwrap();

        // Creation already armed this deadline.
        assert!(!scheduler.schedule(record.id, due).await.unwrap());

        let claimed = repo
            .claim_due_jobs(due, 10, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        repo.bury_job(claimed[0].id, "worker gave up").await.unwrap();

        clock.set(due + Duration::hours(1));
        assert!(scheduler.schedule(record.id, due).await.unwrap());
        let queued = repo.list_jobs(Some(JobState::Queued), 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, claimed[0].id);
        assert_eq!(queued[0].attempts, 0);
        assert_eq!(queued[0].last_error, None);
    }

    #[tokio::test]
    async fn test_schedule_rejects_missing_and_resolved() {
        let (repo, _clock, scheduler) = setup();
        let missing = RecordId::new();
        assert_eq!(
            scheduler.schedule(missing, t0()).await,
            Err(ScheduleError::NotFound(missing))
        );

        let record = positive_record("acme", "o-1", t0());
        repo.create_record(&record, 10, &[]).await.unwrap();
        assert_eq!(
            scheduler.schedule(record.id, t0()).await,
            Err(ScheduleError::NotPending {
                record_id: record.id,
                status: FeedbackStatus::Published,
            })
        );
    }

    #[tokio::test]
    async fn test_execute_waits_for_deadline() {
        let (repo, clock, scheduler) = setup();
        let record = pending_record("acme", "o-1", t0());
        repo.create_record(&record, 10, &[]).await.unwrap();
        let due = record.auto_publish_at.unwrap();

        clock.set(due - Duration::seconds(1));
        assert_eq!(
            scheduler.execute(record.id).await.unwrap(),
            ExecuteOutcome::Skipped(SkipReason::NotDue { due_at: due })
        );

        clock.set(due);
        let ExecuteOutcome::Fired(fired) = scheduler.execute(record.id).await.unwrap() else {
            panic!("expected the record to fire at its deadline");
        };
        assert_eq!(fired.status, FeedbackStatus::AutoPublished);
        assert_eq!(fired.auto_publish_at, None);
        assert_eq!(fired.published_at, Some(due));
    }

    #[tokio::test]
    async fn test_execute_twice_is_noop() {
        let (repo, clock, scheduler) = setup();
        let record = pending_record("acme", "o-1", t0());
        repo.create_record(&record, 10, &[]).await.unwrap();
        clock.advance(Duration::days(8));

        assert!(matches!(
            scheduler.execute(record.id).await.unwrap(),
            ExecuteOutcome::Fired(_)
        ));
        let after_first = repo.get_record(record.id).await.unwrap().unwrap();

        assert_eq!(
            scheduler.execute(record.id).await.unwrap(),
            ExecuteOutcome::Skipped(SkipReason::NotPending(FeedbackStatus::AutoPublished))
        );
        assert_eq!(
            repo.get_record(record.id).await.unwrap().unwrap(),
            after_first
        );
    }

    #[tokio::test]
    async fn test_execute_missing_record() {
        let (_repo, _clock, scheduler) = setup();
        assert_eq!(
            scheduler.execute(RecordId::new()).await.unwrap(),
            ExecuteOutcome::Skipped(SkipReason::NotFound)
        );
    }

    #[test]
    fn test_skip_reason() {
        let record = pending_record("acme", "o-1", t0());
        let due = record.auto_publish_at.unwrap();
        assert_eq!(skip_reason(&record, due), None);
        assert_eq!(
            skip_reason(&record, t0()),
            Some(SkipReason::NotDue { due_at: due })
        );

        let mut no_deadline = record.clone();
        no_deadline.auto_publish_at = None;
        assert_eq!(skip_reason(&no_deadline, due), Some(SkipReason::NoDeadline));

        let published = positive_record("acme", "o-2", t0());
        assert_eq!(
            skip_reason(&published, due),
            Some(SkipReason::NotPending(FeedbackStatus::Published))
        );
    }
}
