//! Record store: drives events through the transition function.
//!
//! Every mutation of an existing record goes through [`RecordStore::apply`],
//! which reads the record, computes the transition, and commits it with a
//! compare-and-set on (status, revision). A stale CAS re-reads and re-applies
//! the same event, so the loser of a race sees the winner's result and its
//! event becomes a no-op.

use std::sync::Arc;

use tracing::debug;
use verdict_core::{FeedbackRecord, RecordId};

use super::event::Event;
use super::interpreter::{jobs_for, log_effects};
use super::repository::{CasOutcome, FeedbackRepository, RepositoryError};
use super::transition::transition;

/// Upper bound on CAS retries for one event.
pub const MAX_CAS_ATTEMPTS: u32 = 5;

/// Result of applying an event to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The transition changed the record and was committed.
    Changed(FeedbackRecord),
    /// The event did not apply to the record's current state.
    Unchanged(FeedbackRecord),
    NotFound,
}

#[derive(Clone)]
pub struct RecordStore {
    repo: Arc<dyn FeedbackRepository>,
}

impl RecordStore {
    pub fn new(repo: Arc<dyn FeedbackRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn FeedbackRepository> {
        &self.repo
    }

    pub async fn get(&self, id: RecordId) -> Result<Option<FeedbackRecord>, RepositoryError> {
        self.repo.get_record(id).await
    }

    /// Apply an event to a record, retrying on stale CAS.
    pub async fn apply(&self, id: RecordId, event: Event) -> Result<Applied, RepositoryError> {
        let mut current = match self.repo.get_record(id).await? {
            Some(record) => record,
            None => return Ok(Applied::NotFound),
        };

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let result = transition(current.clone(), event.clone());
            if result.record == current {
                return Ok(Applied::Unchanged(current));
            }

            let jobs = jobs_for(&result.record, &result.effects, event.at());
            match self
                .repo
                .compare_and_set(&current, &result.record, &jobs)
                .await?
            {
                CasOutcome::Applied => {
                    log_effects(&result.effects);
                    return Ok(Applied::Changed(result.record));
                }
                CasOutcome::Stale(latest) => {
                    debug!(
                        "Stale write on feedback {} ({} attempt {}), re-applying",
                        id,
                        event.name(),
                        attempt
                    );
                    current = latest;
                }
                CasOutcome::NotFound => return Ok(Applied::NotFound),
            }
        }

        Err(RepositoryError::Contention {
            record_id: id.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::repository::test_support::*;
    use crate::state_machine::ModerationAction;
    use crate::InMemoryRepository;
    use chrono::Duration;
    use verdict_core::FeedbackStatus;

    async fn store_with_pending() -> (RecordStore, FeedbackRecord) {
        let repo = Arc::new(InMemoryRepository::new());
        let record = pending_record("acme", "o-1", t0());
        repo.create_record(&record, 10, &[]).await.unwrap();
        (RecordStore::new(repo), record)
    }

    #[tokio::test]
    async fn test_apply_commits_and_enqueues_notifications() {
        let (store, record) = store_with_pending().await;
        let at = t0() + Duration::days(7);

        let applied = store
            .apply(record.id, Event::AutoPublishDue { at })
            .await
            .unwrap();
        let Applied::Changed(next) = applied else {
            panic!("expected a committed change, got {:?}", applied);
        };
        assert_eq!(next.status, FeedbackStatus::AutoPublished);
        assert_eq!(next.revision, record.revision + 1);
        assert_eq!(store.get(record.id).await.unwrap(), Some(next));

        let counts = store.repository().job_counts().await.unwrap();
        assert_eq!(counts.queued, 2);
    }

    #[tokio::test]
    async fn test_apply_twice_is_unchanged() {
        let (store, record) = store_with_pending().await;
        let at = t0() + Duration::days(7);

        store
            .apply(record.id, Event::AutoPublishDue { at })
            .await
            .unwrap();
        let again = store
            .apply(record.id, Event::AutoPublishDue { at })
            .await
            .unwrap();
        assert!(matches!(again, Applied::Unchanged(r) if r.status == FeedbackStatus::AutoPublished));
        assert_eq!(store.repository().job_counts().await.unwrap().queued, 2);
    }

    #[tokio::test]
    async fn test_apply_before_deadline_is_unchanged() {
        let (store, record) = store_with_pending().await;
        let applied = store
            .apply(
                record.id,
                Event::AutoPublishDue {
                    at: t0() + Duration::days(6),
                },
            )
            .await
            .unwrap();
        assert_eq!(applied, Applied::Unchanged(record));
    }

    #[tokio::test]
    async fn test_apply_missing_record() {
        let store = RecordStore::new(Arc::new(InMemoryRepository::new()));
        let applied = store
            .apply(RecordId::new(), Event::AutoPublishDue { at: t0() })
            .await
            .unwrap();
        assert_eq!(applied, Applied::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_response_and_hide_end_hidden() {
        let (store, record) = store_with_pending().await;
        let deadline = t0() + Duration::days(7);

        let respond = store.apply(
            record.id,
            Event::StoreResponded {
                response: "We have refunded the order.".to_string(),
                at: deadline,
            },
        );
        let hide = store.apply(
            record.id,
            Event::Moderated {
                action: ModerationAction::Hide,
                at: deadline,
            },
        );
        let (respond, hide) = tokio::join!(respond, hide);
        respond.unwrap();
        hide.unwrap();

        let stored = store.get(record.id).await.unwrap().unwrap();
        // Hide applies from either pending or published, so it always wins.
        assert_eq!(stored.status, FeedbackStatus::Hidden);
        assert!(stored.revision > record.revision);
    }
}
