//! Reconciliation sweep for overdue pending feedback.
//!
//! The job queue normally fires every auto-publish on time. The sweep is the
//! safety net for everything else: a job that was buried, a job lost with a
//! restored backup, or a server that was down across a deadline. It lists
//! pending records whose deadline has passed and runs the same
//! `AutoPublishScheduler::execute` path the worker uses, so running it
//! alongside the worker (or twice) is harmless.
//!
//! The sweep runs once at startup before the server accepts requests, then
//! on an interval.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{error, info, warn};
use verdict_core::FeedbackRecord;

use crate::scheduler::{AutoPublishScheduler, ExecuteOutcome};
use crate::state_machine::repository::RepositoryError;

/// Records examined per sweep pass.
pub const SWEEP_BATCH_SIZE: usize = 500;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub fired: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Pending records whose deadline has passed, oldest deadline first.
pub async fn due_records(
    scheduler: &AutoPublishScheduler,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<FeedbackRecord>, RepositoryError> {
    scheduler
        .store()
        .repository()
        .list_due_pending(now, limit)
        .await
}

/// Auto-publish every overdue pending record.
///
/// A failure on one record is logged and counted; the sweep moves on to the
/// next record.
pub async fn reconcile_due_records(
    scheduler: &AutoPublishScheduler,
    limit: usize,
) -> Result<SweepReport, RepositoryError> {
    let now = scheduler.clock().now();
    let due = due_records(scheduler, now, limit).await?;

    let mut report = SweepReport {
        examined: due.len(),
        ..Default::default()
    };

    for record in due {
        match scheduler.execute(record.id).await {
            Ok(ExecuteOutcome::Fired(_)) => {
                info!(
                    "Sweep auto-published feedback {} (due {})",
                    record.id,
                    record
                        .auto_publish_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_default()
                );
                report.fired += 1;
            }
            Ok(ExecuteOutcome::Skipped(reason)) => {
                info!("Sweep skipped feedback {}: {:?}", record.id, reason);
                report.skipped += 1;
            }
            Err(e) => {
                error!("Sweep failed to auto-publish feedback {}: {}", record.id, e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Startup reconciliation: expire overdue invitations and fire every missed
/// deadline before accepting requests.
pub async fn reconcile_on_startup(scheduler: &AutoPublishScheduler) {
    info!("Starting reconciliation of overdue feedback...");

    let now = scheduler.clock().now();
    match scheduler
        .store()
        .repository()
        .expire_stale_requests(now)
        .await
    {
        Ok(0) => {}
        Ok(n) => info!("Expired {} stale feedback request(s)", n),
        Err(e) => warn!("Failed to expire stale feedback requests: {}", e),
    }

    match reconcile_due_records(scheduler, SWEEP_BATCH_SIZE).await {
        Ok(report) if report.examined == 0 => {
            info!("No overdue feedback found. Reconciliation complete.")
        }
        Ok(report) => info!(
            "Reconciliation complete: {} examined, {} auto-published, {} skipped, {} failed",
            report.examined, report.fired, report.skipped, report.failed
        ),
        Err(e) => error!("Reconciliation aborted: {}", e),
    }
}

/// Run the sweep forever on `period`.
pub async fn sweep_loop(scheduler: Arc<AutoPublishScheduler>, period: std::time::Duration) {
    let mut interval = interval(period);

    loop {
        interval.tick().await;

        let now = scheduler.clock().now();
        if let Err(e) = scheduler
            .store()
            .repository()
            .expire_stale_requests(now)
            .await
        {
            error!("Error expiring feedback requests: {}", e);
        }

        match reconcile_due_records(&scheduler, SWEEP_BATCH_SIZE).await {
            Ok(report) if report.examined > 0 => info!(
                "Sweep: {} examined, {} auto-published, {} skipped, {} failed",
                report.examined, report.fired, report.skipped, report.failed
            ),
            Ok(_) => {}
            Err(e) => error!("Error running reconciliation sweep: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::state_machine::repository::test_support::*;
    use crate::state_machine::repository::{FeedbackRepository, InMemoryRepository};
    use crate::state_machine::RecordStore;
    use chrono::Duration;
    use verdict_core::FeedbackStatus;

    fn setup() -> (Arc<InMemoryRepository>, Arc<ManualClock>, AutoPublishScheduler) {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let scheduler = AutoPublishScheduler::new(RecordStore::new(repo.clone()), clock.clone());
        (repo, clock, scheduler)
    }

    #[tokio::test]
    async fn test_sweep_fires_only_overdue_records() {
        let (repo, clock, scheduler) = setup();
        let old = pending_record("acme", "o-1", t0());
        let recent = pending_record("acme", "o-2", t0() + Duration::days(3));
        let positive = positive_record("acme", "o-3", t0());
        for record in [&old, &recent, &positive] {
            repo.create_record(record, 10, &[]).await.unwrap();
        }

        clock.advance(Duration::days(7));
        let report = reconcile_due_records(&scheduler, 100).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                examined: 1,
                fired: 1,
                skipped: 0,
                failed: 0
            }
        );
        assert_eq!(
            repo.get_record(old.id).await.unwrap().unwrap().status,
            FeedbackStatus::AutoPublished
        );
        assert_eq!(
            repo.get_record(recent.id).await.unwrap().unwrap().status,
            FeedbackStatus::PendingModeration
        );
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (repo, clock, scheduler) = setup();
        let record = pending_record("acme", "o-1", t0());
        repo.create_record(&record, 10, &[]).await.unwrap();
        clock.advance(Duration::days(8));

        reconcile_due_records(&scheduler, 100).await.unwrap();
        let after_first = repo.get_record(record.id).await.unwrap().unwrap();

        let second = reconcile_due_records(&scheduler, 100).await.unwrap();
        assert_eq!(second, SweepReport::default());
        assert_eq!(
            repo.get_record(record.id).await.unwrap().unwrap(),
            after_first
        );
    }

    #[tokio::test]
    async fn test_startup_expires_requests_and_fires() {
        let (repo, clock, scheduler) = setup();
        let req = request("acme", "o-1", t0());
        repo.insert_request(&req, &[]).await.unwrap();
        let record = pending_record("acme", "o-2", t0());
        repo.create_record(&record, 10, &[]).await.unwrap();

        clock.advance(Duration::days(10));
        reconcile_on_startup(&scheduler).await;

        assert_eq!(
            repo.get_request(&req.token).await.unwrap().unwrap().status,
            verdict_core::RequestStatus::Expired
        );
        assert_eq!(
            repo.get_record(record.id).await.unwrap().unwrap().status,
            FeedbackStatus::AutoPublished
        );
    }

    #[tokio::test]
    async fn test_due_records_lists_without_firing() {
        let (repo, _clock, scheduler) = setup();
        let record = pending_record("acme", "o-1", t0());
        repo.create_record(&record, 10, &[]).await.unwrap();

        let due = due_records(&scheduler, t0() + Duration::days(7), 10)
            .await
            .unwrap();
        assert_eq!(due, vec![record.clone()]);
        assert_eq!(
            repo.get_record(record.id).await.unwrap().unwrap().status,
            FeedbackStatus::PendingModeration
        );
    }
}
