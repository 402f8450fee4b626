//! `FeedbackService`: the engine's public operations.
//!
//! The service validates input, asks the pure parts (rating calculator,
//! transition function) what should happen, and hands the result to the
//! repository as one atomic operation. It never decides business state on
//! its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use verdict_core::{
    compute_rating, BusinessId, BusinessStats, FeedbackRecord, FeedbackRequest, ModerationPolicy,
    OrderId, Origin, Plan, RecordId, RedeemRejection, RequestStatus, RequestToken,
    ValidationError, Verdict,
};

use crate::clock::Clock;
use crate::error::{IssueError, ModerateError, RespondError, SubmitError};
use crate::jobs::NewJob;
use crate::state_machine::interpreter::{jobs_for, log_effects};
use crate::state_machine::repository::{
    CreateRecordOutcome, FeedbackRepository, InsertRequestOutcome, PlanSource, RedeemOutcome,
    RepositoryError,
};
use crate::state_machine::{on_created, Applied, Effect, Event, ModerationAction, RecordStore};

/// A validated record plus what committing it must do.
struct Prepared {
    record: FeedbackRecord,
    effects: Vec<Effect>,
    jobs: Vec<NewJob>,
}

#[derive(Clone)]
pub struct FeedbackService {
    repo: Arc<dyn FeedbackRepository>,
    plans: Arc<dyn PlanSource>,
    store: RecordStore,
    clock: Arc<dyn Clock>,
    policy: ModerationPolicy,
    default_review_limit: u32,
}

impl FeedbackService {
    pub fn new(
        repo: Arc<dyn FeedbackRepository>,
        plans: Arc<dyn PlanSource>,
        clock: Arc<dyn Clock>,
        policy: ModerationPolicy,
    ) -> Self {
        Self {
            store: RecordStore::new(repo.clone()),
            repo,
            plans,
            clock,
            policy,
            default_review_limit: Plan::FALLBACK_REVIEW_LIMIT,
        }
    }

    /// Review limit for businesses without a plan.
    pub fn with_default_review_limit(mut self, limit: u32) -> Self {
        self.default_review_limit = limit;
        self
    }

    pub fn policy(&self) -> &ModerationPolicy {
        &self.policy
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // =========================================================================
    // Request registry
    // =========================================================================

    /// Issue an invitation token and queue the invitation.
    pub async fn issue_request(
        &self,
        business_id: BusinessId,
        order_id: OrderId,
        customer_contact: impl Into<String>,
    ) -> Result<FeedbackRequest, IssueError> {
        let now = self.clock.now();
        let request = FeedbackRequest::new(
            business_id,
            order_id,
            customer_contact,
            now,
            self.policy.request_ttl,
        );
        let invite = NewJob::invite(request.token.clone(), now);

        match self.repo.insert_request(&request, &[invite]).await? {
            InsertRequestOutcome::Inserted => {
                info!(
                    "Issued feedback request {} for order {} of {}",
                    request.token.short(),
                    request.order_id,
                    request.business_id
                );
                Ok(request)
            }
            InsertRequestOutcome::Duplicate => Err(IssueError::DuplicateRequest),
        }
    }

    /// Mark a pending request invalid, e.g. after the contact bounced.
    pub async fn invalidate_request(&self, token: &RequestToken) -> Result<bool, RepositoryError> {
        let changed = self.repo.mark_request_invalid(token).await?;
        if changed {
            info!("Feedback request {} marked invalid", token.short());
        }
        Ok(changed)
    }

    /// Mark every pending request past its deadline as expired.
    pub async fn expire_requests(&self) -> Result<usize, RepositoryError> {
        self.repo.expire_stale_requests(self.clock.now()).await
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Redeem an invitation token with the customer's verdict.
    ///
    /// Token checks come first, then validation, then the quota. Nothing is
    /// persisted unless the whole redemption commits.
    pub async fn submit_feedback(
        &self,
        token: &RequestToken,
        verdict: Verdict,
    ) -> Result<FeedbackRecord, SubmitError> {
        let now = self.clock.now();

        let request = self
            .repo
            .get_request(token)
            .await?
            .ok_or(SubmitError::InvalidToken)?;

        if let Err(rejection) = request.check_redeemable(now) {
            if rejection == RedeemRejection::Expired && request.status == RequestStatus::Pending {
                self.repo.expire_request(token, now).await?;
            }
            return Err(rejection_error(rejection));
        }

        let origin = Origin::InvitationSubmission {
            token: token.clone(),
            order_id: request.order_id.clone(),
        };
        let prepared = self.prepare(
            request.business_id.clone(),
            request.customer_contact.clone(),
            origin,
            verdict,
            now,
        )?;
        let limit = self.review_limit(&request.business_id).await?;

        match self
            .repo
            .redeem_request(token, &prepared.record, now, limit, &prepared.jobs)
            .await?
        {
            RedeemOutcome::Redeemed => {
                log_effects(&prepared.effects);
                Ok(prepared.record)
            }
            RedeemOutcome::UnknownToken => Err(SubmitError::InvalidToken),
            RedeemOutcome::Rejected(rejection) => Err(rejection_error(rejection)),
            RedeemOutcome::QuotaExceeded { limit } => {
                warn!(
                    "Feedback for {} rejected: review limit {} reached",
                    request.business_id, limit
                );
                Err(SubmitError::QuotaExceeded { limit })
            }
        }
    }

    /// Submit feedback directly against an order, without an invitation.
    /// One record per (business, order).
    pub async fn submit_order_feedback(
        &self,
        business_id: BusinessId,
        order_id: OrderId,
        customer_contact: impl Into<String>,
        verdict: Verdict,
    ) -> Result<FeedbackRecord, SubmitError> {
        let now = self.clock.now();
        let prepared = self.prepare(
            business_id.clone(),
            customer_contact.into(),
            Origin::OrderSubmission { order_id },
            verdict,
            now,
        )?;
        let limit = self.review_limit(&business_id).await?;

        match self
            .repo
            .create_record(&prepared.record, limit, &prepared.jobs)
            .await?
        {
            CreateRecordOutcome::Created => {
                log_effects(&prepared.effects);
                Ok(prepared.record)
            }
            CreateRecordOutcome::DuplicateOrder => Err(SubmitError::DuplicateOrder),
            CreateRecordOutcome::QuotaExceeded { limit } => {
                warn!(
                    "Feedback for {} rejected: review limit {} reached",
                    business_id, limit
                );
                Err(SubmitError::QuotaExceeded { limit })
            }
        }
    }

    fn prepare(
        &self,
        business_id: BusinessId,
        customer_contact: String,
        origin: Origin,
        verdict: Verdict,
        now: DateTime<Utc>,
    ) -> Result<Prepared, ValidationError> {
        let outcome = compute_rating(&verdict, now, &self.policy)?;
        let record =
            FeedbackRecord::from_submission(business_id, customer_contact, origin, verdict, outcome, now);

        let reminders = if record.is_pending() {
            self.policy.reminder_schedule(record.created_at, now)
        } else {
            Vec::new()
        };
        let effects = on_created(&record, &reminders);
        let jobs = jobs_for(&record, &effects, now);

        Ok(Prepared {
            record,
            effects,
            jobs,
        })
    }

    /// The business's plan limit, or the default when it has no plan.
    pub async fn review_limit(&self, business_id: &BusinessId) -> Result<u32, RepositoryError> {
        Ok(self
            .plans
            .plan_for(business_id)
            .await?
            .map_or(self.default_review_limit, |plan| plan.review_limit))
    }

    pub async fn set_plan(&self, business_id: &BusinessId, plan: Plan) -> Result<(), RepositoryError> {
        self.repo.put_plan(business_id, plan).await
    }

    // =========================================================================
    // Moderation
    // =========================================================================

    /// Record the business's response to a feedback record.
    ///
    /// Within the grace period this publishes the record; after an
    /// auto-publish it only attaches the response.
    pub async fn respond_to_feedback(
        &self,
        record_id: RecordId,
        text: &str,
    ) -> Result<FeedbackRecord, RespondError> {
        let record = self
            .store
            .get(record_id)
            .await?
            .ok_or(RespondError::NotFound(record_id))?;
        if !record.accepts_response() {
            return Err(RespondError::NotPending {
                record_id,
                status: record.status,
            });
        }

        let response = text.trim();
        if response.chars().count() < self.policy.min_response_chars {
            return Err(RespondError::ResponseTooShort {
                min: self.policy.min_response_chars,
            });
        }

        let event = Event::StoreResponded {
            response: response.to_string(),
            at: self.clock.now(),
        };
        match self.store.apply(record_id, event).await? {
            Applied::Changed(record) => Ok(record),
            Applied::Unchanged(record) => Err(RespondError::NotPending {
                record_id,
                status: record.status,
            }),
            Applied::NotFound => Err(RespondError::NotFound(record_id)),
        }
    }

    /// Apply an administrative moderation action.
    pub async fn moderate(
        &self,
        record_id: RecordId,
        action: ModerationAction,
    ) -> Result<FeedbackRecord, ModerateError> {
        let event = Event::Moderated {
            action,
            at: self.clock.now(),
        };
        match self.store.apply(record_id, event).await? {
            Applied::Changed(record) => Ok(record),
            Applied::Unchanged(record) => Err(ModerateError::NotApplicable {
                record_id,
                status: record.status,
                action,
            }),
            Applied::NotFound => Err(ModerateError::NotFound(record_id)),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_record(&self, record_id: RecordId) -> Result<Option<FeedbackRecord>, RepositoryError> {
        self.store.get(record_id).await
    }

    pub async fn business_stats(&self, business_id: &BusinessId) -> Result<BusinessStats, RepositoryError> {
        let records = self.repo.list_business_records(business_id).await?;
        Ok(BusinessStats::from_records(&records))
    }
}

fn rejection_error(rejection: RedeemRejection) -> SubmitError {
    match rejection {
        RedeemRejection::Invalid => SubmitError::InvalidToken,
        RedeemRejection::Expired => SubmitError::Expired,
        RedeemRejection::AlreadyResponded => SubmitError::AlreadyResponded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::{JobKind, JobState};
    use crate::state_machine::repository::test_support::t0;
    use crate::state_machine::repository::InMemoryRepository;
    use chrono::Duration;
    use verdict_core::{FeedbackStatus, PlanTier, SubRatings};

    const NEGATIVE: &str = "The parcel arrived crushed and support never replied to me.";

    fn service() -> (Arc<InMemoryRepository>, Arc<ManualClock>, FeedbackService) {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let service = FeedbackService::new(
            repo.clone(),
            repo.clone(),
            clock.clone(),
            ModerationPolicy::default(),
        );
        (repo, clock, service)
    }

    #[tokio::test]
    async fn test_issue_request_queues_invitation() {
        let (repo, _clock, service) = service();
        let request = service
            .issue_request(BusinessId::from("acme"), OrderId::from("o-1"), "c@example.com")
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.expires_at, t0() + Duration::days(7));

        let jobs = repo.list_jobs(Some(JobState::Queued), 10).await.unwrap();
        assert_eq!(
            jobs[0].kind,
            JobKind::Invite {
                token: request.token.clone()
            }
        );

        let again = service
            .issue_request(BusinessId::from("acme"), OrderId::from("o-1"), "c@example.com")
            .await;
        assert_eq!(again, Err(IssueError::DuplicateRequest));
    }

    #[tokio::test]
    async fn test_invalidated_token_is_invalid() {
        let (_repo, _clock, service) = service();
        let request = service
            .issue_request(BusinessId::from("acme"), OrderId::from("o-1"), "c@example.com")
            .await
            .unwrap();
        assert!(service.invalidate_request(&request.token).await.unwrap());

        let result = service
            .submit_feedback(&request.token, Verdict::positive())
            .await;
        assert_eq!(result, Err(SubmitError::InvalidToken));
    }

    #[tokio::test]
    async fn test_unknown_token_is_invalid() {
        let (_repo, _clock, service) = service();
        let result = service
            .submit_feedback(&RequestToken::generate(), Verdict::positive())
            .await;
        assert_eq!(result, Err(SubmitError::InvalidToken));
    }

    #[tokio::test]
    async fn test_token_checked_before_validation() {
        let (_repo, _clock, service) = service();
        let request = service
            .issue_request(BusinessId::from("acme"), OrderId::from("o-1"), "c@example.com")
            .await
            .unwrap();
        service
            .submit_feedback(&request.token, Verdict::positive())
            .await
            .unwrap();

        let result = service
            .submit_feedback(&request.token, Verdict::negative("too short"))
            .await;
        assert_eq!(result, Err(SubmitError::AlreadyResponded));
    }

    #[tokio::test]
    async fn test_order_feedback_one_per_order() {
        let (_repo, _clock, service) = service();
        let record = service
            .submit_order_feedback(
                BusinessId::from("acme"),
                OrderId::from("o-1"),
                "c@example.com",
                Verdict::positive().with_ratings(SubRatings {
                    logistics: Some(4),
                    communication: Some(5),
                    website_usability: None,
                }),
            )
            .await
            .unwrap();
        assert_eq!(record.status, FeedbackStatus::Published);
        assert_eq!(record.overall_rating.get(), 5);

        let again = service
            .submit_order_feedback(
                BusinessId::from("acme"),
                OrderId::from("o-1"),
                "other@example.com",
                Verdict::positive(),
            )
            .await;
        assert_eq!(again, Err(SubmitError::DuplicateOrder));
    }

    #[tokio::test]
    async fn test_plan_limit_applies() {
        let (_repo, _clock, service) = service();
        let business = BusinessId::from("acme");
        service
            .set_plan(
                &business,
                Plan {
                    tier: PlanTier::Basic,
                    review_limit: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(service.review_limit(&business).await.unwrap(), 1);
        assert_eq!(
            service
                .review_limit(&BusinessId::from("globex"))
                .await
                .unwrap(),
            Plan::FALLBACK_REVIEW_LIMIT
        );

        service
            .submit_order_feedback(business.clone(), OrderId::from("o-1"), "c", Verdict::positive())
            .await
            .unwrap();
        let second = service
            .submit_order_feedback(business, OrderId::from("o-2"), "c", Verdict::positive())
            .await;
        assert_eq!(second, Err(SubmitError::QuotaExceeded { limit: 1 }));
    }

    #[tokio::test]
    async fn test_respond_validation() {
        let (_repo, _clock, service) = service();
        let missing = RecordId::new();
        assert_eq!(
            service.respond_to_feedback(missing, "Thanks for the feedback").await,
            Err(RespondError::NotFound(missing))
        );

        let positive = service
            .submit_order_feedback(
                BusinessId::from("acme"),
                OrderId::from("o-1"),
                "c",
                Verdict::positive(),
            )
            .await
            .unwrap();
        assert_eq!(
            service
                .respond_to_feedback(positive.id, "Thanks for the feedback")
                .await,
            Err(RespondError::NotPending {
                record_id: positive.id,
                status: FeedbackStatus::Published,
            })
        );

        let negative = service
            .submit_order_feedback(
                BusinessId::from("acme"),
                OrderId::from("o-2"),
                "c",
                Verdict::negative(NEGATIVE),
            )
            .await
            .unwrap();
        assert_eq!(
            service.respond_to_feedback(negative.id, "   sorry    ").await,
            Err(RespondError::ResponseTooShort { min: 10 })
        );

        let responded = service
            .respond_to_feedback(negative.id, "  We have sent a replacement.  ")
            .await
            .unwrap();
        assert_eq!(responded.status, FeedbackStatus::Published);
        assert_eq!(
            responded.store_response.as_deref(),
            Some("We have sent a replacement.")
        );
    }

    #[tokio::test]
    async fn test_moderation_actions() {
        let (_repo, _clock, service) = service();
        let record = service
            .submit_order_feedback(
                BusinessId::from("acme"),
                OrderId::from("o-1"),
                "c",
                Verdict::negative(NEGATIVE),
            )
            .await
            .unwrap();

        let disputed = service
            .moderate(record.id, ModerationAction::Dispute)
            .await
            .unwrap();
        assert_eq!(disputed.status, FeedbackStatus::Disputed);

        assert_eq!(
            service.moderate(record.id, ModerationAction::Hide).await,
            Err(ModerateError::NotApplicable {
                record_id: record.id,
                status: FeedbackStatus::Disputed,
                action: ModerationAction::Hide,
            })
        );

        let archived = service
            .moderate(record.id, ModerationAction::Archive)
            .await
            .unwrap();
        assert_eq!(archived.status, FeedbackStatus::Archived);
    }

    #[tokio::test]
    async fn test_business_stats() {
        let (_repo, clock, service) = service();
        let business = BusinessId::from("acme");
        for (order, rating) in [("o-1", 5), ("o-2", 4)] {
            service
                .submit_order_feedback(
                    business.clone(),
                    OrderId::from(order),
                    "c",
                    Verdict::positive().with_ratings(SubRatings {
                        logistics: Some(rating),
                        communication: None,
                        website_usability: None,
                    }),
                )
                .await
                .unwrap();
        }
        service
            .submit_order_feedback(
                business.clone(),
                OrderId::from("o-3"),
                "c",
                Verdict::negative(NEGATIVE),
            )
            .await
            .unwrap();

        // The pending record does not count yet.
        let stats = service.business_stats(&business).await.unwrap();
        assert_eq!(stats.total_published, 2);
        assert_eq!(stats.average_rating, 4.5);
        assert_eq!(stats.recommendation_percentage, 100.0);

        clock.advance(Duration::days(1));
        assert_eq!(service.expire_requests().await.unwrap(), 0);
    }
}
