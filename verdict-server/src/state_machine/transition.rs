//! Pure state transition function.
//!
//! The transition function is the core of the moderation state machine. It
//! takes the current record and an event, and returns the new record and a
//! list of effects. This function has NO side effects - it is pure and
//! deterministic. Storage only commits what it returns.

use verdict_core::{FeedbackRecord, FeedbackStatus, ReminderSlot};

use super::effect::Effect;
use super::event::{Event, ModerationAction};
use crate::notify::{Audience, Template};

/// Result of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    /// The record after the transition.
    pub record: FeedbackRecord,
    /// Effects to execute once the record is committed.
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(record: FeedbackRecord, effects: Vec<Effect>) -> Self {
        Self { record, effects }
    }

    pub fn no_change(record: FeedbackRecord) -> Self {
        Self {
            record,
            effects: vec![],
        }
    }
}

/// Effects for a freshly created record.
///
/// Positive feedback is already published; the customer is thanked. Negative
/// feedback arms the auto-publish deadline and the reminders, and alerts the
/// business.
pub fn on_created(record: &FeedbackRecord, reminders: &[ReminderSlot]) -> Vec<Effect> {
    let mut effects = vec![Effect::notify(Audience::Customer, Template::CustomerThankYou)];

    match (record.status, record.auto_publish_at) {
        (FeedbackStatus::PendingModeration, Some(fire_at)) => {
            effects.push(Effect::ArmAutoPublish { fire_at });
            effects.extend(reminders.iter().map(|slot| Effect::ArmReminder {
                fire_at: slot.fire_at,
                days_remaining: slot.days_remaining,
            }));
            effects.push(Effect::notify(
                Audience::Business,
                Template::BusinessNegativeFeedback,
            ));
            effects.push(Effect::info(format!(
                "Feedback {} for {} pending moderation until {}",
                record.id, record.business_id, fire_at
            )));
        }
        _ => {
            effects.push(Effect::info(format!(
                "Feedback {} for {} published with rating {}",
                record.id, record.business_id, record.overall_rating
            )));
        }
    }

    effects
}

/// Pure state transition function.
///
/// Given the current record and an event, returns the new record and effects
/// to execute. Events that do not apply to the current status leave the
/// record untouched and produce no effects, which is what makes duplicate
/// and concurrent triggers harmless.
pub fn transition(record: FeedbackRecord, event: Event) -> TransitionResult {
    match (record.status, event) {
        // =====================================================================
        // Store responses
        // =====================================================================

        // Response within the grace period -> published
        (FeedbackStatus::PendingModeration, Event::StoreResponded { response, at })
            if record.auto_publish_at.map_or(true, |deadline| at <= deadline) =>
        {
            let id = record.id;
            let mut next = record;
            next.status = FeedbackStatus::Published;
            next.store_response = Some(response);
            next.responded_at = Some(at);
            next.published_at = Some(at);
            next.auto_publish_at = None;
            bump(&mut next, at);
            TransitionResult::new(
                next,
                vec![
                    Effect::notify(Audience::Customer, Template::CustomerFeedbackPublished),
                    Effect::info(format!("Feedback {} published after store response", id)),
                ],
            )
        }

        // Response after the deadline but before the job ran. The deadline
        // wins: the record auto-publishes with the response attached.
        (FeedbackStatus::PendingModeration, Event::StoreResponded { response, at }) => {
            let id = record.id;
            let mut next = record;
            next.status = FeedbackStatus::AutoPublished;
            next.store_response = Some(response);
            next.responded_at = Some(at);
            next.published_at = Some(at);
            next.auto_publish_at = None;
            bump(&mut next, at);
            TransitionResult::new(
                next,
                vec![
                    Effect::notify(Audience::Business, Template::BusinessAutoPublished),
                    Effect::notify(Audience::Customer, Template::CustomerFeedbackPublished),
                    Effect::warn(format!(
                        "Feedback {} responded to after its deadline; auto-published",
                        id
                    )),
                ],
            )
        }

        // Late response after auto-publish committed -> recorded, status kept
        (FeedbackStatus::AutoPublished, Event::StoreResponded { response, at })
            if record.store_response.is_none() =>
        {
            let id = record.id;
            let mut next = record;
            next.store_response = Some(response);
            next.responded_at = Some(at);
            bump(&mut next, at);
            TransitionResult::new(
                next,
                vec![Effect::info(format!(
                    "Late response recorded on auto-published feedback {}",
                    id
                ))],
            )
        }

        // =====================================================================
        // Auto-publish
        // =====================================================================
        (FeedbackStatus::PendingModeration, Event::AutoPublishDue { at })
            if record.store_response.is_none()
                && record.auto_publish_at.is_some_and(|deadline| at >= deadline) =>
        {
            let id = record.id;
            let mut next = record;
            next.status = FeedbackStatus::AutoPublished;
            next.published_at = Some(at);
            next.auto_publish_at = None;
            bump(&mut next, at);
            TransitionResult::new(
                next,
                vec![
                    Effect::notify(Audience::Business, Template::BusinessAutoPublished),
                    Effect::notify(Audience::Customer, Template::CustomerFeedbackPublished),
                    Effect::info(format!("Feedback {} auto-published", id)),
                ],
            )
        }

        // =====================================================================
        // Administrative moderation
        // =====================================================================
        (
            FeedbackStatus::PendingModeration
            | FeedbackStatus::Published
            | FeedbackStatus::AutoPublished,
            Event::Moderated {
                action: action @ (ModerationAction::Hide | ModerationAction::Dispute),
                at,
            },
        ) => {
            let target = if action == ModerationAction::Hide {
                FeedbackStatus::Hidden
            } else {
                FeedbackStatus::Disputed
            };
            moderate(record, target, action, at)
        }

        (
            status,
            Event::Moderated {
                action: ModerationAction::Archive,
                at,
            },
        ) if status != FeedbackStatus::Archived => {
            moderate(record, FeedbackStatus::Archived, ModerationAction::Archive, at)
        }

        // Everything else is a no-op
        (_, _) => TransitionResult::no_change(record),
    }
}

fn moderate(
    record: FeedbackRecord,
    target: FeedbackStatus,
    action: ModerationAction,
    at: chrono::DateTime<chrono::Utc>,
) -> TransitionResult {
    let message = format!(
        "Feedback {} moderated ({}): {} -> {}",
        record.id, action, record.status, target
    );
    let mut next = record;
    next.status = target;
    next.auto_publish_at = None;
    bump(&mut next, at);
    TransitionResult::new(next, vec![Effect::info(message)])
}

fn bump(record: &mut FeedbackRecord, at: chrono::DateTime<chrono::Utc>) {
    record.revision += 1;
    record.updated_at = at;
}
