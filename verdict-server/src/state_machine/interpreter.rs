//! Effect interpreter.
//!
//! The interpreter is the boundary between the pure state machine and the
//! durable job queue. Scheduling and notification effects become `NewJob`s
//! that the repository commits atomically with the record; log effects are
//! emitted only after that commit succeeded.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use verdict_core::FeedbackRecord;

use super::effect::{Effect, LogLevel};
use crate::jobs::NewJob;

/// Turn a transition's effects into the jobs to enqueue alongside `record`.
///
/// Notifications run as soon as possible (`now`); armed jobs run at their
/// own fire time.
pub fn jobs_for(record: &FeedbackRecord, effects: &[Effect], now: DateTime<Utc>) -> Vec<NewJob> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            Effect::Notify { audience, template } => {
                Some(NewJob::notify(record.id, *audience, *template, now))
            }
            Effect::ArmAutoPublish { fire_at } => Some(NewJob::auto_publish(record.id, *fire_at)),
            Effect::ArmReminder {
                fire_at,
                days_remaining,
            } => Some(NewJob::reminder(record.id, *fire_at, *days_remaining)),
            Effect::Log { .. } => None,
        })
        .collect()
}

/// Emit the log effects of a committed transition.
pub fn log_effects(effects: &[Effect]) {
    for effect in effects {
        if let Effect::Log { level, message } = effect {
            match level {
                LogLevel::Debug => debug!("{}", message),
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            }
        }
    }
}
