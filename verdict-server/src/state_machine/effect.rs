//! Effects (side effects as data).
//!
//! Effects describe what should happen as a result of a state transition.
//! The interpreter turns them into queued jobs that commit together with the
//! record, so nothing is sent for a transition that lost its CAS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notify::{Audience, Template};

/// All effects that can be produced by state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    // =========================================================================
    // Notification Effects
    // =========================================================================
    /// Notify one party of the record.
    Notify {
        audience: Audience,
        template: Template,
    },

    // =========================================================================
    // Scheduling Effects
    // =========================================================================
    /// Arm the auto-publish job for the record's deadline.
    ArmAutoPublish { fire_at: DateTime<Utc> },

    /// Arm a reminder to the business.
    ArmReminder {
        fire_at: DateTime<Utc>,
        days_remaining: u32,
    },

    // =========================================================================
    // Logging Effects
    // =========================================================================
    /// Log a message once the transition has been committed.
    Log { level: LogLevel, message: String },
}

impl Effect {
    pub fn notify(audience: Audience, template: Template) -> Self {
        Self::Notify { audience, template }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Warn,
            message: message.into(),
        }
    }
}

/// Log level for logging effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}
