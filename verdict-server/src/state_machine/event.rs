//! Events that trigger state transitions.
//!
//! Each event carries the instant it happened at, so the transition function
//! never reads a clock.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All events that can trigger state transitions on an existing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The business responded to the feedback.
    StoreResponded { response: String, at: DateTime<Utc> },

    /// The auto-publish job (or the sweep) found the deadline reached.
    AutoPublishDue { at: DateTime<Utc> },

    /// An administrator acted on the record.
    Moderated {
        action: ModerationAction,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::StoreResponded { at, .. }
            | Self::AutoPublishDue { at }
            | Self::Moderated { at, .. } => *at,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StoreResponded { .. } => "store_responded",
            Self::AutoPublishDue { .. } => "auto_publish_due",
            Self::Moderated { .. } => "moderated",
        }
    }
}

/// Administrative moderation actions. Never scheduler-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Hide,
    Dispute,
    Archive,
}

impl fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hide => "hide",
            Self::Dispute => "dispute",
            Self::Archive => "archive",
        })
    }
}
