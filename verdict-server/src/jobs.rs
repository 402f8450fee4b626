//! Durable job queue entries.
//!
//! Jobs are enqueued in the same transaction as the state change that armed
//! them, keyed by a dedupe key so that re-arming the same thing is a no-op.
//! Delivery is at-least-once; every job handler re-checks its preconditions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use verdict_core::{ParseEnumError, RecordId, RequestToken};

use crate::notify::{Audience, Template};

/// What a job does when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Fire the auto-publish transition if the record is still pending.
    AutoPublish { record_id: RecordId },
    /// Remind the business of a pending record.
    Reminder {
        record_id: RecordId,
        days_remaining: u32,
    },
    /// Send a notification about a record.
    Notify {
        record_id: RecordId,
        audience: Audience,
        template: Template,
    },
    /// Send the invitation for a feedback request.
    Invite { token: RequestToken },
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AutoPublish { .. } => "auto_publish",
            Self::Reminder { .. } => "reminder",
            Self::Notify { .. } => "notify",
            Self::Invite { .. } => "invite",
        }
    }

    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            Self::AutoPublish { record_id }
            | Self::Reminder { record_id, .. }
            | Self::Notify { record_id, .. } => Some(*record_id),
            Self::Invite { .. } => None,
        }
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub dedupe_key: String,
    pub kind: JobKind,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    pub fn auto_publish(record_id: RecordId, fire_at: DateTime<Utc>) -> Self {
        Self {
            dedupe_key: format!("auto_publish:{}:{}", record_id, fire_at.timestamp_millis()),
            kind: JobKind::AutoPublish { record_id },
            run_at: fire_at,
        }
    }

    pub fn reminder(record_id: RecordId, fire_at: DateTime<Utc>, days_remaining: u32) -> Self {
        Self {
            dedupe_key: format!("reminder:{}:{}", record_id, days_remaining),
            kind: JobKind::Reminder {
                record_id,
                days_remaining,
            },
            run_at: fire_at,
        }
    }

    pub fn notify(
        record_id: RecordId,
        audience: Audience,
        template: Template,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dedupe_key: format!("notify:{}:{}", record_id, template),
            kind: JobKind::Notify {
                record_id,
                audience,
                template,
            },
            run_at,
        }
    }

    pub fn invite(token: RequestToken, run_at: DateTime<Utc>) -> Self {
        Self {
            dedupe_key: format!("invite:{}", token),
            kind: JobKind::Invite { token },
            run_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    /// Claimed by a worker; `lease_until` bounds how long.
    Running,
    Done,
    /// Gave up after exhausting attempts.
    Buried,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Buried => "buried",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "buried" => Ok(Self::Buried),
            other => Err(ParseEnumError {
                kind: "job state",
                value: other.to_string(),
            }),
        }
    }
}

/// A stored job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub dedupe_key: String,
    pub kind: JobKind,
    pub state: JobState,
    pub run_at: DateTime<Utc>,
    /// Number of failed runs so far.
    pub attempts: u32,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: u64,
    pub running: u64,
    pub done: u64,
    pub buried: u64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Queued => self.queued += n,
            JobState::Running => self.running += n,
            JobState::Done => self.done += n,
            JobState::Buried => self.buried += n,
        }
    }
}
