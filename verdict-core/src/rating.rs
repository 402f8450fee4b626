//! Rating calculator.
//!
//! Derives the overall rating and the initial moderation status of a
//! submission. Pure: nothing here touches storage or the clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{FeedbackStatus, Rating};
use crate::policy::ModerationPolicy;

/// Overall rating used when a positive verdict carries no sub-ratings.
pub const DEFAULT_POSITIVE_RATING: u8 = 5;
/// Overall rating used when a negative verdict carries no sub-ratings.
pub const DEFAULT_NEGATIVE_RATING: u8 = 2;

/// Optional per-aspect ratings, each 1-5 when present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRatings {
    pub logistics: Option<u8>,
    pub communication: Option<u8>,
    pub website_usability: Option<u8>,
}

impl SubRatings {
    fn named(&self) -> [(&'static str, Option<u8>); 3] {
        [
            ("logistics", self.logistics),
            ("communication", self.communication),
            ("website_usability", self.website_usability),
        ]
    }
}

/// What the customer submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub would_recommend: bool,
    #[serde(default)]
    pub ratings: SubRatings,
    #[serde(default)]
    pub comment: String,
}

impl Verdict {
    pub fn positive() -> Self {
        Self {
            would_recommend: true,
            ratings: SubRatings::default(),
            comment: String::new(),
        }
    }

    pub fn negative(comment: impl Into<String>) -> Self {
        Self {
            would_recommend: false,
            ratings: SubRatings::default(),
            comment: comment.into(),
        }
    }

    pub fn with_ratings(mut self, ratings: SubRatings) -> Self {
        self.ratings = ratings;
        self
    }
}

/// Computed fields for a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatingOutcome {
    pub overall_rating: Rating,
    pub status: FeedbackStatus,
    /// Only set for negative verdicts.
    pub auto_publish_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} rating {value} is outside 1..=5")]
    SubRatingOutOfRange { field: &'static str, value: u8 },

    #[error("negative feedback needs a comment of at least {min} characters (got {actual})")]
    CommentTooShort { min: usize, actual: usize },
}

/// Computes the overall rating and initial status for a verdict.
///
/// Positive verdicts publish immediately. Negative verdicts must carry a
/// comment of at least `policy.min_negative_comment_chars` characters
/// (after trimming) and enter moderation with a deadline of
/// `now + policy.grace_period`.
pub fn compute_rating(
    verdict: &Verdict,
    now: DateTime<Utc>,
    policy: &ModerationPolicy,
) -> Result<RatingOutcome, ValidationError> {
    let mut given = Vec::with_capacity(3);
    for (field, value) in verdict.ratings.named() {
        if let Some(value) = value {
            if Rating::new(value).is_none() {
                return Err(ValidationError::SubRatingOutOfRange { field, value });
            }
            given.push(value);
        }
    }

    if verdict.would_recommend {
        let overall = mean_rating(&given).unwrap_or(Rating::clamped(DEFAULT_POSITIVE_RATING));
        return Ok(RatingOutcome {
            overall_rating: overall,
            status: FeedbackStatus::Published,
            auto_publish_at: None,
        });
    }

    let actual = verdict.comment.trim().chars().count();
    if actual < policy.min_negative_comment_chars {
        return Err(ValidationError::CommentTooShort {
            min: policy.min_negative_comment_chars,
            actual,
        });
    }

    let overall = mean_rating(&given).unwrap_or(Rating::clamped(DEFAULT_NEGATIVE_RATING));
    Ok(RatingOutcome {
        overall_rating: overall,
        status: FeedbackStatus::PendingModeration,
        auto_publish_at: Some(now + policy.grace_period),
    })
}

/// Round-half-up mean of the given ratings, or `None` if there are none.
///
/// Integer arithmetic: floor(sum / n + 1/2) == (2 * sum + n) / (2 * n).
fn mean_rating(values: &[u8]) -> Option<Rating> {
    if values.is_empty() {
        return None;
    }
    let sum: u32 = values.iter().map(|&v| u32::from(v)).sum();
    let n = values.len() as u32;
    let rounded = (2 * sum + n) / (2 * n);
    Some(Rating::clamped(rounded.min(u32::from(Rating::MAX)) as u8))
}
