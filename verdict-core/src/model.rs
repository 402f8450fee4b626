//! Domain types for feedback records, invitation requests and plans.
//!
//! Following the principle of "make illegal states unrepresentable", the
//! origin of a record is a tagged union rather than two nullable references,
//! and ratings are a validated newtype.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rating::{RatingOutcome, SubRatings, Verdict};

/// Newtype for a feedback record ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Newtype for a business identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessId(pub String);

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BusinessId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BusinessId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for the business's own order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Single-use redemption token sent to a customer with an invitation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(pub String);

impl RequestToken {
    /// Generates a fresh unguessable token (UUID v4, hyphen-free).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns a truncated token for log lines (first 8 characters).
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Error returned when parsing a stored enum column fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// An overall rating between 1 and 5 stars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    /// Returns `None` unless `value` is within 1..=5.
    pub fn new(value: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&value).then_some(Self(value))
    }

    /// Clamps any value into 1..=5.
    pub fn clamped(value: u8) -> Self {
        Self(value.clamp(Self::MIN, Self::MAX))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("rating {} is outside 1..=5", value))
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Feedback requests (invitations)
// =============================================================================

/// Lifecycle of an invitation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Responded,
    Expired,
    /// The customer contact turned out to be unusable.
    Invalid,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Responded => "responded",
            Self::Expired => "expired",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "responded" => Ok(Self::Responded),
            "expired" => Ok(Self::Expired),
            "invalid" => Ok(Self::Invalid),
            other => Err(ParseEnumError {
                kind: "request status",
                value: other.to_string(),
            }),
        }
    }
}

/// Why a token cannot be redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemRejection {
    Invalid,
    Expired,
    AlreadyResponded,
}

/// An outstanding single-use invitation sent to a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub token: RequestToken,
    pub business_id: BusinessId,
    pub order_id: OrderId,
    pub customer_contact: String,
    pub status: RequestStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl FeedbackRequest {
    /// Creates a pending request with a freshly generated token.
    pub fn new(
        business_id: BusinessId,
        order_id: OrderId,
        customer_contact: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            token: RequestToken::generate(),
            business_id,
            order_id,
            customer_contact: customer_contact.into(),
            status: RequestStatus::Pending,
            expires_at: now + ttl,
            created_at: now,
            responded_at: None,
        }
    }

    /// A request is past its deadline strictly after `expires_at`.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Checks whether the token may be redeemed at `now`.
    ///
    /// A pending request past its deadline is reported as expired even if the
    /// expiry sweep has not marked it yet.
    pub fn check_redeemable(&self, now: DateTime<Utc>) -> Result<(), RedeemRejection> {
        match self.status {
            RequestStatus::Pending if self.is_past_expiry(now) => Err(RedeemRejection::Expired),
            RequestStatus::Pending => Ok(()),
            RequestStatus::Responded => Err(RedeemRejection::AlreadyResponded),
            RequestStatus::Expired => Err(RedeemRejection::Expired),
            RequestStatus::Invalid => Err(RedeemRejection::Invalid),
        }
    }
}

// =============================================================================
// Feedback records
// =============================================================================

/// Moderation status of a feedback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    /// Negative feedback inside its grace period.
    PendingModeration,
    Published,
    /// Published by the scheduler after the grace period ran out.
    AutoPublished,
    Hidden,
    Disputed,
    Archived,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingModeration => "pending_moderation",
            Self::Published => "published",
            Self::AutoPublished => "auto_published",
            Self::Hidden => "hidden",
            Self::Disputed => "disputed",
            Self::Archived => "archived",
        }
    }

    /// Published and auto-published records are the only ones counted in
    /// public stats.
    pub fn is_public(&self) -> bool {
        matches!(self, Self::Published | Self::AutoPublished)
    }
}

impl fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_moderation" => Ok(Self::PendingModeration),
            "published" => Ok(Self::Published),
            "auto_published" => Ok(Self::AutoPublished),
            "hidden" => Ok(Self::Hidden),
            "disputed" => Ok(Self::Disputed),
            "archived" => Ok(Self::Archived),
            other => Err(ParseEnumError {
                kind: "feedback status",
                value: other.to_string(),
            }),
        }
    }
}

/// Where a record came from. Exactly one origin applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    /// Submitted directly against an order (widget / order page).
    OrderSubmission { order_id: OrderId },
    /// Submitted by redeeming an invitation token.
    InvitationSubmission {
        token: RequestToken,
        order_id: OrderId,
    },
}

impl Origin {
    pub fn order_id(&self) -> &OrderId {
        match self {
            Self::OrderSubmission { order_id } => order_id,
            Self::InvitationSubmission { order_id, .. } => order_id,
        }
    }

    pub fn token(&self) -> Option<&RequestToken> {
        match self {
            Self::OrderSubmission { .. } => None,
            Self::InvitationSubmission { token, .. } => Some(token),
        }
    }
}

/// The customer's verdict plus computed rating and moderation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: RecordId,
    pub business_id: BusinessId,
    pub customer_contact: String,
    pub origin: Origin,
    pub would_recommend: bool,
    #[serde(default)]
    pub ratings: SubRatings,
    pub comment: String,
    pub overall_rating: Rating,
    pub status: FeedbackStatus,
    /// Set iff the record is negative and still pending moderation.
    pub auto_publish_at: Option<DateTime<Utc>>,
    pub store_response: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    /// Incremented on every committed mutation; part of the CAS precondition.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeedbackRecord {
    /// Builds a new record from a validated verdict.
    pub fn from_submission(
        business_id: BusinessId,
        customer_contact: impl Into<String>,
        origin: Origin,
        verdict: Verdict,
        outcome: RatingOutcome,
        now: DateTime<Utc>,
    ) -> Self {
        let published_at = outcome.status.is_public().then_some(now);
        Self {
            id: RecordId::new(),
            business_id,
            customer_contact: customer_contact.into(),
            origin,
            would_recommend: verdict.would_recommend,
            ratings: verdict.ratings,
            comment: verdict.comment,
            overall_rating: outcome.overall_rating,
            status: outcome.status,
            auto_publish_at: outcome.auto_publish_at,
            store_response: None,
            responded_at: None,
            published_at,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == FeedbackStatus::PendingModeration
    }

    /// Whether the auto-publish deadline has been reached at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.auto_publish_at.is_some_and(|at| now >= at)
    }

    /// A store may respond while the record is pending, and once (late) after
    /// the scheduler auto-published it.
    pub fn accepts_response(&self) -> bool {
        match self.status {
            FeedbackStatus::PendingModeration => true,
            FeedbackStatus::AutoPublished => self.store_response.is_none(),
            _ => false,
        }
    }
}

// =============================================================================
// Plans
// =============================================================================

/// Subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Basic,
    Standard,
    Premium,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }

    /// Review limit granted when a plan of this tier is purchased.
    pub fn default_review_limit(&self) -> u32 {
        match self {
            Self::Basic => 100,
            Self::Standard => 1_000,
            Self::Premium => 10_000,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Self::Basic),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            other => Err(ParseEnumError {
                kind: "plan tier",
                value: other.to_string(),
            }),
        }
    }
}

/// Active subscription plan for a business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub tier: PlanTier,
    pub review_limit: u32,
}

impl Plan {
    /// Limit applied to businesses that never bought a plan.
    pub const FALLBACK_REVIEW_LIMIT: u32 = 50;

    pub fn for_tier(tier: PlanTier) -> Self {
        Self {
            tier,
            review_limit: tier.default_review_limit(),
        }
    }

    pub fn fallback(review_limit: u32) -> Self {
        Self {
            tier: PlanTier::Basic,
            review_limit,
        }
    }
}

impl Default for Plan {
    fn default() -> Self {
        Self::fallback(Self::FALLBACK_REVIEW_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn request(status: RequestStatus) -> FeedbackRequest {
        let mut request = FeedbackRequest::new(
            BusinessId::from("acme"),
            OrderId::from("order-1"),
            "customer@example.com",
            t0(),
            Duration::days(7),
        );
        request.status = status;
        request
    }

    #[test]
    fn test_rating_bounds() {
        assert_eq!(Rating::new(0), None);
        assert_eq!(Rating::new(6), None);
        assert_eq!(Rating::new(3).map(Rating::get), Some(3));
        assert_eq!(Rating::clamped(0).get(), 1);
        assert_eq!(Rating::clamped(9).get(), 5);
    }

    #[test]
    fn test_rating_rejects_out_of_range_json() {
        assert!(serde_json::from_str::<Rating>("7").is_err());
        assert_eq!(serde_json::from_str::<Rating>("4").unwrap().get(), 4);
    }

    #[test]
    fn test_token_short() {
        let token = RequestToken::from("0123456789abcdef");
        assert_eq!(token.short(), "01234567");
        assert_eq!(RequestToken::from("abc").short(), "abc");
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        let a = RequestToken::generate();
        let b = RequestToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.0.len(), 32);
    }

    #[test]
    fn test_check_redeemable() {
        let now = t0() + Duration::days(1);
        assert_eq!(request(RequestStatus::Pending).check_redeemable(now), Ok(()));
        assert_eq!(
            request(RequestStatus::Responded).check_redeemable(now),
            Err(RedeemRejection::AlreadyResponded)
        );
        assert_eq!(
            request(RequestStatus::Expired).check_redeemable(now),
            Err(RedeemRejection::Expired)
        );
        assert_eq!(
            request(RequestStatus::Invalid).check_redeemable(now),
            Err(RedeemRejection::Invalid)
        );
    }

    #[test]
    fn test_pending_request_past_deadline_is_expired() {
        let pending = request(RequestStatus::Pending);
        // Exactly at the deadline is still redeemable.
        assert_eq!(pending.check_redeemable(pending.expires_at), Ok(()));
        assert_eq!(
            pending.check_redeemable(pending.expires_at + Duration::seconds(1)),
            Err(RedeemRejection::Expired)
        );
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            FeedbackStatus::PendingModeration,
            FeedbackStatus::Published,
            FeedbackStatus::AutoPublished,
            FeedbackStatus::Hidden,
            FeedbackStatus::Disputed,
            FeedbackStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<FeedbackStatus>(), Ok(status));
        }
        assert!("draft".parse::<FeedbackStatus>().is_err());
    }

    #[test]
    fn test_origin_serializes_as_tagged_union() {
        let origin = Origin::InvitationSubmission {
            token: RequestToken::from("tok"),
            order_id: OrderId::from("o-9"),
        };
        let json = serde_json::to_value(&origin).unwrap();
        assert_eq!(json["kind"], "invitation_submission");
        assert_eq!(json["token"], "tok");
        assert_eq!(origin.token().map(|t| t.0.as_str()), Some("tok"));
        assert_eq!(origin.order_id().0, "o-9");
    }

    #[test]
    fn test_plan_defaults() {
        assert_eq!(Plan::default().review_limit, 50);
        assert_eq!(Plan::for_tier(PlanTier::Standard).review_limit, 1_000);
        assert_eq!("premium".parse::<PlanTier>(), Ok(PlanTier::Premium));
    }
}
