//! Fixtures shared by the repository tests.

use chrono::{DateTime, TimeZone, Utc};
use verdict_core::{
    compute_rating, BusinessId, FeedbackRecord, FeedbackRequest, ModerationPolicy, OrderId,
    Origin, Verdict,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 2, 9, 0, 0).unwrap()
}

fn order_record(business: &str, order: &str, verdict: Verdict, now: DateTime<Utc>) -> FeedbackRecord {
    let outcome = compute_rating(&verdict, now, &ModerationPolicy::default()).unwrap();
    FeedbackRecord::from_submission(
        BusinessId::from(business),
        "customer@example.com",
        Origin::OrderSubmission {
            order_id: OrderId::from(order),
        },
        verdict,
        outcome,
        now,
    )
}

pub fn positive_record(business: &str, order: &str, now: DateTime<Utc>) -> FeedbackRecord {
    order_record(business, order, Verdict::positive(), now)
}

pub fn pending_record(business: &str, order: &str, now: DateTime<Utc>) -> FeedbackRecord {
    order_record(
        business,
        order,
        Verdict::negative("Delivery took three weeks and nobody answered my emails."),
        now,
    )
}

pub fn request(business: &str, order: &str, now: DateTime<Utc>) -> FeedbackRequest {
    FeedbackRequest::new(
        BusinessId::from(business),
        OrderId::from(order),
        "customer@example.com",
        now,
        ModerationPolicy::default().request_ttl,
    )
}

pub fn invitation_record(request: &FeedbackRequest, now: DateTime<Utc>) -> FeedbackRecord {
    let verdict = Verdict::positive();
    let outcome = compute_rating(&verdict, now, &ModerationPolicy::default()).unwrap();
    FeedbackRecord::from_submission(
        request.business_id.clone(),
        request.customer_contact.clone(),
        Origin::InvitationSubmission {
            token: request.token.clone(),
            order_id: request.order_id.clone(),
        },
        verdict,
        outcome,
        now,
    )
}
