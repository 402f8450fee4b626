use serde::Serialize;

use crate::model::FeedbackRecord;

/// Aggregate view over a business's public feedback. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BusinessStats {
    pub total_published: usize,
    /// Mean overall rating, one decimal place. 0.0 when nothing is published.
    pub average_rating: f64,
    /// Share of published records that would recommend, one decimal place.
    pub recommendation_percentage: f64,
}

impl BusinessStats {
    /// Computes stats over the published and auto-published records in
    /// `records`; every other status is ignored.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a FeedbackRecord>) -> Self {
        let mut total = 0usize;
        let mut rating_sum = 0u64;
        let mut recommending = 0usize;
        for record in records.into_iter().filter(|r| r.status.is_public()) {
            total += 1;
            rating_sum += u64::from(record.overall_rating.get());
            if record.would_recommend {
                recommending += 1;
            }
        }

        if total == 0 {
            return Self {
                total_published: 0,
                average_rating: 0.0,
                recommendation_percentage: 0.0,
            };
        }

        Self {
            total_published: total,
            average_rating: round1(rating_sum as f64 / total as f64),
            recommendation_percentage: round1(recommending as f64 * 100.0 / total as f64),
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
