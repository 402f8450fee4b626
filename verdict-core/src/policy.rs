use chrono::{DateTime, Duration, Utc};

/// Tunables of the moderation policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationPolicy {
    /// How long a business has to respond to negative feedback.
    pub grace_period: Duration,
    /// Days after creation at which the business is reminded.
    pub reminder_offsets_days: Vec<u32>,
    pub min_negative_comment_chars: usize,
    /// Lifetime of an invitation token.
    pub request_ttl: Duration,
    pub min_response_chars: usize,
}

impl Default for ModerationPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::days(7),
            reminder_offsets_days: vec![3, 5, 6],
            min_negative_comment_chars: 50,
            request_ttl: Duration::days(7),
            min_response_chars: 10,
        }
    }
}

/// A reminder to arm for a pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReminderSlot {
    pub fire_at: DateTime<Utc>,
    pub days_remaining: u32,
}

impl ModerationPolicy {
    /// Reminder slots for a record created at `created_at`.
    ///
    /// Offsets at or beyond the grace period are dropped, as are slots that
    /// are not strictly after `now`.
    pub fn reminder_schedule(
        &self,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<ReminderSlot> {
        let grace_days = self.grace_period.num_days();
        self.reminder_offsets_days
            .iter()
            .filter(|&&offset| i64::from(offset) < grace_days)
            .map(|&offset| ReminderSlot {
                fire_at: created_at + Duration::days(i64::from(offset)),
                days_remaining: (grace_days - i64::from(offset)) as u32,
            })
            .filter(|slot| slot.fire_at > now)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_default_reminders() {
        let slots = ModerationPolicy::default().reminder_schedule(t0(), t0());
        let remaining: Vec<u32> = slots.iter().map(|s| s.days_remaining).collect();
        assert_eq!(remaining, vec![4, 2, 1]);
        assert_eq!(slots[0].fire_at, t0() + Duration::days(3));
        assert_eq!(slots[2].fire_at, t0() + Duration::days(6));
    }

    #[test]
    fn test_past_reminders_are_skipped() {
        let now = t0() + Duration::days(5);
        let slots = ModerationPolicy::default().reminder_schedule(t0(), now);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].days_remaining, 1);
    }

    #[test]
    fn test_offsets_beyond_grace_dropped() {
        let policy = ModerationPolicy {
            grace_period: Duration::days(4),
            reminder_offsets_days: vec![1, 4, 9],
            ..ModerationPolicy::default()
        };
        let slots = policy.reminder_schedule(t0(), t0());
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].days_remaining, 3);
    }
}
