//! Notification dispatch boundary.
//!
//! The engine only decides *what* to send and to whom. Delivery belongs to a
//! `Notifier` implementation; the server ships one that logs each dispatch.
//! Every notification carries an idempotency key so transports can drop
//! duplicates caused by job retries.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;
use verdict_core::{FeedbackRecord, FeedbackRequest};

/// Message templates known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Invitation carrying a redemption token.
    Invitation,
    CustomerThankYou,
    CustomerFeedbackPublished,
    BusinessNegativeFeedback,
    BusinessAutoPublished,
    BusinessReminder,
}

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invitation => "invitation",
            Self::CustomerThankYou => "customer_thank_you",
            Self::CustomerFeedbackPublished => "customer_feedback_published",
            Self::BusinessNegativeFeedback => "business_negative_feedback",
            Self::BusinessAutoPublished => "business_auto_published",
            Self::BusinessReminder => "business_reminder",
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which party of a record a notification addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Business,
    Customer,
}

/// A fully rendered notification ready for a transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub to: String,
    pub template: Template,
    pub context: serde_json::Value,
    pub idempotency_key: String,
}

impl Notification {
    /// Renders a notification about a feedback record.
    ///
    /// `discriminator` separates otherwise identical sends, e.g. the
    /// individual reminders of one record.
    pub fn for_record(
        record: &FeedbackRecord,
        audience: Audience,
        template: Template,
        discriminator: &str,
        extra: serde_json::Value,
    ) -> Self {
        let to = match audience {
            Audience::Business => record.business_id.to_string(),
            Audience::Customer => record.customer_contact.clone(),
        };
        let mut context = json!({
            "record_id": record.id.to_string(),
            "business_id": record.business_id.to_string(),
            "overall_rating": record.overall_rating.get(),
            "would_recommend": record.would_recommend,
            "comment": record.comment,
            "status": record.status.as_str(),
            "auto_publish_at": record.auto_publish_at.map(|at| at.to_rfc3339()),
            "store_response": record.store_response,
        });
        merge(&mut context, extra);
        Self {
            to,
            template,
            context,
            idempotency_key: idempotency_key(&record.id.to_string(), template, discriminator),
        }
    }

    /// Renders the invitation for a feedback request.
    pub fn invitation(request: &FeedbackRequest) -> Self {
        Self {
            to: request.customer_contact.clone(),
            template: Template::Invitation,
            context: json!({
                "business_id": request.business_id.to_string(),
                "order_id": request.order_id.to_string(),
                "token": request.token.to_string(),
                "expires_at": request.expires_at.to_rfc3339(),
            }),
            idempotency_key: idempotency_key(&request.token.0, Template::Invitation, ""),
        }
    }
}

fn merge(base: &mut serde_json::Value, extra: serde_json::Value) {
    if let (Some(base), serde_json::Value::Object(extra)) = (base.as_object_mut(), extra) {
        base.extend(extra);
    }
}

/// sha256 over subject, template and discriminator, hex encoded.
pub fn idempotency_key(subject: &str, template: Template, discriminator: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update([0x1f]);
    hasher.update(template.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(discriminator.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("recipient rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), DispatchError>;
}

/// Transport that only writes each dispatch to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), DispatchError> {
        info!(
            template = %notification.template,
            to = %notification.to,
            key = %notification
                .idempotency_key
                .get(..12)
                .unwrap_or(&notification.idempotency_key),
            "Dispatching notification"
        );
        Ok(())
    }
}

/// Collects notifications in memory, deduplicating by idempotency key.
///
/// `fail_next` makes the next N sends fail with a transport error.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    seen: Mutex<HashSet<String>>,
    failures_pending: AtomicUsize,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_with(&self, template: Template) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.template == template)
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), DispatchError> {
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DispatchError::Transport("injected failure".to_string()));
        }

        let fresh = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(notification.idempotency_key.clone());
        if fresh {
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(notification.clone());
        }
        Ok(())
    }
}
