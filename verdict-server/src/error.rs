//! Errors returned by `FeedbackService`.
//!
//! Every variant except `Repository` is terminal: retrying the same call
//! cannot succeed.

use verdict_core::{FeedbackStatus, RecordId, ValidationError};

use crate::state_machine::repository::RepositoryError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Unknown token, or a request marked invalid.
    #[error("invalid feedback token")]
    InvalidToken,

    #[error("feedback request has expired")]
    Expired,

    #[error("feedback has already been submitted for this request")]
    AlreadyResponded,

    #[error("feedback rejected: {0}")]
    ValidationFailed(#[from] ValidationError),

    #[error("review limit of {limit} reached for this business")]
    QuotaExceeded { limit: u32 },

    /// An order-direct submission for an order that already has feedback.
    #[error("feedback already exists for this order")]
    DuplicateOrder,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RespondError {
    #[error("feedback {0} not found")]
    NotFound(RecordId),

    #[error("feedback {record_id} is {status} and no longer accepts a response")]
    NotPending {
        record_id: RecordId,
        status: FeedbackStatus,
    },

    #[error("response must be at least {min} characters")]
    ResponseTooShort { min: usize },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssueError {
    #[error("a feedback request already exists for this order and customer")]
    DuplicateRequest,

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModerateError {
    #[error("feedback {0} not found")]
    NotFound(RecordId),

    #[error("feedback {record_id} is {status}; {action} does not apply")]
    NotApplicable {
        record_id: RecordId,
        status: FeedbackStatus,
        action: crate::state_machine::ModerationAction,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
