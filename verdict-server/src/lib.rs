pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod reconciliation;
pub mod scheduler;
pub mod service;
pub mod state_machine;
pub mod status;
pub mod worker;

pub use error::{IssueError, ModerateError, RespondError, SubmitError};
pub use scheduler::AutoPublishScheduler;
pub use service::FeedbackService;
pub use state_machine::repository::{FeedbackRepository, InMemoryRepository, SqliteRepository};

pub struct AppState {
    pub service: FeedbackService,
    pub status_auth_token: Option<String>,
}
