pub mod model;
pub mod policy;
pub mod rating;
pub mod stats;

pub use model::*;
pub use policy::{ModerationPolicy, ReminderSlot};
pub use rating::{compute_rating, RatingOutcome, SubRatings, ValidationError, Verdict};
pub use stats::BusinessStats;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Version string reported by the binaries and the status endpoint.
///
/// Prefers a git hash injected by the release build, falling back to the
/// crate version.
pub fn get_version() -> String {
    match option_env!("VERDICT_GIT_HASH") {
        Some(git_hash) if git_hash.len() >= 8 => git_hash[..8].to_string(),
        Some(git_hash) if !git_hash.is_empty() => git_hash.to_string(),
        _ => built_info::PKG_VERSION.to_string(),
    }
}
