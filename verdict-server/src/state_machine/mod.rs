//! Explicit state machine for the feedback moderation lifecycle.
//!
//! This module implements a pure functional state machine. The design
//! separates:
//! - **State**: the `FeedbackRecord` and its `FeedbackStatus`
//! - **Events**: What happened (`Event`)
//! - **Effects**: What to do (`Effect`)
//! - **Transition**: Pure function `(Record, Event) -> (Record, Vec<Effect>)`
//!
//! The interpreter turns effects into durable jobs, and the store commits
//! record and jobs together with compare-and-set.

pub mod effect;
pub mod event;
pub mod interpreter;
pub mod repository;
pub mod store;
pub mod transition;

pub use effect::*;
pub use event::*;
pub use store::{Applied, RecordStore};
pub use transition::*;
