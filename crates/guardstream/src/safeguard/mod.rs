//! The safety classifier side of a request.
//!
//! - [`SafeguardTask`] - cancelable handle to the running classification,
//!   read at most once.
//! - [`SafeguardWait`] - post-exhaustion wait policy.
//! - [`parse_verdict`] / [`HarmCategories`] - interpretation of the
//!   classifier's text answer.

mod task;
mod verdict_parser;
mod wait;

pub use task::SafeguardTask;
pub use verdict_parser::{HarmCategories, parse_verdict};
pub use wait::SafeguardWait;
