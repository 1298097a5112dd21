//! Safety-gated token streaming.
//!
//! Each request runs two things concurrently: the backend's token stream and
//! a one-shot safety classification of the prompt. [`Orchestrator::run`]
//! buffers generated chunks until the classifier answers, then either releases
//! them (and everything after) or throws them away and streams a tokenized
//! refusal in their place.

mod context;
mod error;
mod orchestrator;
mod queue;
mod refusal;
mod safeguard;
mod tokenizer;
mod verdict;

pub use crate::context::*;
pub use crate::error::*;
pub use crate::orchestrator::*;
pub use crate::queue::*;
pub use crate::refusal::*;
pub use crate::safeguard::*;
pub use crate::tokenizer::*;
pub use crate::verdict::*;
