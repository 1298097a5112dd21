//! The `TextGenerator` gRPC service.
//!
//! - [`handler`] - RPC entry points (`TextGeneratorService`).
//! - [`shape`] - casters and refusal chunk builders per RPC.
//! - [`lifecycle`] - admission, in-flight tracking and draining.

pub mod handler;
pub mod lifecycle;
pub mod shape;
