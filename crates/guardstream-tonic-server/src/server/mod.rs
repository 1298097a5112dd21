//! Server-side components of the guardstream gRPC proxy.
//!
//! - [`config`] - CLI/env configuration and its validation.
//! - [`backend`] - HTTP clients for the generation backend and the safeguard.
//! - [`prompt`] - Prompt preparation for both RPC shapes.
//! - [`service`] - The `TextGenerator` implementation.
//! - [`health`] - Backend liveness prober feeding `grpc.health.v1`.
//! - [`telemetry`] - Logging, tracing and metrics setup.

pub mod backend;
pub mod config;
pub mod health;
pub mod prompt;
pub mod service;
pub mod telemetry;
