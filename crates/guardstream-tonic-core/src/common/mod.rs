//! Types shared between the gRPC server and its clients.
//!
//! - [`error`] - service-level error and its mapping to [`tonic::Status`].

pub mod error;
pub use error::Error;
