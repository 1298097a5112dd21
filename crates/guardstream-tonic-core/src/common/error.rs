//! Error type of the gRPC service.
//!
//! Wraps the engine's [`guardstream::Error`] together with the failures that
//! only exist at the service boundary. Handlers turn it into a
//! [`tonic::Status`] with [`Error::to_status`], which names the request.
//!
//! ## Status mapping
//!
//! - Every safeguard, backend, cast and tokenizer failure of the engine:
//!   `INTERNAL`.
//! - Unclassified engine failures (`guardstream::Error::Internal`): `UNKNOWN`.
//! - Engine cancellation: `CANCELLED`.
//! - `InvalidRequest` and engine validation failures: `INVALID_ARGUMENT`.
//! - `ServiceShutdown`: `UNAVAILABLE`.

use tonic::{Code, Status};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The generation, safeguard or refusal pipeline failed.
    #[error(transparent)]
    Engine(#[from] guardstream::Error),

    /// The client request was malformed.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A request arrived while the service was shutting down, or shutdown
    /// gave up waiting for it.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn code(&self) -> Code {
        match self {
            Self::Engine(guardstream::Error::RequestCancelled) => Code::Cancelled,
            Self::InvalidRequest { .. } | Self::Engine(guardstream::Error::Validation { .. }) => {
                Code::InvalidArgument
            }
            Self::ServiceShutdown => Code::Unavailable,
            Self::Engine(e) if e.is_known() => Code::Internal,
            Self::Engine(_) => Code::Unknown,
        }
    }

    /// Whether the caller went away. Nobody is left to receive a status.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Engine(guardstream::Error::RequestCancelled))
    }

    /// Whether logs should carry the full debug chain of this error.
    pub const fn wants_diagnostics(&self) -> bool {
        match self {
            Self::Engine(e) => e.wants_diagnostics(),
            Self::InvalidRequest { .. } | Self::ServiceShutdown => false,
        }
    }

    /// Builds the status sent to the caller of request `request_id`.
    pub fn to_status(&self, request_id: &str) -> Status {
        Status::new(
            self.code(),
            format!("Request ID: {request_id} | Error Msg: {self}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(err: guardstream::Error) -> Error {
        Error::Engine(err)
    }

    #[test]
    fn safeguard_failures_are_internal() {
        let err = engine(guardstream::Error::SafeguardNotResponsive {
            timeout_secs: 3,
            prompt_chars: 12,
        });
        assert_eq!(err.code(), Code::Internal);

        let err = engine(guardstream::Error::SafeguardUnrecognizedCategory { code: "S99".into() });
        assert_eq!(err.code(), Code::Internal);

        let err = engine(guardstream::Error::Backend {
            context: "502 Bad Gateway".into(),
        });
        assert_eq!(err.code(), Code::Internal);
        assert!(err.wants_diagnostics());
    }

    #[test]
    fn unclassified_failures_are_unknown() {
        let err = engine(guardstream::Error::from(anyhow::anyhow!("boom")));
        assert_eq!(err.code(), Code::Unknown);
        assert!(err.wants_diagnostics());
    }

    #[test]
    fn client_side_conditions() {
        let cancelled = engine(guardstream::Error::RequestCancelled);
        assert_eq!(cancelled.code(), Code::Cancelled);
        assert!(cancelled.is_cancelled());
        assert!(!Error::ServiceShutdown.is_cancelled());
        assert_eq!(Error::ServiceShutdown.code(), Code::Unavailable);
        assert_eq!(
            Error::InvalidRequest {
                reason: "empty prompt".into()
            }
            .code(),
            Code::InvalidArgument
        );
        assert!(!Error::ServiceShutdown.wants_diagnostics());
    }

    #[test]
    fn status_message_names_the_request() {
        let err = engine(guardstream::Error::SafeguardResponseParse {
            response: "maybe".into(),
        });
        let status = err.to_status("req-42");
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(
            status.message(),
            "Request ID: req-42 | Error Msg: could not parse safeguard response: \"maybe\""
        );
    }
}
