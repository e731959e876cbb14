//! Failure taxonomy shared by every component.
//!
//! # Design Decisions
//! - Components never propagate these to the chain; each one is resolved
//!   locally into a terminal status via `Connection::status_response`
//! - `status()` is the single place a failure class maps to an HTTP status

use axum::http::StatusCode;
use thiserror::Error;

/// Errors raised while a component processes a request.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A content pipe was requested in a slot state that cannot satisfy it.
    #[error("content pipe allocation conflict: {0}")]
    AllocationConflict(#[from] PipeError),

    /// Upstream output broke the gateway protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Upstream output exceeded a parser limit.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// The upstream process could not be run or failed.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// The request path does not resolve to a resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials were missing or wrong.
    #[error("unauthorized")]
    Unauthorized,
}

impl PipelineError {
    /// The HTTP status this failure is reported as.
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Unauthorized => StatusCode::UNAUTHORIZED,
            PipelineError::AllocationConflict(_)
            | PipelineError::ProtocolViolation(_)
            | PipelineError::LimitExceeded(_)
            | PipelineError::UpstreamFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::AllocationConflict(_) => "allocation_conflict",
            PipelineError::ProtocolViolation(_) => "protocol_violation",
            PipelineError::LimitExceeded(_) => "limit_exceeded",
            PipelineError::UpstreamFailure(_) => "upstream_failure",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Unauthorized => "unauthorized",
        }
    }
}

/// Content pipe slot errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    /// A pipe is already open on the connection.
    #[error("no content writer available")]
    WriterUnavailable,

    /// No pipe is pending on the connection.
    #[error("no content reader pending")]
    ReaderUnavailable,

    /// The other end of the pipe has gone away.
    #[error("content pipe closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_failure_class() {
        assert_eq!(PipelineError::NotFound("/x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(PipelineError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        let conflict = PipelineError::from(PipeError::WriterUnavailable);
        assert_eq!(conflict.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(conflict.kind(), "allocation_conflict");
        assert_eq!(
            PipelineError::LimitExceeded("header line too long".into()).kind(),
            "limit_exceeded"
        );
    }
}
