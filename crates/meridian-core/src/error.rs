//! Endpoint error types.

use std::time::Duration;

use thiserror::Error;

use crate::endpoint::EndpointState;

/// Errors produced by the endpoint core.
///
/// Transport and reconnect errors are absorbed by the endpoint driver
/// and published as events; only `send`-time errors and per-request
/// completion errors reach the caller.
#[derive(Error, Debug)]
pub enum EndpointError {
    /// The endpoint configuration is invalid (bad host, port, or
    /// service type). Surfaced synchronously at construction.
    #[error("Invalid endpoint configuration: {0}")]
    Configuration(String),

    /// The endpoint cannot accept the request right now, either
    /// because it is not connected or because the circuit is open.
    /// The router may retry on another endpoint.
    #[error("Endpoint not available (state: {state:?})")]
    NotAvailable {
        /// State snapshot taken when the request was rejected.
        state: EndpointState,
    },

    /// A connect attempt failed before the channel became ready.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// A connect attempt did not complete within the per-attempt
    /// deadline. Treated as attempt failure, never fatal.
    #[error("Connect attempt timed out after {0:?}")]
    ConnectTimedOut(Duration),

    /// The request was cancelled before completing.
    #[error("Request cancelled: {0}")]
    RequestCancelled(CancellationReason),

    /// The codec reported a per-request protocol failure.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Closing the channel during disconnect failed.
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),

    /// The channel did not close within `disconnect_timeout`.
    #[error("Disconnect timed out after {0:?}")]
    DisconnectTimedOut(Duration),

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EndpointError {
    /// Stable identifier for the error kind, used in logs and event
    /// context maps.
    pub fn error_type(&self) -> &'static str {
        match self {
            EndpointError::Configuration(_) => "configuration",
            EndpointError::NotAvailable { .. } => "endpoint_not_available",
            EndpointError::ConnectFailed(_) => "connect_failed",
            EndpointError::ConnectTimedOut(_) => "connect_timed_out",
            EndpointError::RequestCancelled(_) => "request_cancelled",
            EndpointError::Protocol(_) => "protocol",
            EndpointError::DisconnectFailed(_) => "disconnect_failed",
            EndpointError::DisconnectTimedOut(_) => "disconnect_timed_out",
            EndpointError::Io(_) => "io",
        }
    }

    /// Whether the error counts as a transport or server-health
    /// failure for circuit breaker accounting.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            EndpointError::ConnectFailed(_)
                | EndpointError::ConnectTimedOut(_)
                | EndpointError::Io(_)
                | EndpointError::RequestCancelled(CancellationReason::TimedOut)
                | EndpointError::RequestCancelled(CancellationReason::ChannelClosedWhileInFlight)
        )
    }
}

/// Why a request was cancelled. Terminal for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// The request deadline elapsed before a response arrived.
    TimedOut,
    /// Cancelled explicitly through the request context.
    CancelledViaContext,
    /// Cancelled by the originating caller before dispatch.
    StoppedAtSource,
    /// The channel closed while the request was in flight.
    ChannelClosedWhileInFlight,
    /// The request exceeded its local retry budget.
    TooManyRequestsInRetry,
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CancellationReason::TimedOut => "timed out",
            CancellationReason::CancelledViaContext => "cancelled via context",
            CancellationReason::StoppedAtSource => "stopped at source",
            CancellationReason::ChannelClosedWhileInFlight => "channel closed while in flight",
            CancellationReason::TooManyRequestsInRetry => "too many requests in retry",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_types() {
        assert_eq!(
            EndpointError::ConnectFailed("refused".into()).error_type(),
            "connect_failed"
        );
        assert_eq!(
            EndpointError::RequestCancelled(CancellationReason::TimedOut).error_type(),
            "request_cancelled"
        );
    }

    #[test]
    fn transport_failure_classification() {
        assert!(EndpointError::ConnectTimedOut(Duration::from_millis(10)).is_transport_failure());
        assert!(
            EndpointError::RequestCancelled(CancellationReason::ChannelClosedWhileInFlight)
                .is_transport_failure()
        );
        assert!(!EndpointError::Protocol("bad frame".into()).is_transport_failure());
        assert!(
            !EndpointError::RequestCancelled(CancellationReason::CancelledViaContext)
                .is_transport_failure()
        );
    }

    #[test]
    fn cancellation_reason_display() {
        assert_eq!(
            CancellationReason::ChannelClosedWhileInFlight.to_string(),
            "channel closed while in flight"
        );
    }
}
