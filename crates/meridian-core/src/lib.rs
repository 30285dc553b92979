//! Connection endpoint core for the Meridian document database
//! client.
//!
//! An endpoint is a single long-lived, ordered conduit between the
//! client process and one remote service socket. This crate owns how
//! an endpoint is born, kept alive, protected, and torn down:
//!
//! - **Endpoint**: lifecycle state machine driven by one task per
//!   endpoint (connect, reconnect with backoff, graceful and forced
//!   disconnect)
//! - **Circuit breaker**: rolling-window failure accounting gating
//!   `send`
//! - **Pipeline**: the contract to the per-protocol transport handler
//!   chain, plus the correlation and idle-watchdog building blocks
//! - **Event bus**: non-blocking publish surface for lifecycle and
//!   diagnostic events
//! - **Context**: explicit identity threaded through every operation
//!
//! Wire codecs, topology discovery, and user-facing APIs live in the
//! crates above and below this one.

pub mod breaker;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod request;
pub mod retry;
pub mod service;
pub mod testing;
pub mod transport;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::{CircuitBreakerConfig, ConfigError, CoreConfig};
pub use context::{CoreContext, CoreEnvironment, EndpointContext, RequestContext};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointState};
pub use error::{CancellationReason, EndpointError};
pub use event::{DefaultEventBus, Event, EventBus, EventKind, Severity};
pub use pipeline::{CorrelationMap, IdleTracker, Pipeline, PipelineInitializer};
pub use request::{Request, RequestResult, Response, ResponseStatus};
pub use retry::Backoff;
pub use service::ServiceType;
pub use transport::{Channel, Connector, TcpChannel, TcpConnector};
