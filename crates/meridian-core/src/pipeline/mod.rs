//! Transport-side handler chain installed on a connected channel.
//!
//! Pipelines are per-protocol; the core only defines the contract and
//! the building blocks every implementation shares (correlation
//! registry, idle watchdog). An installed chain runs, in order: the
//! idle watchdog, the protocol codec, the correlation handler, and the
//! flush controller.

mod correlation;
mod idle;

pub use self::correlation::CorrelationMap;
pub use self::idle::IdleTracker;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::EndpointContext;
use crate::error::EndpointError;
use crate::request::{Request, Response};
use crate::transport::Channel;

/// Contract between an endpoint and its installed handler chain.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Enqueues a request for transmission. Registration with the
    /// correlation handler happens here; the returned future resolves
    /// when the bytes have been handed to the OS. Writes may be
    /// coalesced, but must be flushed before this resolves when the
    /// endpoint runs in low-latency mode.
    async fn write(&self, request: Arc<Request>) -> Result<(), EndpointError>;

    /// Drains outstanding writes, fails still-pending correlated
    /// requests with `ChannelClosedWhileInFlight`, then closes the
    /// transport.
    async fn close(&self) -> Result<(), EndpointError>;

    /// Whether the chain has write capacity for another request.
    fn free(&self) -> bool;

    /// Resolves when the underlying channel has become inactive for
    /// any reason other than an explicit `close`.
    async fn closed(&self);
}

/// Installs the handler chain on a freshly connected channel.
///
/// Implementations carry the per-service protocol behavior, including
/// how responses are classified for circuit breaker accounting.
#[async_trait]
pub trait PipelineInitializer: Send + Sync {
    /// Builds the pipeline for one physical connection.
    async fn init(
        &self,
        channel: Box<dyn Channel>,
        ctx: &EndpointContext,
    ) -> Result<Box<dyn Pipeline>, EndpointError>;

    /// Whether a response counts as a transport or server-health
    /// failure for the breaker. The default trusts the codec label.
    fn is_transport_failure(&self, response: &Response) -> bool {
        response.status().is_transport_failure()
    }
}
