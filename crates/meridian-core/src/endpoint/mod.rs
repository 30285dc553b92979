//! Endpoint lifecycle orchestration.
//!
//! An endpoint is a single long-lived, ordered conduit to one remote
//! service socket. All mutable lifecycle state is owned by one driver
//! task; callers interact through commanded transitions (`connect`,
//! `disconnect`, `send`) and stale-tolerant snapshots (`state`,
//! `free`).

mod driver;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::CoreConfig;
use crate::context::{CoreContext, CoreEnvironment, EndpointContext};
use crate::error::EndpointError;
use crate::pipeline::{Pipeline, PipelineInitializer};
use crate::request::Request;
use crate::retry::Backoff;
use crate::service::ServiceType;
use crate::transport::{Connector, TcpConnector};

use self::driver::Driver;

/// Lifecycle state snapshot of an endpoint.
///
/// The connected variants fold in the circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// No channel, no pending connect.
    Disconnected,
    /// A connect attempt (or retry loop) is running.
    Connecting,
    /// Connected, breaker closed: requests flow.
    ConnectedCircuitClosed,
    /// Connected, breaker open: `send` is rejected.
    ConnectedCircuitOpen,
    /// Connected, breaker probing recovery.
    ConnectedCircuitHalfOpen,
    /// An explicit disconnect is draining the channel.
    Disconnecting,
}

const LIFECYCLE_DISCONNECTED: u8 = 0;
const LIFECYCLE_CONNECTING: u8 = 1;
const LIFECYCLE_CONNECTED: u8 = 2;
const LIFECYCLE_DISCONNECTING: u8 = 3;

pub(crate) enum Command {
    Connect,
    Disconnect,
    Send(Arc<Request>),
}

/// State shared between the endpoint handle and its driver task.
pub(crate) struct Shared {
    ctx: EndpointContext,
    breaker: CircuitBreaker,
    lifecycle: AtomicU8,
    pipeline: Mutex<Option<Arc<dyn Pipeline>>>,
}

impl Shared {
    pub(crate) fn ctx(&self) -> &EndpointContext {
        &self.ctx
    }

    pub(crate) fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn lifecycle(&self) -> u8 {
        self.lifecycle.load(Ordering::Acquire)
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: u8) {
        self.lifecycle.store(lifecycle, Ordering::Release);
    }

    pub(crate) fn set_pipeline(&self, pipeline: Option<Arc<dyn Pipeline>>) {
        *self.pipeline.lock().expect("pipeline lock poisoned") = pipeline;
    }

    pub(crate) fn state(&self) -> EndpointState {
        match self.lifecycle() {
            LIFECYCLE_CONNECTING => EndpointState::Connecting,
            LIFECYCLE_DISCONNECTING => EndpointState::Disconnecting,
            LIFECYCLE_CONNECTED => match self.breaker.state() {
                BreakerState::Closed => EndpointState::ConnectedCircuitClosed,
                BreakerState::Open => EndpointState::ConnectedCircuitOpen,
                BreakerState::HalfOpen => EndpointState::ConnectedCircuitHalfOpen,
            },
            _ => EndpointState::Disconnected,
        }
    }
}

/// A single client-to-server channel for one service type.
pub struct Endpoint {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl Endpoint {
    /// Starts building an endpoint for the given remote socket.
    pub fn builder(
        remote_host: impl Into<String>,
        remote_port: u16,
        service_type: ServiceType,
    ) -> EndpointBuilder {
        EndpointBuilder {
            remote_host: remote_host.into(),
            remote_port,
            service_type,
            core: None,
            connector: None,
            initializer: None,
            runtime: None,
            backoff_seed: None,
        }
    }

    /// Begins connecting. Idempotent; only acted on from
    /// [`EndpointState::Disconnected`].
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Begins disconnecting. Idempotent; valid from any state.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Accepts a request for dispatch on this endpoint.
    ///
    /// Returns [`EndpointError::NotAvailable`] when the endpoint is
    /// not connected or the circuit breaker denies the dispatch; the
    /// router decides whether to retry elsewhere.
    pub fn send(&self, request: Arc<Request>) -> Result<(), EndpointError> {
        if self.shared.lifecycle() != LIFECYCLE_CONNECTED {
            return Err(EndpointError::NotAvailable {
                state: self.state(),
            });
        }
        if !self.shared.breaker.allow() {
            return Err(EndpointError::NotAvailable {
                state: self.state(),
            });
        }
        if self.commands.send(Command::Send(request)).is_err() {
            // Driver already gone; release any reserved probe slot.
            self.shared.breaker.abort_probe();
            return Err(EndpointError::NotAvailable {
                state: EndpointState::Disconnected,
            });
        }
        Ok(())
    }

    /// Current state snapshot; possibly stale across threads.
    pub fn state(&self) -> EndpointState {
        self.shared.state()
    }

    /// Whether the installed pipeline has write capacity for another
    /// request. False while not connected.
    pub fn free(&self) -> bool {
        self.shared
            .pipeline
            .lock()
            .expect("pipeline lock poisoned")
            .as_ref()
            .is_some_and(|pipeline| pipeline.free())
    }

    /// The identity context this endpoint operates under.
    pub fn context(&self) -> &EndpointContext {
        self.shared.ctx()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("endpoint_id", &self.shared.ctx.endpoint_id())
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Endpoint`].
pub struct EndpointBuilder {
    remote_host: String,
    remote_port: u16,
    service_type: ServiceType,
    core: Option<CoreContext>,
    connector: Option<Arc<dyn Connector>>,
    initializer: Option<Arc<dyn PipelineInitializer>>,
    runtime: Option<Handle>,
    backoff_seed: Option<u64>,
}

impl EndpointBuilder {
    /// Uses an existing core context (environment, event bus).
    pub fn context(mut self, core: CoreContext) -> Self {
        self.core = Some(core);
        self
    }

    /// Replaces the default TCP connector, e.g. with a bootstrap
    /// sequence or a test stub.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// The per-service pipeline installed on every physical connect.
    pub fn pipeline_initializer(mut self, initializer: Arc<dyn PipelineInitializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Runtime handle the driver task is spawned on. Defaults to the
    /// current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Seeds the reconnect backoff jitter, making retry schedules
    /// deterministic for tests.
    pub fn backoff_seed(mut self, seed: u64) -> Self {
        self.backoff_seed = Some(seed);
        self
    }

    /// Validates the configuration and spawns the driver task.
    pub fn build(self) -> Result<Endpoint, EndpointError> {
        if self.remote_host.is_empty() {
            return Err(EndpointError::Configuration(
                "remote host must not be empty".into(),
            ));
        }
        if self.remote_port == 0 {
            return Err(EndpointError::Configuration(
                "remote port must not be zero".into(),
            ));
        }
        let initializer = self.initializer.ok_or_else(|| {
            EndpointError::Configuration("a pipeline initializer is required".into())
        })?;

        let core = match self.core {
            Some(core) => core,
            None => CoreContext::new(CoreEnvironment::with_default_bus(CoreConfig::default())),
        };
        let config = core.environment().config().clone();
        let bus = core.environment().event_bus().clone();

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::new(
                self.remote_host.clone(),
                self.remote_port,
            )?),
        };

        let ctx = EndpointContext::new(core, self.remote_host, self.remote_port, self.service_type);
        let breaker = CircuitBreaker::new(config.circuit_breaker(self.service_type).clone());

        let shared = Arc::new(Shared {
            ctx,
            breaker,
            lifecycle: AtomicU8::new(LIFECYCLE_DISCONNECTED),
            pipeline: Mutex::new(None),
        });

        let backoff = match self.backoff_seed {
            Some(seed) => Backoff::with_seed(seed),
            None => Backoff::new(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let driver = Driver::new(
            shared.clone(),
            config,
            connector,
            initializer,
            bus,
            rx,
            shutdown.clone(),
            backoff,
        );

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| {
                EndpointError::Configuration(
                    "no tokio runtime available for the endpoint driver".into(),
                )
            })?,
        };
        runtime.spawn(driver.run());

        Ok(Endpoint {
            shared,
            commands: tx,
            shutdown,
        })
    }
}
