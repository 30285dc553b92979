//! Ambient identity carried through every endpoint operation.
//!
//! Contexts are immutable identity snapshots plus a small write-once
//! sidecar (dispatch latency, user payload). They are threaded
//! explicitly through operations and never live in task-local state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use serde_json::Value;

use crate::config::CoreConfig;
use crate::error::CancellationReason;
use crate::event::{DefaultEventBus, EventBus};
use crate::request::Request;
use crate::service::ServiceType;

static NEXT_CORE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Shared runtime environment: configuration and the event bus.
///
/// Reference-counted; endpoints hold a shared handle through their
/// contexts.
#[derive(Debug)]
pub struct CoreEnvironment {
    config: CoreConfig,
    event_bus: Arc<dyn EventBus>,
}

impl CoreEnvironment {
    /// Creates an environment with an explicit bus.
    pub fn new(config: CoreConfig, event_bus: Arc<dyn EventBus>) -> Arc<Self> {
        Arc::new(Self { config, event_bus })
    }

    /// Creates an environment with the default broadcast bus.
    pub fn with_default_bus(config: CoreConfig) -> Arc<Self> {
        Self::new(config, Arc::new(DefaultEventBus::new()))
    }

    /// The core configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The shared event bus handle.
    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.event_bus
    }
}

/// Identity of one client core instance.
#[derive(Debug, Clone)]
pub struct CoreContext {
    core_id: u64,
    env: Arc<CoreEnvironment>,
}

impl CoreContext {
    /// Creates a context with a fresh process-wide core id.
    pub fn new(env: Arc<CoreEnvironment>) -> Self {
        Self {
            core_id: NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed),
            env,
        }
    }

    pub fn core_id(&self) -> u64 {
        self.core_id
    }

    pub fn environment(&self) -> &Arc<CoreEnvironment> {
        &self.env
    }

    /// Canonical ordered key-value export for log and trace emission.
    pub fn export_as_map(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert("coreId".to_owned(), Value::from(self.core_id));
        map
    }
}

/// [`CoreContext`] extended with the identity of one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointContext {
    core: CoreContext,
    remote_host: String,
    remote_port: u16,
    service_type: ServiceType,
    endpoint_id: u64,
}

impl EndpointContext {
    /// Creates an endpoint context with a fresh process-wide endpoint
    /// id.
    pub fn new(
        core: CoreContext,
        remote_host: impl Into<String>,
        remote_port: u16,
        service_type: ServiceType,
    ) -> Self {
        Self {
            core,
            remote_host: remote_host.into(),
            remote_port,
            service_type,
            endpoint_id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn core(&self) -> &CoreContext {
        &self.core
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn endpoint_id(&self) -> u64 {
        self.endpoint_id
    }

    /// Canonical ordered key-value export for log and trace emission.
    pub fn export_as_map(&self) -> BTreeMap<String, Value> {
        let mut map = self.core.export_as_map();
        map.insert("endpointId".to_owned(), Value::from(self.endpoint_id));
        map.insert("remoteHost".to_owned(), Value::from(self.remote_host.clone()));
        map.insert("remotePort".to_owned(), Value::from(self.remote_port));
        map.insert(
            "serviceType".to_owned(),
            Value::from(self.service_type.ident()),
        );
        map
    }
}

/// [`CoreContext`] extended with per-request metadata.
///
/// The request owns its context; the context reaches back through a
/// weak reference used only to signal cancellation.
#[derive(Debug)]
pub struct RequestContext {
    core: CoreContext,
    request_id: u64,
    /// Nanoseconds from creation to write, written once at dispatch.
    /// Zero means not dispatched yet.
    dispatch_latency_ns: AtomicU64,
    payload: Mutex<Option<BTreeMap<String, Value>>>,
    request: OnceLock<Weak<Request>>,
}

impl RequestContext {
    pub(crate) fn new(core: CoreContext, request_id: u64) -> Self {
        Self {
            core,
            request_id,
            dispatch_latency_ns: AtomicU64::new(0),
            payload: Mutex::new(None),
            request: OnceLock::new(),
        }
    }

    pub(crate) fn attach(&self, request: Weak<Request>) {
        let _ = self.request.set(request);
    }

    pub fn core(&self) -> &CoreContext {
        &self.core
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// The dispatch latency, once the request has been written.
    pub fn dispatch_latency(&self) -> Option<Duration> {
        match self.dispatch_latency_ns.load(Ordering::Acquire) {
            0 => None,
            ns => Some(Duration::from_nanos(ns)),
        }
    }

    pub(crate) fn set_dispatch_latency(&self, latency: Duration) {
        self.dispatch_latency_ns
            .store(latency.as_nanos() as u64, Ordering::Release);
    }

    /// Attaches a custom user payload to the request.
    pub fn set_payload(&self, payload: BTreeMap<String, Value>) {
        *self.payload.lock().expect("payload lock poisoned") = Some(payload);
    }

    /// The custom user payload, if set.
    pub fn payload(&self) -> Option<BTreeMap<String, Value>> {
        self.payload.lock().expect("payload lock poisoned").clone()
    }

    /// Cancels the attached request from anywhere in the code.
    ///
    /// A no-op if the request already completed.
    pub fn cancel(&self) {
        if let Some(request) = self.request.get().and_then(Weak::upgrade) {
            request.cancel(CancellationReason::CancelledViaContext);
        }
    }

    /// Canonical ordered key-value export for log and trace emission.
    pub fn export_as_map(&self) -> BTreeMap<String, Value> {
        let mut map = self.core.export_as_map();
        map.insert("requestId".to_owned(), Value::from(self.request_id));
        if let Some(latency) = self.dispatch_latency() {
            map.insert(
                "dispatchLatencyNs".to_owned(),
                Value::from(latency.as_nanos() as u64),
            );
        }
        if let Some(payload) = self.payload() {
            map.insert(
                "payload".to_owned(),
                Value::Object(payload.into_iter().collect()),
            );
        }
        map
    }
}
