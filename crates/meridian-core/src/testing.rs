//! In-process test fixtures: a collecting event bus, a scriptable
//! connector, and a memory pipeline with an inspectable outbound
//! queue.
//!
//! These are real implementations of the core's seams, small enough to
//! reason about in tests and usable from integration tests outside the
//! crate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::context::EndpointContext;
use crate::error::{CancellationReason, EndpointError};
use crate::event::{Event, EventBus, EventKind};
use crate::pipeline::{CorrelationMap, IdleTracker, Pipeline, PipelineInitializer};
use crate::request::{Request, Response, ResponseStatus};
use crate::transport::{Channel, Connector};

/// Event bus that synchronously collects everything published to it.
#[derive(Debug)]
pub struct SimpleEventBus {
    events: Mutex<Vec<Event>>,
    tx: broadcast::Sender<Event>,
}

impl SimpleEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            events: Mutex::new(Vec::new()),
            tx,
        }
    }

    /// Every event published so far, in publish order.
    pub fn published(&self) -> Vec<Event> {
        self.events.lock().expect("event lock poisoned").clone()
    }

    /// The kinds published so far, in publish order.
    pub fn published_kinds(&self) -> Vec<EventKind> {
        self.published().iter().map(|event| event.kind).collect()
    }

    /// How many events of one kind were published.
    pub fn count(&self, kind: EventKind) -> usize {
        self.published()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }
}

impl Default for SimpleEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for SimpleEventBus {
    fn publish(&self, event: Event) {
        self.events
            .lock()
            .expect("event lock poisoned")
            .push(event.clone());
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

/// In-process channel; the byte stream goes nowhere but stays open.
#[derive(Debug)]
pub struct MemoryChannel {
    io: DuplexStream,
    _peer: DuplexStream,
}

impl MemoryChannel {
    pub fn new() -> Self {
        let (io, peer) = tokio::io::duplex(4096);
        Self { io, _peer: peer }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MemoryChannel {}

impl AsyncRead for MemoryChannel {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryChannel {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Gate a [`StubConnector`] waits on until the test releases it.
#[derive(Debug, Default)]
pub struct ConnectGate {
    open: AtomicBool,
    notify: Notify,
}

impl ConnectGate {
    /// Lets the in-flight (and any later) connect attempt complete
    /// with a fresh channel.
    pub fn complete(&self) {
        self.open.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

enum StubMode {
    /// Every attempt succeeds after the delay.
    Ready { delay: Duration },
    /// The first `remaining` attempts fail immediately, later ones
    /// succeed after the delay.
    FailThenReady { remaining: AtomicU32, delay: Duration },
    /// Attempts block until the gate opens.
    Gated { gate: Arc<ConnectGate> },
}

/// Scriptable channel supplier standing in for a real transport.
pub struct StubConnector {
    mode: StubMode,
    attempts: AtomicU32,
}

impl StubConnector {
    /// Connector whose attempts succeed after `delay`.
    pub fn ready(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode: StubMode::Ready { delay },
            attempts: AtomicU32::new(0),
        })
    }

    /// Connector whose first `failures` attempts fail immediately and
    /// later ones succeed after `delay`.
    pub fn fail_then_ready(failures: u32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode: StubMode::FailThenReady {
                remaining: AtomicU32::new(failures),
                delay,
            },
            attempts: AtomicU32::new(0),
        })
    }

    /// Connector whose attempts block until the returned gate is
    /// completed.
    pub fn gated() -> (Arc<Self>, Arc<ConnectGate>) {
        let gate = Arc::new(ConnectGate::default());
        let connector = Arc::new(Self {
            mode: StubMode::Gated { gate: gate.clone() },
            attempts: AtomicU32::new(0),
        });
        (connector, gate)
    }

    /// How many connect attempts have started.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self) -> Result<Box<dyn Channel>, EndpointError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        match &self.mode {
            StubMode::Ready { delay } => {
                tokio::time::sleep(*delay).await;
                Ok(Box::new(MemoryChannel::new()))
            }
            StubMode::FailThenReady { remaining, delay } => {
                let left = remaining
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                        left.checked_sub(1)
                    })
                    .is_ok();
                if left {
                    Err(EndpointError::ConnectFailed(
                        "could not connect for some reason".into(),
                    ))
                } else {
                    tokio::time::sleep(*delay).await;
                    Ok(Box::new(MemoryChannel::new()))
                }
            }
            StubMode::Gated { gate } => {
                loop {
                    let notified = gate.notify.notified();
                    tokio::pin!(notified);
                    // Register before checking the flag so a wake
                    // between the two cannot be lost.
                    let _ = notified.as_mut().enable();
                    if gate.open.load(Ordering::Acquire) {
                        return Ok(Box::new(MemoryChannel::new()));
                    }
                    notified.await;
                }
            }
        }
    }
}

/// In-process pipeline with an inspectable outbound queue.
///
/// Requests written to it are registered with a real correlation map;
/// tests read them back, inject responses, or trigger channel
/// inactivity.
pub struct MemoryPipeline {
    outbound: Mutex<VecDeque<(u64, Arc<Request>)>>,
    correlation: CorrelationMap,
    closed_token: CancellationToken,
    close_error: Option<String>,
    capacity: usize,
    idle: Option<IdleTracker>,
    _channel: Mutex<Option<Box<dyn Channel>>>,
}

impl MemoryPipeline {
    fn new(
        channel: Box<dyn Channel>,
        capacity: usize,
        close_error: Option<String>,
        idle: Option<IdleTracker>,
    ) -> Self {
        Self {
            outbound: Mutex::new(VecDeque::new()),
            correlation: CorrelationMap::new(),
            closed_token: CancellationToken::new(),
            close_error,
            capacity,
            idle,
            _channel: Mutex::new(Some(channel)),
        }
    }

    /// Pops the next outbound request, as a remote would consume it.
    pub fn read_outbound(&self) -> Option<Arc<Request>> {
        self.outbound
            .lock()
            .expect("outbound lock poisoned")
            .pop_front()
            .map(|(_, request)| request)
    }

    /// Completes the next outbound request with a codec-labeled
    /// response. Returns false when nothing is outbound.
    pub fn complete_next(&self, status: ResponseStatus, payload: Vec<u8>) -> bool {
        let Some((opaque, _)) = self
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .pop_front()
        else {
            return false;
        };
        self.correlation
            .complete(opaque, Ok(Response::new(opaque, status, payload)))
    }

    /// Number of correlated requests still awaiting a response.
    pub fn pending(&self) -> usize {
        self.correlation.len()
    }

    /// Simulates the channel dropping out from under the endpoint.
    pub fn trigger_inactive(&self) {
        self.correlation
            .fail_all(CancellationReason::ChannelClosedWhileInFlight);
        self.closed_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed_token.is_cancelled()
    }

    async fn do_write(&self, request: Arc<Request>) -> Result<(), EndpointError> {
        if self.closed_token.is_cancelled() {
            return Err(EndpointError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "channel closed",
            )));
        }
        if let Some(idle) = &self.idle {
            idle.touch();
        }
        let opaque = self.correlation.register(request.clone());
        self.outbound
            .lock()
            .expect("outbound lock poisoned")
            .push_back((opaque, request));
        Ok(())
    }

    async fn do_close(&self) -> Result<(), EndpointError> {
        self.correlation
            .fail_all(CancellationReason::ChannelClosedWhileInFlight);
        self.closed_token.cancel();
        self._channel.lock().expect("channel lock poisoned").take();
        match &self.close_error {
            Some(cause) => Err(EndpointError::DisconnectFailed(cause.clone())),
            None => Ok(()),
        }
    }

    fn do_free(&self) -> bool {
        if self.closed_token.is_cancelled() {
            return false;
        }
        self.outbound.lock().expect("outbound lock poisoned").len() < self.capacity
    }

    async fn do_closed(&self) {
        match &self.idle {
            Some(idle) => {
                tokio::select! {
                    _ = self.closed_token.cancelled() => {}
                    _ = idle.idle() => {
                        self.correlation
                            .fail_all(CancellationReason::ChannelClosedWhileInFlight);
                        self.closed_token.cancel();
                    }
                }
            }
            None => self.closed_token.cancelled().await,
        }
    }
}

struct SharedMemoryPipeline(Arc<MemoryPipeline>);

#[async_trait]
impl Pipeline for SharedMemoryPipeline {
    async fn write(&self, request: Arc<Request>) -> Result<(), EndpointError> {
        self.0.do_write(request).await
    }

    async fn close(&self) -> Result<(), EndpointError> {
        self.0.do_close().await
    }

    fn free(&self) -> bool {
        self.0.do_free()
    }

    async fn closed(&self) {
        self.0.do_closed().await
    }
}

/// Initializer that installs a [`MemoryPipeline`] on every connect and
/// keeps handles to the pipelines it built.
pub struct MemoryPipelineInitializer {
    pipelines: Mutex<Vec<Arc<MemoryPipeline>>>,
    close_error: Option<String>,
    idle_timeout: Option<Duration>,
    capacity: usize,
}

impl MemoryPipelineInitializer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pipelines: Mutex::new(Vec::new()),
            close_error: None,
            idle_timeout: None,
            capacity: 1024,
        })
    }

    /// Pipelines whose `close` fails with the given cause.
    pub fn failing_close(cause: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pipelines: Mutex::new(Vec::new()),
            close_error: Some(cause.into()),
            idle_timeout: None,
            capacity: 1024,
        })
    }

    /// Pipelines that report the channel inactive after a quiet
    /// period.
    pub fn with_idle_watchdog(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pipelines: Mutex::new(Vec::new()),
            close_error: None,
            idle_timeout: Some(timeout),
            capacity: 1024,
        })
    }

    /// Pipelines with a bounded outbound queue, for `free()` tests.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            pipelines: Mutex::new(Vec::new()),
            close_error: None,
            idle_timeout: None,
            capacity,
        })
    }

    /// The most recently installed pipeline.
    pub fn latest(&self) -> Option<Arc<MemoryPipeline>> {
        self.pipelines
            .lock()
            .expect("pipeline list lock poisoned")
            .last()
            .cloned()
    }

    /// How many pipelines have been installed (one per physical
    /// connect).
    pub fn installed(&self) -> usize {
        self.pipelines
            .lock()
            .expect("pipeline list lock poisoned")
            .len()
    }
}

#[async_trait]
impl PipelineInitializer for MemoryPipelineInitializer {
    async fn init(
        &self,
        channel: Box<dyn Channel>,
        _ctx: &EndpointContext,
    ) -> Result<Box<dyn Pipeline>, EndpointError> {
        let pipeline = Arc::new(MemoryPipeline::new(
            channel,
            self.capacity,
            self.close_error.clone(),
            self.idle_timeout.map(IdleTracker::new),
        ));
        self.pipelines
            .lock()
            .expect("pipeline list lock poisoned")
            .push(pipeline.clone());
        Ok(Box::new(SharedMemoryPipeline(pipeline)))
    }
}

/// Polls a condition once per millisecond of (possibly virtual) time
/// until it holds.
///
/// # Panics
///
/// Panics when the condition does not hold within thirty seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..30_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met within the polling budget");
}
