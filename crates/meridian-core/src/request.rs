//! Request and response model.
//!
//! A request carries a single-assignment completion slot: no matter how
//! completion, cancellation, and timeouts race, the outcome is
//! delivered exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::context::{CoreContext, RequestContext};
use crate::error::{CancellationReason, EndpointError};
use crate::service::ServiceType;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Final outcome of a request.
pub type RequestResult = Result<Response, EndpointError>;

type CompletionObserver = Box<dyn FnOnce(&RequestResult) + Send>;

struct Completion {
    sender: Option<oneshot::Sender<RequestResult>>,
    observer: Option<CompletionObserver>,
    done: bool,
}

/// One operation in flight against an endpoint.
///
/// Shared as `Arc<Request>` between the caller (holding the completion
/// receiver), the endpoint driver, and the pipeline correlation
/// handler.
pub struct Request {
    id: u64,
    service_type: ServiceType,
    created_at: Instant,
    deadline: Instant,
    ctx: RequestContext,
    completion: Mutex<Completion>,
    cancelled: AtomicBool,
    retry_attempts: AtomicU32,
}

impl Request {
    /// Creates a request and the receiver its outcome is delivered on.
    pub fn new(
        core: CoreContext,
        service_type: ServiceType,
        timeout: Duration,
    ) -> (Arc<Self>, oneshot::Receiver<RequestResult>) {
        let (tx, rx) = oneshot::channel();
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let created_at = Instant::now();

        let request = Arc::new_cyclic(|weak: &std::sync::Weak<Request>| {
            let ctx = RequestContext::new(core, id);
            ctx.attach(weak.clone());
            Self {
                id,
                service_type,
                created_at,
                deadline: created_at + timeout,
                ctx,
                completion: Mutex::new(Completion {
                    sender: Some(tx),
                    observer: None,
                    done: false,
                }),
                cancelled: AtomicBool::new(false),
                retry_attempts: AtomicU32::new(0),
            }
        });

        (request, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Absolute instant after which the request should be cancelled
    /// with [`CancellationReason::TimedOut`].
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Times this request has been retried on this endpoint.
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.load(Ordering::Relaxed)
    }

    pub fn increment_retry_attempts(&self) -> u32 {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Delivers the final outcome. The first call wins; later calls
    /// are ignored.
    pub fn complete(&self, result: RequestResult) {
        let (sender, observer) = {
            let mut completion = self.completion.lock().expect("completion lock poisoned");
            if completion.done {
                return;
            }
            completion.done = true;
            (completion.sender.take(), completion.observer.take())
        };

        if let Some(observer) = observer {
            observer(&result);
        }
        if let Some(sender) = sender {
            // The caller may have dropped the receiver; the outcome is
            // still considered delivered.
            let _ = sender.send(result);
        }
    }

    /// Sets the cancellation flag and, if the completion slot is still
    /// unsignaled, fails the request with the given reason.
    ///
    /// A no-op once the request completed.
    pub fn cancel(&self, reason: CancellationReason) {
        self.cancelled.store(true, Ordering::Release);
        self.complete(Err(EndpointError::RequestCancelled(reason)));
    }

    /// True iff the completion slot is unsignaled and the request has
    /// not been cancelled.
    pub fn is_active(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        !self.completion.lock().expect("completion lock poisoned").done
    }

    /// Registers a hook invoked once with the final outcome, before
    /// the caller sees it. Returns false if the request already
    /// completed.
    pub(crate) fn set_completion_observer(&self, observer: CompletionObserver) -> bool {
        let mut completion = self.completion.lock().expect("completion lock poisoned");
        if completion.done {
            return false;
        }
        completion.observer = Some(observer);
        true
    }

    /// Stamps the dispatch latency (now minus creation) into the
    /// request context. Called once when the request is written.
    pub(crate) fn stamp_dispatch_latency(&self, now: Instant) {
        self.ctx
            .set_dispatch_latency(now.saturating_duration_since(self.created_at));
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("service_type", &self.service_type)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Response produced by the pipeline codec. Opaque to the core apart
/// from the correlation id and the health classification label.
#[derive(Debug, Clone)]
pub struct Response {
    opaque: u64,
    status: ResponseStatus,
    payload: Vec<u8>,
}

impl Response {
    pub fn new(opaque: u64, status: ResponseStatus, payload: Vec<u8>) -> Self {
        Self {
            opaque,
            status,
            payload,
        }
    }

    /// Correlation id linking back to the request.
    pub fn opaque(&self) -> u64 {
        self.opaque
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Health classification attached by the codec. The core never
/// inspects payloads; this label is all the circuit breaker sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Completed without error.
    Success,
    /// Application-level error that says nothing about server health
    /// (auth failure, not-found). Counts as success for the breaker.
    ApplicationError,
    /// Retryable server-side failure.
    ServerFailure,
    /// Transport-level failure.
    TransportFailure,
}

impl ResponseStatus {
    /// Whether the breaker should count this response as a failure.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ResponseStatus::ServerFailure | ResponseStatus::TransportFailure
        )
    }
}
