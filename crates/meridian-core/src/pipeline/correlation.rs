//! Correlation handler: opaque id to pending request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::CancellationReason;
use crate::request::{Request, RequestResult};

/// Maps in-flight opaque ids to their pending requests.
///
/// Opaque ids are handed out in FIFO insertion order per endpoint, so
/// draining by ascending id fails requests in the order they were
/// written.
#[derive(Debug)]
pub struct CorrelationMap {
    next_opaque: AtomicU64,
    pending: DashMap<u64, Arc<Request>>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self {
            next_opaque: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Registers a request and returns the opaque id the codec should
    /// place on the wire.
    pub fn register(&self, request: Arc<Request>) -> u64 {
        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(opaque, request);
        opaque
    }

    /// Completes the request registered under `opaque`, removing the
    /// entry. Returns false when the id is unknown (already completed,
    /// cancelled, or never registered).
    pub fn complete(&self, opaque: u64, result: RequestResult) -> bool {
        match self.pending.remove(&opaque) {
            Some((_, request)) => {
                request.complete(result);
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `opaque` without completing it. Used when
    /// a request is cancelled from outside the pipeline.
    pub fn forget(&self, opaque: u64) -> Option<Arc<Request>> {
        self.pending.remove(&opaque).map(|(_, request)| request)
    }

    /// Fails every pending request with the given reason, in FIFO
    /// (ascending opaque) order.
    pub fn fail_all(&self, reason: CancellationReason) {
        let mut opaques: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        opaques.sort_unstable();

        for opaque in opaques {
            if let Some((_, request)) = self.pending.remove(&opaque) {
                request.cancel(reason);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for CorrelationMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::CoreConfig;
    use crate::context::{CoreContext, CoreEnvironment};
    use crate::error::EndpointError;
    use crate::request::{Response, ResponseStatus};
    use crate::service::ServiceType;
    use tokio::sync::oneshot;

    fn new_request() -> (Arc<Request>, oneshot::Receiver<RequestResult>) {
        let env = CoreEnvironment::with_default_bus(CoreConfig::default());
        Request::new(
            CoreContext::new(env),
            ServiceType::Query,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn register_and_complete() {
        let map = CorrelationMap::new();
        let (request, rx) = new_request();

        let opaque = map.register(request);
        assert_eq!(map.len(), 1);

        assert!(map.complete(
            opaque,
            Ok(Response::new(opaque, ResponseStatus::Success, b"ok".to_vec()))
        ));
        assert!(map.is_empty());

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.payload(), b"ok");
    }

    #[tokio::test]
    async fn unknown_opaque_is_reported() {
        let map = CorrelationMap::new();
        assert!(!map.complete(99, Ok(Response::new(99, ResponseStatus::Success, vec![]))));
    }

    #[tokio::test]
    async fn fail_all_drains_in_fifo_order() {
        let map = CorrelationMap::new();
        let mut receivers = Vec::new();

        for _ in 0..4 {
            let (request, rx) = new_request();
            map.register(request);
            receivers.push(rx);
        }

        map.fail_all(CancellationReason::ChannelClosedWhileInFlight);
        assert!(map.is_empty());

        for rx in receivers {
            match rx.await.unwrap() {
                Err(EndpointError::RequestCancelled(reason)) => {
                    assert_eq!(reason, CancellationReason::ChannelClosedWhileInFlight);
                }
                other => panic!("expected cancellation, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn forget_leaves_request_untouched() {
        let map = CorrelationMap::new();
        let (request, rx) = new_request();

        let opaque = map.register(request.clone());
        let forgotten = map.forget(opaque).unwrap();
        assert_eq!(forgotten.id(), request.id());
        assert!(forgotten.is_active());
        drop(rx);
    }
}
