//! The endpoint driver task.
//!
//! One driver per endpoint owns every lifecycle transition. Callers
//! post commands; the driver suspends only on channel readiness,
//! backoff sleeps, write completion, and close completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::error::EndpointError;
use crate::event::{Event, EventBus};
use crate::pipeline::{Pipeline, PipelineInitializer};
use crate::request::Request;
use crate::retry::Backoff;
use crate::transport::Connector;

use super::{
    Command, Shared, LIFECYCLE_CONNECTED, LIFECYCLE_CONNECTING, LIFECYCLE_DISCONNECTED,
    LIFECYCLE_DISCONNECTING,
};

enum ConnectOutcome {
    /// Channel ready, pipeline installed.
    Connected(Box<dyn Pipeline>),
    /// Disconnect was requested while connecting; the phase ended
    /// without a usable channel.
    Stopped,
    /// The driver is shutting down.
    Shutdown,
}

enum ServeOutcome {
    /// The channel went inactive; reconnect.
    Reconnect,
    /// An explicit disconnect completed.
    Disconnected,
    /// The driver is shutting down.
    Shutdown,
}

pub(super) struct Driver {
    shared: Arc<Shared>,
    config: CoreConfig,
    connector: Arc<dyn Connector>,
    initializer: Arc<dyn PipelineInitializer>,
    bus: Arc<dyn EventBus>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    backoff: Backoff,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        shared: Arc<Shared>,
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        initializer: Arc<dyn PipelineInitializer>,
        bus: Arc<dyn EventBus>,
        commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
        backoff: Backoff,
    ) -> Self {
        Self {
            shared,
            config,
            connector,
            initializer,
            bus,
            commands,
            shutdown,
            backoff,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => return,
                },
            };

            match command {
                Command::Connect => loop {
                    match self.connect_phase().await {
                        ConnectOutcome::Connected(pipeline) => {
                            match self.serve_phase(pipeline).await {
                                ServeOutcome::Reconnect => continue,
                                ServeOutcome::Disconnected => break,
                                ServeOutcome::Shutdown => return,
                            }
                        }
                        ConnectOutcome::Stopped => break,
                        ConnectOutcome::Shutdown => return,
                    }
                },
                // Already disconnected; nothing to do.
                Command::Disconnect => {}
                Command::Send(request) => self.reject_send(request),
            }
        }
    }

    /// Drives connect attempts with backoff until a channel is ready
    /// or a disconnect wins.
    ///
    /// A disconnect commanded while an attempt is in flight does not
    /// cancel the attempt; it is resolved when the attempt settles. A
    /// late-arriving channel is closed and ignored, a failed attempt
    /// turns into an abort instead of another retry.
    async fn connect_phase(&mut self) -> ConnectOutcome {
        self.shared.set_lifecycle(LIFECYCLE_CONNECTING);
        self.backoff.reset();
        let phase_start = Instant::now();
        let mut disconnect_requested = false;

        tracing::debug!(
            endpoint_id = self.shared.ctx().endpoint_id(),
            "Endpoint connecting"
        );

        loop {
            let attempt_start = Instant::now();
            let connector = self.connector.clone();
            let attempt = timeout(self.config.connect_timeout, async move {
                connector.connect().await
            });
            tokio::pin!(attempt);

            let settled = loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return ConnectOutcome::Shutdown,
                    settled = &mut attempt => break settled,
                    command = self.commands.recv() => match command {
                        Some(Command::Disconnect) => disconnect_requested = true,
                        Some(Command::Connect) => {}
                        Some(Command::Send(request)) => self.reject_send(request),
                        None => return ConnectOutcome::Shutdown,
                    }
                }
            };
            let attempt_elapsed = attempt_start.elapsed();

            let attempt_result = match settled {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(EndpointError::ConnectTimedOut(self.config.connect_timeout)),
            };

            let failure = match attempt_result {
                Ok(channel) => {
                    if disconnect_requested {
                        // The channel arrived after disconnect; close
                        // it without ever entering service.
                        drop(channel);
                        self.publish(Event::endpoint_connection_ignored(self.export()));
                        self.shared.set_lifecycle(LIFECYCLE_DISCONNECTED);
                        self.publish(Event::endpoint_disconnected(None, self.export()));
                        return ConnectOutcome::Stopped;
                    }
                    match self.initializer.init(channel, self.shared.ctx()).await {
                        Ok(pipeline) => {
                            self.shared.set_lifecycle(LIFECYCLE_CONNECTED);
                            self.publish(Event::endpoint_connected(
                                attempt_start.elapsed(),
                                self.export(),
                            ));
                            tracing::debug!(
                                endpoint_id = self.shared.ctx().endpoint_id(),
                                "Endpoint connected"
                            );
                            return ConnectOutcome::Connected(pipeline);
                        }
                        Err(error) => error,
                    }
                }
                Err(error) => error,
            };

            if disconnect_requested {
                self.publish(Event::endpoint_connection_aborted(
                    phase_start.elapsed(),
                    self.export(),
                ));
                self.shared.set_lifecycle(LIFECYCLE_DISCONNECTED);
                return ConnectOutcome::Stopped;
            }

            self.publish(Event::endpoint_connection_failed(
                attempt_elapsed,
                &failure,
                self.export(),
            ));
            tracing::debug!(
                endpoint_id = self.shared.ctx().endpoint_id(),
                error = %failure,
                "Endpoint connect attempt failed"
            );

            let delay = self.backoff.next_delay();
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return ConnectOutcome::Shutdown,
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(Command::Disconnect) => {
                            self.publish(Event::endpoint_connection_aborted(
                                phase_start.elapsed(),
                                self.export(),
                            ));
                            self.shared.set_lifecycle(LIFECYCLE_DISCONNECTED);
                            return ConnectOutcome::Stopped;
                        }
                        Some(Command::Connect) => {}
                        Some(Command::Send(request)) => self.reject_send(request),
                        None => return ConnectOutcome::Shutdown,
                    }
                }
            }
        }
    }

    /// Serves a connected channel until it goes inactive, a disconnect
    /// is commanded, or the driver shuts down.
    async fn serve_phase(&mut self, pipeline: Box<dyn Pipeline>) -> ServeOutcome {
        let pipeline: Arc<dyn Pipeline> = Arc::from(pipeline);
        self.shared.set_pipeline(Some(pipeline.clone()));
        let connected_at = Instant::now();

        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = timeout(self.config.disconnect_timeout, pipeline.close()).await;
                    break ServeOutcome::Shutdown;
                }
                _ = pipeline.closed() => {
                    self.publish(Event::endpoint_disconnected(
                        Some(connected_at.elapsed()),
                        self.export(),
                    ));
                    tracing::debug!(
                        endpoint_id = self.shared.ctx().endpoint_id(),
                        "Endpoint channel went inactive, reconnecting"
                    );
                    break ServeOutcome::Reconnect;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Disconnect) => {
                        self.shared.set_lifecycle(LIFECYCLE_DISCONNECTING);
                        let closed =
                            timeout(self.config.disconnect_timeout, pipeline.close()).await;
                        match closed {
                            Ok(Ok(())) => self.publish(Event::endpoint_disconnected(
                                Some(connected_at.elapsed()),
                                self.export(),
                            )),
                            Ok(Err(error)) => {
                                tracing::warn!(
                                    endpoint_id = self.shared.ctx().endpoint_id(),
                                    error = %error,
                                    "Endpoint disconnect failed"
                                );
                                self.publish(Event::endpoint_disconnection_failed(
                                    &error,
                                    self.export(),
                                ));
                            }
                            Err(_) => {
                                let error = EndpointError::DisconnectTimedOut(
                                    self.config.disconnect_timeout,
                                );
                                self.publish(Event::endpoint_disconnection_failed(
                                    &error,
                                    self.export(),
                                ));
                            }
                        }
                        self.shared.set_lifecycle(LIFECYCLE_DISCONNECTED);
                        break ServeOutcome::Disconnected;
                    }
                    // Already connected; idempotent.
                    Some(Command::Connect) => {}
                    Some(Command::Send(request)) => self.dispatch(request, &pipeline).await,
                    None => {
                        let _ = timeout(self.config.disconnect_timeout, pipeline.close()).await;
                        break ServeOutcome::Shutdown;
                    }
                }
            }
        };

        self.shared.set_pipeline(None);
        outcome
    }

    /// Writes one accepted request into the pipeline and wires the
    /// breaker to its outcome.
    async fn dispatch(&self, request: Arc<Request>, pipeline: &Arc<dyn Pipeline>) {
        // Cancellation may have won between acceptance and dispatch.
        if !request.is_active() {
            self.shared.breaker().abort_probe();
            return;
        }

        let initializer = self.initializer.clone();
        let shared = self.shared.clone();
        let observed = request.set_completion_observer(Box::new(move |result| {
            let failure = match result {
                Ok(response) => initializer.is_transport_failure(response),
                Err(error) => error.is_transport_failure(),
            };
            if failure {
                shared.breaker().track_failure();
            } else {
                shared.breaker().track_success();
            }
        }));
        if !observed {
            self.shared.breaker().abort_probe();
            return;
        }

        request.stamp_dispatch_latency(Instant::now());

        if let Err(error) = pipeline.write(request.clone()).await {
            request.complete(Err(error));
        }
    }

    /// Fails a request that raced past the `send` gate while the
    /// endpoint was leaving the connected state.
    fn reject_send(&self, request: Arc<Request>) {
        request.complete(Err(EndpointError::NotAvailable {
            state: self.shared.state(),
        }));
    }

    fn export(&self) -> BTreeMap<String, serde_json::Value> {
        self.shared.ctx().export_as_map()
    }

    fn publish(&self, event: Event) {
        self.bus.publish(event);
    }
}
