//! Publish bridge between a single-threaded VU and the MQTT transport
//!
//! A publish without handlers is synchronous: the owning thread blocks until
//! the broker acknowledges or the timeout passes, and any failure is both
//! raised on the VU and returned. A publish with at least one handler is
//! asynchronous: a callback slot is reserved on the VU, the wait happens in a
//! tokio task, and exactly one job carrying the outcome is handed back to the
//! VU's event loop. Metrics and handlers always run on the owning thread.
//!
//! Timeouts bound the wait only. A publish that times out is not cancelled
//! in the transport; if its acknowledgment shows up later nobody is waiting
//! for it any more and it is dropped.

pub mod event;
pub mod request;
pub mod stats;

pub use event::{ErrorEvent, FailureReason, PublishEvent, PublishOutcome};
pub use request::{wait_duration, PublishRequest, MAX_TIMEOUT_MILLIS};
pub use stats::MqttMetrics;

use crate::error::{HandlerError, PublishError, PublishResult};
use crate::publish_span;
use crate::transport::PublishClient;
use crate::vu::Vu;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn, Instrument};

pub type SuccessHandler = Box<dyn FnOnce(PublishEvent) -> Result<(), HandlerError> + Send>;
pub type FailureHandler = Box<dyn FnOnce(ErrorEvent) -> Result<(), HandlerError> + Send>;

/// Optional completion handlers; supplying either makes the publish async
#[derive(Default)]
pub struct PublishHandlers {
    on_success: Option<SuccessHandler>,
    on_failure: Option<FailureHandler>,
}

impl PublishHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(PublishEvent) -> Result<(), HandlerError> + Send + 'static,
    {
        self.on_success = Some(Box::new(handler));
        self
    }

    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(ErrorEvent) -> Result<(), HandlerError> + Send + 'static,
    {
        self.on_failure = Some(Box::new(handler));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_success.is_none() && self.on_failure.is_none()
    }

    /// Invoke the handler matching `outcome`, if one was supplied
    fn dispatch(self, outcome: PublishOutcome) -> PublishResult<()> {
        match outcome {
            PublishOutcome::Success { topic } => match self.on_success {
                Some(handler) => handler(PublishEvent::new(topic)).map_err(PublishError::handler),
                None => Ok(()),
            },
            PublishOutcome::Failure { reason } => match self.on_failure {
                Some(handler) => {
                    handler(ErrorEvent::new(reason.message())).map_err(PublishError::handler)
                }
                None => Ok(()),
            },
        }
    }
}

impl std::fmt::Debug for PublishHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishHandlers")
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Publishes on behalf of one VU
pub struct Publisher {
    client: Arc<dyn PublishClient>,
    metrics: Arc<MqttMetrics>,
    runtime: Handle,
    state_unavailable: Arc<AtomicUsize>,
}

impl Publisher {
    /// `runtime` runs the background waits and must not be driven by the
    /// VU's own thread.
    ///
    /// A current-thread runtime is rejected: nothing would drive its timers
    /// or spawned tasks while the VU thread waits, so no wait could ever end.
    pub fn new(
        client: Arc<dyn PublishClient>,
        metrics: MqttMetrics,
        runtime: Handle,
    ) -> PublishResult<Self> {
        let flavor = runtime.runtime_flavor();
        if flavor != RuntimeFlavor::MultiThread {
            return Err(PublishError::UnsupportedRuntime {
                flavor: format!("{flavor:?}"),
            });
        }

        Ok(Self {
            client,
            metrics: Arc::new(metrics),
            runtime,
            state_unavailable: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn metrics(&self) -> &MqttMetrics {
        &self.metrics
    }

    /// Successful publishes whose samples were skipped with
    /// [`PublishError::StateUnavailable`] because the VU was already torn down
    pub fn state_unavailable_count(&self) -> usize {
        self.state_unavailable.load(Ordering::SeqCst)
    }

    /// Publish `request`, synchronously when `handlers` is empty.
    ///
    /// Must be called from the VU's owning thread, outside any async context.
    pub fn publish(
        &self,
        vu: &Vu,
        request: PublishRequest,
        handlers: PublishHandlers,
    ) -> PublishResult<()> {
        if handlers.is_empty() {
            self.publish_sync(vu, &request)
        } else {
            self.publish_async(vu, request, handlers)
        }
    }

    fn publish_sync(&self, vu: &Vu, request: &PublishRequest) -> PublishResult<()> {
        let span = publish_span!(topic = %request.topic(), qos = ?request.qos(), mode = "sync");
        let _entered = span.enter();
        debug!("Publishing");

        match self.send_sync(request) {
            Ok(()) => {
                debug!("Publish acknowledged");
                record_sent(
                    &self.metrics,
                    &self.state_unavailable,
                    vu,
                    request.payload().len(),
                );
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "Publish failed");
                vu.throw(error.clone());
                Err(error)
            }
        }
    }

    fn send_sync(&self, request: &PublishRequest) -> PublishResult<()> {
        if !self.client.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let timeout = wait_duration(request.timeout_millis())?;

        self.runtime
            .block_on(send_and_wait(self.client.as_ref(), request, timeout))
            .map_err(PublishError::from)
    }

    fn publish_async(
        &self,
        vu: &Vu,
        request: PublishRequest,
        handlers: PublishHandlers,
    ) -> PublishResult<()> {
        let span = publish_span!(topic = %request.topic(), qos = ?request.qos(), mode = "async");
        let _entered = span.enter();

        // An unusable timeout fails the call itself, before any work starts
        let timeout = match wait_duration(request.timeout_millis()) {
            Ok(timeout) => timeout,
            Err(error) => {
                warn!(error = %error, "Rejecting publish");
                vu.throw(error.clone());
                return Err(error);
            }
        };

        let slot = vu.register_callback();
        let client = self.client.clone();
        let metrics = self.metrics.clone();
        let state_unavailable = self.state_unavailable.clone();
        debug!(slot = slot.id(), "Publishing in background");

        self.runtime.spawn(
            async move {
                let outcome = resolve(client.as_ref(), &request, timeout).await;
                match &outcome {
                    PublishOutcome::Success { .. } => debug!("Publish acknowledged"),
                    PublishOutcome::Failure { reason } => {
                        warn!(reason = %reason.message(), "Publish failed")
                    }
                }

                let payload_len = request.payload().len();
                slot.deliver(Box::new(move |vu: &Vu| {
                    if outcome.is_success() {
                        record_sent(&metrics, &state_unavailable, vu, payload_len);
                    }
                    handlers.dispatch(outcome)
                }));
            }
            .instrument(span.clone()),
        );

        Ok(())
    }
}

/// Full background sequence: connection check, publish, bounded wait
async fn resolve(
    client: &dyn PublishClient,
    request: &PublishRequest,
    timeout: Duration,
) -> PublishOutcome {
    if !client.is_connected() {
        return PublishOutcome::failure(FailureReason::NotConnected);
    }

    match send_and_wait(client, request, timeout).await {
        Ok(()) => PublishOutcome::Success {
            topic: request.topic().to_string(),
        },
        Err(reason) => PublishOutcome::failure(reason),
    }
}

async fn send_and_wait(
    client: &dyn PublishClient,
    request: &PublishRequest,
    timeout: Duration,
) -> Result<(), FailureReason> {
    let mut token = client.publish(
        request.topic(),
        request.qos(),
        request.retain(),
        request.payload().clone(),
    );

    if !token.wait_timeout(timeout).await {
        return Err(FailureReason::Timeout);
    }
    match token.error() {
        Some(message) => Err(FailureReason::ProtocolError(message)),
        None => Ok(()),
    }
}

/// A torn down VU only loses the samples, never the publish result
fn record_sent(
    metrics: &MqttMetrics,
    state_unavailable: &AtomicUsize,
    vu: &Vu,
    payload_len: usize,
) {
    if let Err(error) = metrics.push_sent(vu, payload_len) {
        if matches!(error, PublishError::StateUnavailable) {
            state_unavailable.fetch_add(1, Ordering::SeqCst);
        }
        warn!(error = %error, "Skipping publish metrics");
    }
}
