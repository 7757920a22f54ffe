//! Consume loop delivering inbound messages to the dispatcher.
//!
//! This module implements the long-running consumer that:
//!
//! - Streams deliveries from an [`inbound`] source
//! - Decodes each body into an [`Envelope`]
//! - Hands every envelope to its own task running the [`Dispatcher`]
//! - Exposes lifecycle hooks for observability and customization
//!
//! The loop only reads from the source. Handler tasks never touch it, and a
//! slow downstream call in one task never delays intake of the next message.
//!
//! The consumer runs until:
//! - The delivery stream ends
//! - The source reports an error
//! - A [`CancellationToken`] is triggered
//!
//! In each case intake stops and handlers already running get a grace period
//! to finish. Handlers still running when it expires are detached, not
//! aborted, and [`Consumer::run`] returns.

use std::{sync::Arc, time::Duration};

use tokio::task::{JoinError, JoinSet};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    Envelope, MailInfo,
    dispatch::{DispatchReport, Dispatcher},
    inbound::{self, Inbound},
};

/// Grace period given to in-flight handlers once intake stops.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker consumer.
///
/// Generic parameters:
/// - `S`: Delivery source
/// - `L`, `M`: Log and mail service stacks of the [`Dispatcher`]
/// - `HK`: Hook implementation for lifecycle events
pub struct Consumer<S, L, M, HK> {
    source: S,
    dispatcher: Dispatcher<L, M>,
    hook: Arc<HK>,
    drain_timeout: Duration,
}

impl<S, L, M> Consumer<S, L, M, DefaultConsumerHook> {
    /// Create a new consumer with the default hook implementation.
    pub fn new(source: S, dispatcher: Dispatcher<L, M>) -> Self {
        Self {
            source,
            dispatcher,
            hook: Arc::new(DefaultConsumerHook),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl<S, L, M, HK> Consumer<S, L, M, HK>
where
    S: inbound::StreamDeliveries + Send,
    L: Service<Envelope> + Clone + Send + 'static,
    L::Future: Send + 'static,
    L::Error: Into<tower::BoxError>,
    M: Service<MailInfo> + Clone + Send + 'static,
    M::Future: Send + 'static,
    M::Error: Into<tower::BoxError>,
    HK: ConsumerHook + 'static,
{
    /// Replace the consumer hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<S, L, M, HK2> {
        Consumer {
            source: self.source,
            dispatcher: self.dispatcher,
            hook: Arc::new(hook),
            drain_timeout: self.drain_timeout,
        }
    }

    /// Set how long `run` waits for in-flight handlers once intake stops.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Run the consume loop.
    ///
    /// The consumer:
    /// - Starts intake on the source
    /// - Decodes each delivery and spawns a handler task for it
    /// - Reaps finished handlers, reporting panics through the hook
    /// - Stops intake on cancellation, stream end, or source error
    ///
    /// Handler tasks are never aborted. Before returning, `run` waits up to
    /// the drain timeout for the ones still in flight and detaches the rest.
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ConsumerRunError> {
        self.hook.on_startup();

        let mut deliveries = self
            .source
            .deliveries()
            .await
            .map_err(|e| ConsumerRunError::source(e.into()))?;

        let mut handlers = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    break Ok(());
                }
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    self.reap(finished);
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(inbound)) => self.spawn_handler(&mut handlers, inbound),
                        Some(Err(err)) => {
                            let err: tower::BoxError = err.into();
                            self.hook.on_receive_error(err.as_ref());
                            break Err(ConsumerRunError::source(err));
                        }
                        None => {
                            self.hook.on_stream_end();
                            break Ok(());
                        }
                    }
                }
            }
        };

        let drain = async {
            while let Some(finished) = handlers.join_next().await {
                self.reap(finished);
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            self.hook.on_drain_timeout(handlers.len());
            handlers.detach_all();
        }

        result
    }

    fn spawn_handler(&self, handlers: &mut JoinSet<DispatchReport>, inbound: Inbound) {
        let envelope = Envelope::decode(&inbound.body);
        self.hook.on_message_received(&inbound, &envelope);

        let dispatcher = self.dispatcher.clone();
        let hook = Arc::clone(&self.hook);
        handlers.spawn(async move {
            let report = dispatcher.dispatch(envelope).await;
            hook.on_dispatched(&report);
            report
        });
    }

    fn reap(&self, finished: Result<DispatchReport, JoinError>) {
        if let Err(err) = finished {
            if err.is_panic() {
                self.hook.on_handler_panic(&err);
            }
        }
    }
}

/// Error returned when the consume loop fails.
#[derive(Debug)]
pub struct ConsumerRunError {
    context: tracing_error::SpanTrace,
    kind: ConsumerRunErrorKind,
}

impl ConsumerRunError {
    fn source(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Source(error),
        }
    }

    pub fn kind(&self) -> &ConsumerRunErrorKind {
        &self.kind
    }
}

/// Classification of consumer runtime errors.
#[derive(Debug)]
pub enum ConsumerRunErrorKind {
    /// Errors originating from the delivery source.
    Source(tower::BoxError),
}

impl std::fmt::Display for ConsumerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerRunErrorKind::Source(err) => writeln!(f, "Source error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerRunErrorKind::Source(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// `on_dispatched` runs on the handler task, every other method on the
/// consume loop.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_message_received(&self, inbound: &Inbound, envelope: &Envelope);
    fn on_dispatched(&self, report: &DispatchReport);
    fn on_handler_panic(&self, error: &JoinError);
    fn on_receive_error(&self, error: &dyn std::error::Error);
    fn on_stream_end(&self);
    fn on_drain_timeout(&self, pending: usize);
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self) {
        tracing::info!("Consumer is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_message_received(&self, inbound: &Inbound, envelope: &Envelope) {
        tracing::info!(routing_key = %inbound.routing_key, ?envelope, "Received a message");
    }

    fn on_dispatched(&self, report: &DispatchReport) {
        if report.is_success() {
            tracing::debug!(kind = %report.kind, "Message dispatched");
        } else {
            tracing::warn!(kind = %report.kind, "Message dispatched with failures");
        }
    }

    fn on_handler_panic(&self, error: &JoinError) {
        tracing::error!(%error, "Message handler panicked");
    }

    fn on_receive_error(&self, error: &dyn std::error::Error) {
        tracing::error!(%error, "Error receiving message");
    }

    fn on_stream_end(&self) {
        tracing::info!("Delivery stream ended");
    }

    fn on_drain_timeout(&self, pending: usize) {
        tracing::warn!(pending, "Handlers still running after drain timeout, detaching");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        dispatch::MailOutcome,
        forward::{Forwarder, InMemory},
    };

    fn pipeline() -> (
        InMemory<Envelope>,
        InMemory<MailInfo>,
        Dispatcher<
            crate::forward::DeliverService<InMemory<Envelope>>,
            crate::forward::DeliverService<InMemory<MailInfo>>,
        >,
    ) {
        let log = InMemory::default();
        let mail = InMemory::default();
        let dispatcher = Dispatcher::new(Forwarder::new(log.clone()), Forwarder::new(mail.clone()));
        (log, mail, dispatcher)
    }

    #[derive(Default)]
    struct Recording {
        kinds: Mutex<Vec<crate::EventKind>>,
        mail_sent: Mutex<usize>,
        panics: Mutex<usize>,
        detached: Mutex<usize>,
    }

    impl ConsumerHook for Arc<Recording> {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {}
        fn on_message_received(&self, _inbound: &Inbound, _envelope: &Envelope) {}
        fn on_dispatched(&self, report: &DispatchReport) {
            self.kinds.lock().unwrap().push(report.kind);
            if matches!(report.mail, MailOutcome::Sent) {
                *self.mail_sent.lock().unwrap() += 1;
            }
        }
        fn on_handler_panic(&self, _error: &JoinError) {
            *self.panics.lock().unwrap() += 1;
        }
        fn on_receive_error(&self, _error: &dyn std::error::Error) {}
        fn on_stream_end(&self) {}
        fn on_drain_timeout(&self, pending: usize) {
            *self.detached.lock().unwrap() += pending;
        }
    }

    /// Log backend whose behaviour depends on the envelope data: `"stall"`
    /// never completes, `"boom"` panics, anything else is recorded.
    #[derive(Clone, Default)]
    struct Scripted {
        delivered: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl crate::forward::Deliver<Envelope> for Scripted {
        type Error = std::io::Error;

        async fn deliver(&mut self, payload: Envelope) -> Result<(), Self::Error> {
            match payload.data.as_str() {
                "stall" => std::future::pending().await,
                "boom" => panic!("log backend blew up"),
                _ => {
                    self.delivered.lock().unwrap().push(payload.data);
                    Ok(())
                }
            }
        }
    }

    fn scripted_pipeline() -> (
        Scripted,
        Dispatcher<
            crate::forward::DeliverService<Scripted>,
            crate::forward::DeliverService<InMemory<MailInfo>>,
        >,
    ) {
        let log = Scripted::default();
        let dispatcher = Dispatcher::new(
            Forwarder::new(log.clone()),
            Forwarder::new(InMemory::default()),
        );
        (log, dispatcher)
    }

    fn log_event(data: &str) -> Inbound {
        Inbound::new("log.INFO", format!(r#"{{"name":"log","data":"{data}"}}"#))
    }

    #[tokio::test]
    async fn every_delivery_is_dispatched_once() {
        let (log, mail, dispatcher) = pipeline();
        let source = inbound::InMemory::from_deliveries([
            Inbound::new("log.INFO", r#"{"name":"log","data":"a"}"#),
            Inbound::new("log.INFO", r#"{"name":"event","data":"b"}"#),
            Inbound::new(
                "log.WARNING",
                r#"{"name":"auth","data":"c","mail":{"to":"x@y.z","subject":"s","message":"m"}}"#,
            ),
            Inbound::new("log.ERROR", "garbage"),
        ]);
        let recording = Arc::new(Recording::default());

        Consumer::new(source, dispatcher)
            .with_hook(Arc::clone(&recording))
            .run(CancellationToken::new())
            .await
            .unwrap();

        let mut logged: Vec<_> = log.delivered().await.into_iter().map(|e| e.data).collect();
        logged.sort();
        assert_eq!(logged, vec!["", "a", "b", "c"]);
        assert_eq!(mail.delivered().await.len(), 1);
        assert_eq!(recording.kinds.lock().unwrap().len(), 4);
        assert_eq!(*recording.mail_sent.lock().unwrap(), 1);
        assert_eq!(*recording.panics.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_forwards_do_not_stop_the_loop() {
        let log = InMemory::<Envelope>::rejecting();
        let mail = InMemory::<MailInfo>::rejecting();
        let dispatcher = Dispatcher::new(Forwarder::new(log.clone()), Forwarder::new(mail));
        let source = inbound::InMemory::from_deliveries(
            (0..10).map(|i| Inbound::new("log.INFO", format!(r#"{{"name":"log","data":"{i}"}}"#))),
        );

        Consumer::new(source, dispatcher)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(log.delivered().await.len(), 10);
    }

    #[tokio::test]
    async fn cancellation_stops_intake() {
        let (_log, _mail, dispatcher) = pipeline();
        let (broker, source) = inbound::InMemory::channel();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Consumer::new(source, dispatcher).run(cancel.clone()));
        cancel.cancel();

        handle.await.unwrap().unwrap();
        drop(broker);
    }

    #[tokio::test]
    async fn stalled_forward_does_not_delay_later_messages() {
        let (log, dispatcher) = scripted_pipeline();
        let (broker, source) = inbound::InMemory::channel();
        let cancel = CancellationToken::new();
        let recording = Arc::new(Recording::default());

        let handle = tokio::spawn(
            Consumer::new(source, dispatcher)
                .with_hook(Arc::clone(&recording))
                .with_drain_timeout(Duration::from_millis(50))
                .run(cancel.clone()),
        );
        broker.send(log_event("stall")).unwrap();
        broker.send(log_event("after")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while log.delivered().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("second message was never forwarded");
        assert_eq!(log.delivered(), vec!["after"]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not return after the drain timeout")
            .unwrap()
            .unwrap();
        assert_eq!(*recording.detached.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn drain_waits_for_handlers_that_finish_in_time() {
        let (log, dispatcher) = scripted_pipeline();
        let source = inbound::InMemory::from_deliveries([log_event("a"), log_event("b")]);
        let recording = Arc::new(Recording::default());

        Consumer::new(source, dispatcher)
            .with_hook(Arc::clone(&recording))
            .with_drain_timeout(Duration::from_secs(5))
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(log.delivered().len(), 2);
        assert_eq!(*recording.detached.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn handler_panic_is_reported_and_intake_continues() {
        let (log, dispatcher) = scripted_pipeline();
        let source = inbound::InMemory::from_deliveries([
            log_event("boom"),
            log_event("one"),
            log_event("two"),
        ]);
        let recording = Arc::new(Recording::default());

        Consumer::new(source, dispatcher)
            .with_hook(Arc::clone(&recording))
            .run(CancellationToken::new())
            .await
            .unwrap();

        let mut delivered = log.delivered();
        delivered.sort();
        assert_eq!(delivered, vec!["one", "two"]);
        assert_eq!(*recording.panics.lock().unwrap(), 1);
        assert_eq!(recording.kinds.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn source_failure_is_fatal() {
        let (_log, _mail, dispatcher) = pipeline();
        let (_broker, mut source) = inbound::InMemory::channel();
        // Intake can only start once.
        let _taken = inbound::StreamDeliveries::deliveries(&mut source).await.unwrap();

        let err = Consumer::new(source, dispatcher)
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), ConsumerRunErrorKind::Source(_)));
    }
}
