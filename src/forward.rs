//! Downstream forwarders and delivery backends.
//!
//! A forwarder takes a payload produced by the dispatcher ([`Envelope`] for
//! the log service, [`MailInfo`] for the mail service) and delivers it to a
//! downstream collaborator.
//!
//! Forwarders are built around Tower's `Service` abstraction so encoding and
//! delivery stay separate and middleware can be stacked in between:
//!
//! ```rust
//! use listen_service::forward::{Forwarder, InMemory, RawPayload, layers::PrettyJsonLayer};
//!
//! let backend = InMemory::<RawPayload>::default();
//! let forwarder = Forwarder::new(backend.clone()).layer(PrettyJsonLayer);
//! # let _ = forwarder;
//! ```
//!
//! ## Key components
//!
//! - [`Forwarder`]: Wrapper that drives a service to completion for one payload
//! - [`DeliverService`]: Adapter from a [`Deliver`] backend to a Tower service
//! - [`Deliver`]: Trait implemented by concrete backends
//! - [`ForwardError`]: Unified error type with tracing context
//!
//! [`Envelope`]: crate::Envelope
//! [`MailInfo`]: crate::MailInfo

#[cfg(feature = "http")]
pub mod http;

mod inmemory;

pub mod layers;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

pub use inmemory::InMemory;

/// Tower-compatible forwarder.
///
/// `Forwarder` wraps an underlying Tower `Service` and:
///
/// - Normalizes errors into [`ForwardError`]
/// - Supports Tower middleware via layers
/// - Provides the [`forward`](Forwarder::forward) API used by the dispatcher
///
/// Typically constructed from a concrete [`Deliver`] backend and layered with
/// [`PrettyJsonLayer`](layers::PrettyJsonLayer).
#[derive(Clone)]
pub struct Forwarder<S> {
    service: S,
}

impl<D> Forwarder<DeliverService<D>> {
    /// Create a new forwarder from a concrete delivery backend.
    pub fn new(backend: D) -> Self {
        Self {
            service: DeliverService::new(backend),
        }
    }
}

impl<S> Forwarder<S> {
    /// Apply a Tower layer to the forwarder.
    pub fn layer<L>(self, layer: L) -> Forwarder<L::Service>
    where
        L: tower::Layer<S>,
    {
        Forwarder {
            service: layer.layer(self.service),
        }
    }

    /// Forward one payload.
    ///
    /// The service is cloned up front so the returned future owns everything
    /// it needs and can be driven on any task.
    pub fn forward<M>(
        &self,
        payload: M,
    ) -> impl Future<Output = Result<(), ForwardError>> + Send + 'static + use<M, S>
    where
        M: Send + 'static,
        S: Service<M> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let service = self.service.clone();
        async move {
            service
                .oneshot(payload)
                .await
                .map_err(|e| ForwardError::from_boxed(e.into()))?;
            Ok(())
        }
    }
}

/// Error returned by forwarding operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct ForwardError {
    context: SpanTrace,
    kind: ForwardErrorKind,
}

/// Forward errors kind.
#[derive(Debug)]
pub enum ForwardErrorKind {
    /// The payload could not be encoded.
    Encode(tower::BoxError),
    /// The backend failed to deliver the payload.
    Delivery(tower::BoxError),
}

impl ForwardError {
    /// Create a delivery-related forward error.
    pub fn delivery(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ForwardErrorKind::Delivery(err),
        }
    }

    /// Create an encoding-related forward error.
    pub fn encode(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ForwardErrorKind::Encode(err),
        }
    }

    fn from_boxed(err: tower::BoxError) -> Self {
        if err.is::<serde_json::Error>() {
            Self::encode(err)
        } else {
            Self::delivery(err)
        }
    }

    pub fn kind(&self) -> &ForwardErrorKind {
        &self.kind
    }

    /// Status code of a response that reached the collaborator but was not
    /// accepted. `None` for every other failure.
    #[cfg(feature = "http")]
    pub fn unexpected_status(&self) -> Option<u16> {
        match &self.kind {
            ForwardErrorKind::Delivery(err) => err
                .downcast_ref::<http::HttpError>()
                .and_then(http::HttpError::unexpected_status),
            ForwardErrorKind::Encode(_) => None,
        }
    }
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ForwardErrorKind::Encode(err) => writeln!(f, "Encode error: {err}"),
            ForwardErrorKind::Delivery(err) => writeln!(f, "Delivery error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ForwardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ForwardErrorKind::Encode(err) => Some(err.as_ref()),
            ForwardErrorKind::Delivery(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Deliver`] backend.
#[derive(Clone)]
pub struct DeliverService<D> {
    backend: D,
}

impl<D> DeliverService<D> {
    /// Create a new service from a backend.
    pub fn new(backend: D) -> Self {
        Self { backend }
    }
}

impl<M, D> Service<M> for DeliverService<D>
where
    M: Send + 'static,
    D: Deliver<M> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: M) -> Self::Future {
        let mut backend = self.backend.clone();
        Box::pin(async move {
            backend.deliver(req).await.map_err(Into::<tower::BoxError>::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete delivery backends.
///
/// A backend is responsible for handing a payload to an external system
/// (e.g. an HTTP collaborator, or an in-memory recorder in tests).
#[async_trait::async_trait]
pub trait Deliver<M> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Deliver a payload.
    async fn deliver(&mut self, payload: M) -> Result<(), Self::Error>;
}

/// Wrapper type for encoded payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}
