use std::{future::Future, pin::Pin};

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tower::{Layer, Service};

use crate::forward::RawPayload;

/// Tower `Service` wrapper that encodes payloads as indented JSON.
///
/// Any payload implementing `serde::Serialize` is turned into a
/// [`RawPayload`] holding a JSON document indented with tabs, then passed to
/// the inner service. This is the body format the log and mail services
/// expect.
#[derive(Clone)]
pub struct PrettyJsonService<T> {
    inner: T,
}

impl<T, M> Service<M> for PrettyJsonService<T>
where
    M: Serialize + Send + 'static,
    T: Service<RawPayload> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: M) -> Self::Future {
        // Take the instance that was driven ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let bytes = to_tab_indented(&req).map_err(tower::BoxError::from)?;
            inner
                .call(bytes.into())
                .await
                .map_err(Into::<tower::BoxError>::into)
        })
    }
}

/// Serialize `value` with one tab per indentation level.
pub(crate) fn to_tab_indented<M: Serialize + ?Sized>(value: &M) -> serde_json::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(128);
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut bytes, PrettyFormatter::with_indent(b"\t"));
    value.serialize(&mut serializer)?;
    Ok(bytes)
}

/// Tower `Layer` that applies [`PrettyJsonService`] to a service stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrettyJsonLayer;

impl<S> Layer<S> for PrettyJsonLayer {
    type Service = PrettyJsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        PrettyJsonService { inner: service }
    }
}
