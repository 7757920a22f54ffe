use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use tracing_error::SpanTrace;

use crate::forward::{Deliver, RawPayload};

/// Endpoint of the log service.
pub const LOG_SERVICE_URL: &str = "http://log-service:8000/log";

/// Endpoint of the mail service.
pub const MAIL_SERVICE_URL: &str = "http://mail-service:8000/send";

/// HTTP delivery backend.
///
/// Posts an encoded payload to a fixed collaborator URL with
/// `Content-Type: application/json`. The delivery succeeds only when the
/// collaborator answers `202 Accepted`; the response body is drained and
/// discarded.
///
/// The client keeps reqwest's defaults, so no request timeout is applied.
///
/// ## Mapping
///
/// - `RawPayload` → request body
/// - transport failure → [`HttpErrorKind::Request`]
/// - any status other than 202 → [`HttpErrorKind::UnexpectedStatus`]
#[derive(Clone, Debug)]
pub struct Http {
    client: reqwest::Client,
    url: Arc<str>,
}

impl Http {
    /// Create a backend posting to `url` with a fresh client.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    /// Create a backend posting to `url` through an existing client.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: Arc::from(url.into()),
        }
    }

    /// Backend for the log service.
    pub fn log_service() -> Self {
        Self::new(LOG_SERVICE_URL)
    }

    /// Backend for the mail service.
    pub fn mail_service() -> Self {
        Self::new(MAIL_SERVICE_URL)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Deliver<RawPayload> for Http {
    type Error = HttpError;

    #[tracing::instrument(skip_all, fields(url = %self.url))]
    async fn deliver(&mut self, payload: RawPayload) -> Result<(), Self::Error> {
        let response = self
            .client
            .post(&*self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.into_inner())
            .send()
            .await
            .map_err(|e| HttpError::request(&self.url, e))?;

        let status = response.status();
        // Body is never interpreted.
        let _ = response.bytes().await;

        if status != StatusCode::ACCEPTED {
            return Err(HttpError::rejected(&self.url, status));
        }

        tracing::debug!(%status, "Payload accepted");
        Ok(())
    }
}

/// Error returned by the [`Http`] backend.
#[derive(Debug)]
pub struct HttpError {
    context: SpanTrace,
    url: String,
    kind: HttpErrorKind,
}

/// Http errors kind.
#[derive(Debug)]
pub enum HttpErrorKind {
    /// The request did not complete (connection refused, DNS, timeout, ...).
    Request(reqwest::Error),
    /// The collaborator answered with a status other than 202 Accepted.
    UnexpectedStatus(StatusCode),
}

impl HttpError {
    fn request(url: &str, err: reqwest::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            url: url.to_owned(),
            kind: HttpErrorKind::Request(err),
        }
    }

    fn rejected(url: &str, status: StatusCode) -> Self {
        Self {
            context: SpanTrace::capture(),
            url: url.to_owned(),
            kind: HttpErrorKind::UnexpectedStatus(status),
        }
    }

    pub fn kind(&self) -> &HttpErrorKind {
        &self.kind
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Status code when the request completed but was not accepted.
    pub fn unexpected_status(&self) -> Option<u16> {
        match &self.kind {
            HttpErrorKind::UnexpectedStatus(status) => Some(status.as_u16()),
            HttpErrorKind::Request(_) => None,
        }
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HttpErrorKind::Request(err) => writeln!(f, "Request to {} failed: {err}", self.url),
            HttpErrorKind::UnexpectedStatus(status) => writeln!(
                f,
                "Unexpected status from {}: {status} (expected {})",
                self.url,
                StatusCode::ACCEPTED
            ),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            HttpErrorKind::Request(err) => Some(err),
            HttpErrorKind::UnexpectedStatus(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Envelope,
        forward::{Forwarder, layers::PrettyJsonLayer},
    };
    use httpmock::{Method::POST, MockServer};

    #[test]
    fn default_endpoints() {
        assert_eq!(Http::log_service().url(), "http://log-service:8000/log");
        assert_eq!(Http::mail_service().url(), "http://mail-service:8000/send");
    }

    #[tokio::test]
    async fn accepted_response_is_success() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/log")
                    .header("content-type", "application/json")
                    .body("{}");
                then.status(202).body("ignored");
            })
            .await;

        let mut http = Http::new(server.url("/log"));
        http.deliver(RawPayload::from(b"{}".to_vec())).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn other_success_statuses_are_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/send");
                then.status(200);
            })
            .await;

        let mut http = Http::new(server.url("/send"));
        let err = http.deliver(RawPayload::from(b"{}".to_vec())).await.unwrap_err();

        assert_eq!(err.unexpected_status(), Some(200));
        assert!(err.to_string().contains("Unexpected status"));
    }

    #[tokio::test]
    async fn connection_failure_is_a_request_error() {
        let mut http = Http::new("http://127.0.0.1:1/log");
        let err = http.deliver(RawPayload::from(b"{}".to_vec())).await.unwrap_err();

        assert!(matches!(err.kind(), HttpErrorKind::Request(_)));
        assert_eq!(err.unexpected_status(), None);
    }

    #[tokio::test]
    async fn forwarder_reports_unexpected_status() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/log")
                    .body("{\n\t\"name\": \"log\",\n\t\"data\": \"disk full\"\n}");
                then.status(500);
            })
            .await;

        let forwarder = Forwarder::new(Http::new(server.url("/log"))).layer(PrettyJsonLayer);
        let err = forwarder
            .forward(Envelope {
                name: "log".into(),
                data: "disk full".into(),
                mail: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.unexpected_status(), Some(500));
        mock.assert_hits_async(1).await;
    }
}
