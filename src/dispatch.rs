//! Routing of decoded envelopes to the downstream forwarders.
//!
//! Every envelope is forwarded to the log service exactly once. Envelopes of
//! kind [`EventKind::Auth`] additionally go through the mail guard: the mail
//! forward only happens when the envelope carries a [`MailInfo`] with all of
//! `to`, `subject` and `message` filled in.
//!
//! Failures are logged and reported back in a [`DispatchReport`]; nothing is
//! retried and nothing is sent back to the broker.

use tower::Service;

use crate::{
    Envelope, EventKind, MailInfo,
    forward::{ForwardError, Forwarder},
};

/// Routes envelopes to a log forwarder and a mail forwarder.
///
/// `Dispatcher` is cheap to clone; the consumer hands one clone to every
/// handler task.
///
/// Generic parameters:
/// - `L`: Service stack behind the log forwarder
/// - `M`: Service stack behind the mail forwarder
pub struct Dispatcher<L, M> {
    log: Forwarder<L>,
    mail: Forwarder<M>,
}

impl<L: Clone, M: Clone> Clone for Dispatcher<L, M> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            mail: self.mail.clone(),
        }
    }
}

impl<L, M> Dispatcher<L, M>
where
    L: Service<Envelope> + Clone + Send + 'static,
    L::Future: Send + 'static,
    L::Error: Into<tower::BoxError>,
    M: Service<MailInfo> + Clone + Send + 'static,
    M::Future: Send + 'static,
    M::Error: Into<tower::BoxError>,
{
    pub fn new(log: Forwarder<L>, mail: Forwarder<M>) -> Self {
        Self { log, mail }
    }

    /// Classify `envelope` and forward it.
    ///
    /// The log forward always happens first. For auth events the mail guard
    /// runs afterwards regardless of the log forward's result.
    #[tracing::instrument(skip_all, fields(name = %envelope.name))]
    pub async fn dispatch(self, envelope: Envelope) -> DispatchReport {
        let kind = EventKind::classify(&envelope.name);
        match kind {
            EventKind::Log | EventKind::Event => {
                tracing::info!(data = %envelope.data, "Logging event")
            }
            EventKind::Auth => tracing::info!(data = %envelope.data, "Auth event"),
            EventKind::Unrecognized => {
                tracing::info!(data = %envelope.data, "Unrecognized event, logging only")
            }
        }

        let log = self.log.forward(envelope.clone()).await;
        if let Err(error) = &log {
            tracing::error!(%error, "Log forward failed");
        }

        let mail = if kind.sends_mail() {
            self.send_mail(envelope).await
        } else {
            MailOutcome::NotRequested
        };

        DispatchReport { kind, log, mail }
    }

    async fn send_mail(self, envelope: Envelope) -> MailOutcome {
        let Some(mail) = envelope.mail else {
            tracing::warn!(data = %envelope.data, "Auth event missing 'mail' field");
            return MailOutcome::Missing;
        };

        let missing = mail.missing_fields();
        if !missing.is_empty() {
            tracing::warn!(?mail, ?missing, "Mail request has empty fields");
            return MailOutcome::Incomplete { missing };
        }

        tracing::info!(to = %mail.to, subject = %mail.subject, "Sending mail");
        match self.mail.forward(mail).await {
            Ok(()) => MailOutcome::Sent,
            Err(error) => {
                tracing::error!(%error, "Mail forward failed");
                MailOutcome::Failed(error)
            }
        }
    }
}

/// Outcome of dispatching one envelope.
#[derive(Debug)]
pub struct DispatchReport {
    /// How the envelope was classified.
    pub kind: EventKind,
    /// Result of the log forward. Always attempted.
    pub log: Result<(), ForwardError>,
    /// What happened on the mail path.
    pub mail: MailOutcome,
}

impl DispatchReport {
    /// Whether every forward that was attempted succeeded.
    pub fn is_success(&self) -> bool {
        self.log.is_ok() && !matches!(self.mail, MailOutcome::Failed(_))
    }
}

/// Mail path outcome.
#[derive(Debug)]
pub enum MailOutcome {
    /// The event kind never sends mail.
    NotRequested,
    /// An auth event without a `mail` field.
    Missing,
    /// A mail request with empty fields; nothing was sent.
    Incomplete { missing: Vec<&'static str> },
    Sent,
    Failed(ForwardError),
}
