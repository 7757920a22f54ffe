use tokio::sync::mpsc;
use tokio_stream::{StreamExt as _, wrappers::UnboundedReceiverStream};

use crate::inbound::{Inbound, StreamDeliveries};

/// In-memory delivery source for testing or local pipelines.
///
/// Deliveries pushed through the paired [`mpsc::UnboundedSender`] are yielded
/// in order. The stream ends once every sender has been dropped.
///
/// ```rust
/// use listen_service::inbound::{Inbound, InMemory};
///
/// let (broker, source) = InMemory::channel();
/// broker.send(Inbound::new("log.INFO", r#"{"name":"log"}"#)).unwrap();
/// # drop(source);
/// ```
pub struct InMemory {
    receiver: Option<mpsc::UnboundedReceiver<Inbound>>,
}

impl InMemory {
    /// Create a source and the sender feeding it.
    pub fn channel() -> (mpsc::UnboundedSender<Inbound>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            sender,
            Self {
                receiver: Some(receiver),
            },
        )
    }

    /// Create a source that yields `deliveries` and then ends.
    pub fn from_deliveries(deliveries: impl IntoIterator<Item = Inbound>) -> Self {
        let (sender, source) = Self::channel();
        for delivery in deliveries {
            // Receiver is alive in `source`.
            let _ = sender.send(delivery);
        }
        source
    }
}

#[async_trait::async_trait]
impl StreamDeliveries for InMemory {
    type Error = InMemoryError;

    async fn deliveries(
        &mut self,
    ) -> Result<futures_core::stream::BoxStream<'static, Result<Inbound, Self::Error>>, Self::Error>
    {
        let receiver = self.receiver.take().ok_or(InMemoryError::AlreadyConsumed)?;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver).map(Ok)))
    }
}

/// Error type for the in-memory source.
#[derive(Debug)]
pub enum InMemoryError {
    /// `deliveries` was called a second time.
    AlreadyConsumed,
}

impl std::fmt::Display for InMemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyConsumed => write!(f, "In-memory source is already being consumed"),
        }
    }
}

impl std::error::Error for InMemoryError {}
