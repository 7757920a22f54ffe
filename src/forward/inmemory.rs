use std::sync::Arc;

use tokio::sync::Mutex;

use crate::forward::Deliver;

/// In-memory delivery backend for testing or local pipelines.
///
/// Every payload handed to the backend is recorded in a shared list, so a
/// clone kept by a test observes what the dispatcher forwarded. Useful for:
/// - Unit and integration testing
/// - Running the pipeline without downstream collaborators
///
/// A backend built with [`InMemory::rejecting`] records the attempt and then
/// fails it, standing in for an unavailable collaborator.
pub struct InMemory<M> {
    /// Payloads handed to the backend, in delivery order.
    delivered: Arc<Mutex<Vec<M>>>,
    reject: bool,
}

impl<M> InMemory<M> {
    /// Create a backend that fails every delivery after recording it.
    pub fn rejecting() -> Self {
        Self {
            delivered: Arc::default(),
            reject: true,
        }
    }
}

impl<M: Clone> InMemory<M> {
    /// Return a snapshot of every payload delivered so far.
    pub async fn delivered(&self) -> Vec<M> {
        self.delivered.lock().await.clone()
    }
}

impl<M> Clone for InMemory<M> {
    fn clone(&self) -> Self {
        Self {
            delivered: Arc::clone(&self.delivered),
            reject: self.reject,
        }
    }
}

impl<M> Default for InMemory<M> {
    fn default() -> Self {
        Self {
            delivered: Arc::default(),
            reject: false,
        }
    }
}

#[async_trait::async_trait]
impl<M> Deliver<M> for InMemory<M>
where
    M: std::fmt::Debug + Send,
{
    type Error = std::io::Error;

    #[tracing::instrument(skip_all)]
    async fn deliver(&mut self, payload: M) -> Result<(), Self::Error> {
        tracing::info!(?payload, "Payload delivered to in-memory backend");
        self.delivered.lock().await.push(payload);

        if self.reject {
            return Err(std::io::Error::other("in-memory backend rejected payload"));
        }
        Ok(())
    }
}
