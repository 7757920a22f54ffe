//! Inbound delivery sources.
//!
//! A source yields the raw deliveries the consumer decodes and dispatches.
//! The broker backend ([`rabbitmq`], feature-gated) binds a receive queue to
//! the `logs_topic` exchange; [`InMemory`] is a channel-backed stand-in used
//! by tests and local pipelines.
//!
//! ## Key components
//!
//! - [`Inbound`]: One raw delivery
//! - [`StreamDeliveries`]: Trait implemented by concrete sources

mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use futures_core::stream::BoxStream;

pub use inmemory::InMemory;

/// A raw message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Undecoded message body.
    pub body: Vec<u8>,
}

impl Inbound {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }
}

/// Trait for sources that stream deliveries to the consumer.
///
/// The returned stream should:
/// - Yield deliveries in broker intake order
/// - End when the source is exhausted or closed
/// - Yield `Err` for failures that make further intake impossible
#[async_trait::async_trait]
pub trait StreamDeliveries {
    /// Source-specific error type.
    type Error: Into<tower::BoxError>;

    /// Start intake and stream deliveries.
    async fn deliveries(
        &mut self,
    ) -> Result<BoxStream<'static, Result<Inbound, Self::Error>>, Self::Error>;
}
