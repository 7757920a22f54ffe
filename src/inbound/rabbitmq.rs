use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use lapin::{
    Channel, Connection, ExchangeKind,
    options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tokio_stream::StreamExt as _;
use tracing_error::SpanTrace;

use crate::inbound::{Inbound, StreamDeliveries};

/// Topic exchange the upstream services publish to.
pub const EXCHANGE: &str = "logs_topic";

/// RabbitMQ transport binding.
///
/// Owns one channel opened on a caller-provided connection and a
/// server-named receive queue bound to [`EXCHANGE`].
///
/// ## Design
///
/// - The connection is owned by the process bootstrap; only the channel
///   belongs to the binding
/// - The exchange is declared durable, so redeclaring it is a no-op
/// - The queue is exclusive and auto-deleting: it lives as long as this
///   consumer does
/// - Every topic pattern is bound independently, duplicates included
/// - Deliveries are consumed with automatic acknowledgement. A message counts
///   as delivered once it leaves the broker; whatever happens downstream is
///   never reported back, so a failed forward is lost for good
pub struct RabbitMq {
    channel: Channel,
    queue: String,
}

impl RabbitMq {
    /// Open a channel, declare the exchange and queue, and bind `topics`.
    ///
    /// Stops at the first failing step; bindings already made are left to
    /// disappear with the auto-deleting queue.
    #[tracing::instrument(skip_all)]
    pub async fn bind<I, T>(connection: &Connection, topics: I) -> Result<Self, BindError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BindError::new(BindStep::OpenChannel, e))?;

        channel
            .exchange_declare(
                EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BindError::new(BindStep::DeclareExchange, e))?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BindError::new(BindStep::DeclareQueue, e))?;
        let queue = queue.name().as_str().to_owned();

        for topic in topics {
            let topic = topic.as_ref();
            channel
                .queue_bind(
                    &queue,
                    EXCHANGE,
                    topic,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BindError::new(
                        BindStep::BindQueue {
                            topic: topic.to_owned(),
                        },
                        e,
                    )
                })?;
            tracing::debug!(%queue, topic, "Queue bound");
        }

        tracing::info!(exchange = EXCHANGE, %queue, "Waiting for messages");
        Ok(Self { channel, queue })
    }

    /// Server-assigned name of the receive queue.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }
}

#[async_trait]
impl StreamDeliveries for RabbitMq {
    type Error = BindError;

    /// Start consuming with automatic acknowledgement.
    ///
    /// The stream holds a handle to the channel, so the channel stays open
    /// for as long as the stream is alive.
    async fn deliveries(
        &mut self,
    ) -> Result<BoxStream<'static, Result<Inbound, Self::Error>>, Self::Error> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BindError::new(BindStep::Consume, e))?;

        let channel = self.channel.clone();
        Ok(Box::pin(stream! {
            let _channel = channel;
            while let Some(delivery) = consumer.next().await {
                yield delivery
                    .map(|d| Inbound {
                        routing_key: d.routing_key.as_str().to_owned(),
                        body: d.data,
                    })
                    .map_err(|e| BindError::new(BindStep::Consume, e));
            }
        }))
    }
}

/// Error returned when setting up or consuming from the broker.
#[derive(Debug)]
pub struct BindError {
    context: SpanTrace,
    step: BindStep,
    source: lapin::Error,
}

/// Setup step that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindStep {
    OpenChannel,
    DeclareExchange,
    DeclareQueue,
    BindQueue { topic: String },
    Consume,
}

impl BindError {
    fn new(step: BindStep, source: lapin::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            step,
            source,
        }
    }

    pub fn step(&self) -> &BindStep {
        &self.step
    }
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step {
            BindStep::OpenChannel => writeln!(f, "Failed to open channel: {}", self.source),
            BindStep::DeclareExchange => {
                writeln!(f, "Failed to declare exchange {EXCHANGE}: {}", self.source)
            }
            BindStep::DeclareQueue => writeln!(f, "Failed to declare queue: {}", self.source),
            BindStep::BindQueue { topic } => {
                writeln!(f, "Failed to bind topic {topic}: {}", self.source)
            }
            BindStep::Consume => writeln!(f, "Consume error: {}", self.source),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
