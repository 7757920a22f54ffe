use lapin::{Connection, ConnectionProperties};
use listen_service::{
    Consumer, Dispatcher, Forwarder,
    config::Settings,
    forward::{http::Http, layers::PrettyJsonLayer},
    inbound::rabbitmq::RabbitMq,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<(), tower::BoxError> {
    // A missing .env file is fine; the environment may already be set.
    let _ = dotenv::dotenv();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(ErrorLayer::default())
        .init();

    let settings = Settings::from_env()?;
    let connection = connect(&settings).await?;

    let source = RabbitMq::bind(&connection, &settings.topics).await?;
    let dispatcher = Dispatcher::new(
        Forwarder::new(Http::log_service()).layer(PrettyJsonLayer),
        Forwarder::new(Http::mail_service()).layer(PrettyJsonLayer),
    );

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "Failed to install Ctrl+C handler");
            return;
        }
        cancel_signal.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Second Ctrl+C, exiting without waiting for handlers");
            std::process::exit(130);
        }
    });

    Consumer::new(source, dispatcher)
        .with_drain_timeout(settings.shutdown_grace)
        .run(cancel)
        .await?;
    Ok(())
}

/// Connect to the broker, backing off between failed attempts.
#[tracing::instrument(skip_all, fields(url = %settings.redacted_amqp_url()))]
async fn connect(settings: &Settings) -> Result<Connection, lapin::Error> {
    let mut attempt = 1;
    loop {
        match Connection::connect(&settings.amqp_url, ConnectionProperties::default()).await {
            Ok(connection) => {
                tracing::info!(attempt, "Connected to RabbitMQ");
                return Ok(connection);
            }
            Err(error) if attempt < settings.connect_attempts => {
                let delay = settings.backoff_for(attempt);
                tracing::warn!(%error, attempt, ?delay, "RabbitMQ not ready, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                tracing::error!(%error, attempt, "Giving up connecting to RabbitMQ");
                return Err(error);
            }
        }
    }
}
