//! Store dead letters, list them over HTTP and republish them to their channel.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use health::HealthRegistry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use dlq_common::eventbus::{
    DefaultConsumerGroupHandler, KafkaConsumerGroup, KafkaPublisher, MetricsTracer, Publisher,
    Subscriber,
};
use dlq_common::metrics::{serve, setup_metrics_routes};
use dlq_service::config::Config;
use dlq_service::event_handler::DlqEventHandler;
use dlq_service::handlers;
use dlq_service::store::PgMessageStore;
use dlq_service::usecase::DlqUsecase;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;

    let liveness = HealthRegistry::new("liveness");
    let publisher_liveness =
        liveness.register("publisher".to_string(), time::Duration::seconds(30));
    let consumer_liveness = liveness.register("consumer".to_string(), time::Duration::seconds(30));

    let store = PgMessageStore::new(
        &config.dlq_table,
        &config.database_url,
        config.max_pg_connections,
    )
    .await
    .wrap_err("failed to connect to postgres")?;
    let publisher: Arc<dyn Publisher> = Arc::new(
        KafkaPublisher::new(&config.kafka, publisher_liveness)
            .await
            .wrap_err("failed to create kafka producer")?,
    );
    let usecase = Arc::new(DlqUsecase::new(Arc::new(store), publisher.clone()));

    // Envelopes that fail to be stored are only logged, there is no dead letter topic here.
    let handler = DefaultConsumerGroupHandler::new(&config.service_name, Arc::new(MetricsTracer))
        .with_event_handler(Arc::new(DlqEventHandler::new(usecase.clone())));

    let group = KafkaConsumerGroup::new(&config.kafka, &config.service_name, consumer_liveness)
        .wrap_err("failed to create kafka consumer")?;
    let subscriber = Subscriber::new(
        Arc::new(group),
        vec![config.dlq_topic.clone()],
        Arc::new(handler),
        config.poll_retry.strategy(),
    );
    subscriber.subscribe();

    let router = handlers::add_routes(axum::Router::new(), usecase);
    let router = setup_metrics_routes(router, liveness);

    let stop_server = CancellationToken::new();
    let server_stopped = stop_server.clone();
    let bind = config.bind();
    let server = tokio::spawn(async move {
        serve(router, &bind, async move { server_stopped.cancelled().await }).await
    });
    info!("dlq service started on {}", config.bind());

    shutdown().await;

    stop_server.cancel();
    if let Err(e) = subscriber.close().await {
        error!("failed to close subscriber: {}", e);
    }
    if let Err(e) = publisher.close().await {
        error!("failed to close publisher: {}", e);
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("http server failed: {}", e),
        Err(e) => error!("http server task failed: {}", e),
    }

    Ok(())
}
