//! Consume business topics and divert failed messages to the dead letter topic.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use health::HealthRegistry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use dlq_common::eventbus::{
    DefaultConsumerGroupHandler, DlqHandlerAdapter, KafkaConsumerGroup, KafkaPublisher,
    MetricsTracer, Publisher, Subscriber,
};
use dlq_common::metrics::{serve, setup_metrics_routes};
use dlq_common::spool::FileSpool;
use dlq_consumer::config::Config;
use dlq_consumer::handler::JsonObjectHandler;

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

    let publisher: Arc<dyn Publisher> = Arc::new(
        KafkaPublisher::new(&config.kafka, publisher_liveness)
            .await
            .wrap_err("failed to create kafka producer")?,
    );
    let dlq_handler = Arc::new(DlqHandlerAdapter::new(&config.dlq_topic, publisher.clone()));

    let mut handler =
        DefaultConsumerGroupHandler::new(&config.service_name, Arc::new(MetricsTracer))
            .with_event_handler(Arc::new(JsonObjectHandler))
            .with_dlq_handler(dlq_handler.clone())
            .with_dlq_retry(
                config.dlq_retry.policy(),
                config.dlq_retry.dlq_send_max_attempts,
            );

    if let Some(path) = &config.dlq_spool_path {
        let spool = Arc::new(FileSpool::new(path));
        match spool.replay(dlq_handler.as_ref()).await {
            Ok(summary) if summary.remaining > 0 => {
                warn!(remaining = summary.remaining, "dead letters left in spool");
            }
            Ok(_) => {}
            Err(e) => error!("failed to replay dead letter spool: {}", e),
        }
        handler = handler.with_spool(spool);
    }

    let group = KafkaConsumerGroup::new(&config.kafka, &config.service_name, consumer_liveness)
        .wrap_err("failed to create kafka consumer")?;
    let subscriber = Subscriber::new(
        Arc::new(group),
        config.consumer_topics.0.clone(),
        Arc::new(handler),
        config.poll_retry.strategy(),
    );
    subscriber.subscribe();

    let router = Router::new().route("/", get(|| async { "dlq consumer" }));
    let router = setup_metrics_routes(router, liveness);

    let stop_server = CancellationToken::new();
    let server_stopped = stop_server.clone();
    let bind = config.bind();
    let server = tokio::spawn(async move {
        serve(router, &bind, async move { server_stopped.cancelled().await }).await
    });
    info!("dlq consumer started on {}", config.bind());

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
