use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cdc_loader::destination::LocalDestination;
use cdc_loader::engine::{ChangeEngine, ReplayEngine};
use cdc_loader::services::cdc::{
    change_queue, ChangeQueue, ChangeSender, ConsumerLoop, LoopSummary, QueueHandler,
};
use cdc_loader::shutdown::shutdown_signal;
use cdc_loader::{http, BridgeMetrics, EngineKind, LoaderConfig, Properties, StopSignal};

type ConsumerHandle = JoinHandle<cdc_loader::Result<LoopSummary>>;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting cdc-loader");

    let config = LoaderConfig::from_env().context("Failed to load loader configuration")?;
    config.log_config();

    let properties = Properties::load(&config.properties_file)
        .context("Failed to load engine properties")?;
    debug!(
        file = %config.properties_file.display(),
        properties = ?properties,
        "Engine properties loaded"
    );

    let metrics = BridgeMetrics::new();
    let (sender, queue) = change_queue();
    let stop = StopSignal::new();

    let mut engine = build_engine(config.engine, &properties)?;
    let consumer = spawn_consumer(&config, queue, stop.clone(), metrics.clone())
        .context("Failed to start consumer thread")?;

    let handler = Arc::new(QueueHandler::new(sender.clone(), metrics.clone()));
    if let Err(e) = engine.start(handler) {
        stop.stop();
        let _ = join_consumer(consumer).await;
        return Err(e).context("Failed to start change engine");
    }

    let server = match config.metrics_port {
        Some(port) => {
            let data = web::Data::new(metrics.clone());
            let server = HttpServer::new(move || {
                App::new().app_data(data.clone()).configure(http::configure)
            })
            .bind(("0.0.0.0", port))
            .context("Failed to bind metrics server")?
            .workers(1)
            .disable_signals()
            .run();

            let handle = server.handle();
            tokio::spawn(async move {
                if let Err(e) = server.await {
                    error!("Metrics server error: {}", e);
                }
            });
            info!(port, "Serving /health, /ready and /metrics");
            Some(handle)
        }
        None => None,
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping CDC loader");
        }
        _ = wait_until_idle(engine.as_ref(), &sender, &consumer) => {
            info!("Change engine finished and queue drained");
        }
    }

    if let Err(e) = engine.stop() {
        warn!("Change engine did not stop cleanly: {}", e);
    }
    stop.stop();
    let outcome = join_consumer(consumer).await;

    if let Some(handle) = server {
        handle.stop(true).await;
    }

    let summary = outcome?;
    info!(summary = ?summary, "cdc-loader stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cdc_loader=debug".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

fn build_engine(kind: EngineKind, properties: &Properties) -> Result<Box<dyn ChangeEngine>> {
    match kind {
        EngineKind::Replay => {
            let engine = ReplayEngine::from_properties(properties)
                .context("Invalid replay engine properties")?;
            Ok(Box::new(engine))
        }
        #[cfg(feature = "kafka")]
        EngineKind::Kafka => {
            let engine = cdc_loader::engine::KafkaEngine::from_properties(properties)
                .context("Invalid kafka engine properties")?;
            Ok(Box::new(engine))
        }
        #[cfg(not(feature = "kafka"))]
        EngineKind::Kafka => {
            anyhow::bail!("CDC_ENGINE=kafka requires cdc-loader built with the `kafka` feature")
        }
    }
}

/// The destination is opened on the consumer thread and never leaves it
fn spawn_consumer(
    config: &LoaderConfig,
    queue: ChangeQueue,
    stop: StopSignal,
    metrics: BridgeMetrics,
) -> std::io::Result<ConsumerHandle> {
    let data_dir = config.data_dir.clone();
    let pipeline_name = config.pipeline_name.clone();
    let dataset_name = config.dataset_name.clone();
    let primary_keys = config.primary_keys.clone();
    let poll_timeout = config.poll_timeout();

    thread::Builder::new()
        .name("cdc-consumer".to_string())
        .spawn(move || {
            let destination = LocalDestination::open(data_dir, pipeline_name, dataset_name)
                .map_err(|e| {
                    error!("Failed to open destination: {}", e);
                    e
                })?;

            ConsumerLoop::new(queue, destination, primary_keys, stop, metrics)
                .with_poll_timeout(poll_timeout)
                .run()
        })
}

/// Resolve once a self-terminating engine is done and every batch was taken
async fn wait_until_idle(engine: &dyn ChangeEngine, queue: &ChangeSender, consumer: &ConsumerHandle) {
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    loop {
        ticker.tick().await;
        if consumer.is_finished() {
            warn!("Consumer thread exited before shutdown was requested");
            return;
        }
        if !engine.is_running() && queue.is_empty() {
            return;
        }
    }
}

async fn join_consumer(consumer: ConsumerHandle) -> Result<LoopSummary> {
    let joined = tokio::task::spawn_blocking(move || consumer.join())
        .await
        .context("Failed to wait for consumer thread")?;

    match joined {
        Ok(result) => result.context("Consumer loop failed"),
        Err(_) => anyhow::bail!("Consumer thread panicked"),
    }
}
