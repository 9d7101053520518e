use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};
use tracing::warn;

/// Metrics for the change-event bridge (engine callback, queue, consumer loop)
#[derive(Clone)]
pub struct BridgeMetrics {
    /// Batches handed to the queue by the engine callback
    pub batches_enqueued_total: IntCounter,
    /// Records copied out of engine handles and queued
    pub records_enqueued_total: IntCounter,
    /// Handles whose fields could not be read and were skipped
    pub records_extract_failed_total: IntCounter,
    /// Records that produced no event, by reason
    pub records_dropped_total: IntCounterVec,
    /// Batches whose load call succeeded
    pub batches_loaded_total: IntCounter,
    /// Batches abandoned after a failed load call
    pub batches_failed_total: IntCounter,
    /// Rows submitted in successful loads, by write disposition
    pub rows_loaded_total: IntCounterVec,
    /// Best-effort destination syncs that failed
    pub sync_failures_total: IntCounter,
    /// Batches waiting in the queue
    pub queue_depth: IntGauge,
    /// Consumer loop status (1 = running, 0 = stopped)
    pub consumer_running: IntGauge,
    /// Duration of the downstream load call
    pub load_duration_seconds: Histogram,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        let registry = prometheus::default_registry();

        let batches_enqueued_total = IntCounter::new(
            "cdc_batches_enqueued_total",
            "Total number of change batches handed to the queue",
        )
        .expect("valid metric for cdc_batches_enqueued_total");

        let records_enqueued_total = IntCounter::new(
            "cdc_records_enqueued_total",
            "Total number of change records copied into the queue",
        )
        .expect("valid metric for cdc_records_enqueued_total");

        let records_extract_failed_total = IntCounter::new(
            "cdc_records_extract_failed_total",
            "Total number of change handles that could not be read",
        )
        .expect("valid metric for cdc_records_extract_failed_total");

        let records_dropped_total = IntCounterVec::new(
            Opts::new(
                "cdc_records_dropped_total",
                "Total number of change records dropped before loading",
            ),
            &["reason"],
        )
        .expect("valid metric for cdc_records_dropped_total");

        let batches_loaded_total = IntCounter::new(
            "cdc_batches_loaded_total",
            "Total number of batches loaded into the destination",
        )
        .expect("valid metric for cdc_batches_loaded_total");

        let batches_failed_total = IntCounter::new(
            "cdc_batches_failed_total",
            "Total number of batches abandoned after a failed load",
        )
        .expect("valid metric for cdc_batches_failed_total");

        let rows_loaded_total = IntCounterVec::new(
            Opts::new(
                "cdc_rows_loaded_total",
                "Total number of rows submitted in successful loads",
            ),
            &["write_disposition"],
        )
        .expect("valid metric for cdc_rows_loaded_total");

        let sync_failures_total = IntCounter::new(
            "cdc_sync_failures_total",
            "Total number of failed destination syncs",
        )
        .expect("valid metric for cdc_sync_failures_total");

        let queue_depth = IntGauge::new("cdc_queue_depth", "Number of batches waiting in the queue")
            .expect("valid metric for cdc_queue_depth");

        let consumer_running = IntGauge::new(
            "cdc_consumer_running",
            "Consumer loop status (1 = running, 0 = stopped)",
        )
        .expect("valid metric for cdc_consumer_running");

        let load_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "cdc_load_duration_seconds",
                "Duration of downstream load calls in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .expect("valid metric for cdc_load_duration_seconds");

        for metric in [
            Box::new(batches_enqueued_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(records_enqueued_total.clone()),
            Box::new(records_extract_failed_total.clone()),
            Box::new(records_dropped_total.clone()),
            Box::new(batches_loaded_total.clone()),
            Box::new(batches_failed_total.clone()),
            Box::new(rows_loaded_total.clone()),
            Box::new(sync_failures_total.clone()),
            Box::new(queue_depth.clone()),
            Box::new(consumer_running.clone()),
            Box::new(load_duration_seconds.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register CDC bridge metric: {}", e);
            }
        }

        Self {
            batches_enqueued_total,
            records_enqueued_total,
            records_extract_failed_total,
            records_dropped_total,
            batches_loaded_total,
            batches_failed_total,
            rows_loaded_total,
            sync_failures_total,
            queue_depth,
            consumer_running,
            load_duration_seconds,
        }
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialise the default registry in Prometheus text format
pub fn render() -> Result<(String, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    let body = String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics are not valid UTF-8: {}", e)))?;

    Ok((encoder.format_type().to_string(), body))
}
