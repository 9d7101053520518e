use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::grouper::group_by_table;
use super::models::{Batch, ParsedEvent};
use super::parser::{parse_event, DropReason};
use super::queue::ChangeQueue;
use super::resource::{build_load_unit, LoadUnit, PrimaryKeys};
use crate::destination::{LoadInfo, LoadPipeline};
use crate::error::{LoaderError, Result};
use crate::metrics::BridgeMetrics;
use crate::shutdown::StopSignal;

/// Lifecycle of the consumer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Blocked on the queue, re-checking the stop flag at every poll timeout
    Waiting,
    /// Parsing, building and loading one batch
    Processing,
    Terminated,
}

/// What happened to one drained batch
#[derive(Debug)]
pub enum BatchOutcome {
    /// No record produced a loadable event; the pipeline was not called
    Skipped,
    Loaded(LoadInfo),
    /// The load call failed or panicked; the batch is abandoned
    Failed,
}

/// Counters reported when the loop exits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub batches_received: u64,
    pub batches_loaded: u64,
    pub batches_failed: u64,
    pub batches_skipped: u64,
    pub records_dropped: u64,
}

/// Group parsed events by table and build one load unit per table, in order
/// of each table's first appearance.
pub fn build_load_units(events: Vec<ParsedEvent>, primary_keys: &PrimaryKeys) -> Vec<LoadUnit> {
    group_by_table(events)
        .into_iter()
        .map(|group| build_load_unit(group, primary_keys))
        .collect()
}

/// Drains the queue on a single thread and hands each batch to the load
/// pipeline, which it owns exclusively.
///
/// Delivery is at most once: a batch whose load fails is logged and dropped,
/// and the loop moves on. Only a closed queue ends the loop with an error.
pub struct ConsumerLoop<P: LoadPipeline> {
    queue: ChangeQueue,
    pipeline: P,
    primary_keys: PrimaryKeys,
    stop: StopSignal,
    poll_timeout: Duration,
    metrics: BridgeMetrics,
    state: LoopState,
    summary: LoopSummary,
}

impl<P: LoadPipeline> ConsumerLoop<P> {
    pub fn new(
        queue: ChangeQueue,
        pipeline: P,
        primary_keys: PrimaryKeys,
        stop: StopSignal,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            queue,
            pipeline,
            primary_keys,
            stop,
            poll_timeout: Duration::from_secs(1),
            metrics,
            state: LoopState::Waiting,
            summary: LoopSummary::default(),
        }
    }

    /// Bound on how long a stop request can go unnoticed while idle
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn summary(&self) -> &LoopSummary {
        &self.summary
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// Consume batches until the stop signal is set.
    ///
    /// The flag is only checked between batches, so a batch already being
    /// processed always finishes first.
    pub fn run(&mut self) -> Result<LoopSummary> {
        info!(
            poll_timeout_ms = self.poll_timeout.as_millis() as u64,
            merge_tables = ?self.primary_keys.tables(),
            "CDC consumer loop started"
        );
        self.metrics.consumer_running.set(1);

        let result = self.poll_until_stopped();

        self.state = LoopState::Terminated;
        self.metrics.consumer_running.set(0);

        match &result {
            Ok(summary) => info!(
                batches_received = summary.batches_received,
                batches_loaded = summary.batches_loaded,
                batches_failed = summary.batches_failed,
                batches_skipped = summary.batches_skipped,
                records_dropped = summary.records_dropped,
                "CDC consumer loop stopped"
            ),
            Err(e) => error!(error = %e, "CDC consumer loop terminated"),
        }

        result
    }

    fn poll_until_stopped(&mut self) -> Result<LoopSummary> {
        while !self.stop.is_stopped() {
            self.state = LoopState::Waiting;

            // Closed once every producer is gone and the queue is drained
            let batch = match self.queue.dequeue(self.poll_timeout)? {
                Some(batch) => batch,
                None => continue,
            };
            self.metrics.queue_depth.set(self.queue.len() as i64);

            self.state = LoopState::Processing;
            self.process_batch(batch);
        }

        Ok(self.summary.clone())
    }

    /// Parse, group, build and load one batch. Never fails: every problem is
    /// logged and reflected in the returned outcome.
    pub fn process_batch(&mut self, batch: Batch) -> BatchOutcome {
        self.summary.batches_received += 1;
        let received = batch.len();

        let events = self.parse_batch(&batch);
        let units = build_load_units(events, &self.primary_keys);

        if units.is_empty() {
            debug!(records = received, "Batch has no loadable events, skipping load");
            self.summary.batches_skipped += 1;
            return BatchOutcome::Skipped;
        }

        let tables: Vec<String> = units.iter().map(|unit| unit.table.clone()).collect();
        let rows: usize = units.iter().map(|unit| unit.rows.len()).sum();
        debug!(tables = ?tables, rows, "Loading batch");

        let timer = self.metrics.load_duration_seconds.start_timer();
        let pipeline = &mut self.pipeline;
        let result = panic::catch_unwind(AssertUnwindSafe(move || pipeline.run(units)))
            .unwrap_or_else(|payload| {
                Err(LoaderError::Internal(format!(
                    "load panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
        timer.observe_duration();

        match result {
            Ok(info) => {
                info!(load_id = %info.load_id, "{}", info);
                self.metrics.batches_loaded_total.inc();
                for table in &info.tables {
                    self.metrics
                        .rows_loaded_total
                        .with_label_values(&[table.write_disposition.as_str()])
                        .inc_by(table.rows as u64);
                }
                self.summary.batches_loaded += 1;
                self.sync_destination(true);
                BatchOutcome::Loaded(info)
            }
            Err(e) => {
                error!(
                    error = %e,
                    error_detail = ?e,
                    tables = ?tables,
                    rows,
                    "Load failed, batch abandoned"
                );
                self.metrics.batches_failed_total.inc();
                self.summary.batches_failed += 1;
                self.sync_destination(false);
                BatchOutcome::Failed
            }
        }
    }

    fn parse_batch(&mut self, batch: &Batch) -> Vec<ParsedEvent> {
        let mut events = Vec::with_capacity(batch.len());

        for (index, record) in batch.iter().enumerate() {
            match parse_event(record) {
                Ok(event) => events.push(event),
                Err(reason) => {
                    self.record_drop(index, &record.destination, &reason);
                }
            }
        }

        events
    }

    fn record_drop(&mut self, index: usize, destination: &str, reason: &DropReason) {
        self.summary.records_dropped += 1;
        self.metrics
            .records_dropped_total
            .with_label_values(&[reason.as_str()])
            .inc();

        match reason {
            DropReason::Tombstone => {
                trace!(index, destination, "Dropping tombstone");
            }
            DropReason::MissingImage | DropReason::MissingTable => {
                debug!(index, destination, reason = %reason, "Dropping change record");
            }
            DropReason::Malformed(detail) => {
                warn!(index, destination, error = %detail, "Dropping malformed change record");
            }
        }
    }

    /// Best-effort flush; failures are counted and logged, never retried
    fn sync_destination(&mut self, after_success: bool) {
        let pipeline = &mut self.pipeline;
        let result = panic::catch_unwind(AssertUnwindSafe(move || pipeline.sync_destination()))
            .unwrap_or_else(|payload| {
                Err(LoaderError::Internal(format!(
                    "sync panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        if let Err(e) = result {
            self.metrics.sync_failures_total.inc();
            if after_success {
                debug!(error = %e, "Destination sync failed after load");
            } else {
                warn!(error = %e, "Destination sync failed after failed load");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
