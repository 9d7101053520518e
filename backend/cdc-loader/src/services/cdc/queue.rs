use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::{debug, warn};

use super::models::{Batch, RawChangeRecord};
use crate::engine::{ChangeEvent, ChangeHandler};
use crate::error::{LoaderError, Result};
use crate::metrics::BridgeMetrics;

/// Create the FIFO hand-off between the engine callback thread and the
/// consumer thread.
///
/// Unbounded: enqueueing never blocks, and no backpressure reaches the
/// engine. Nothing is persisted, so batches still queued when the process
/// dies are lost. Once every [`ChangeSender`] is dropped and the remaining
/// batches are drained, [`ChangeQueue::dequeue`] reports the queue closed.
pub fn change_queue() -> (ChangeSender, ChangeQueue) {
    let (sender, receiver) = unbounded();
    (ChangeSender { sender }, ChangeQueue { receiver })
}

/// Producer side of the queue; clones feed the same queue
#[derive(Clone)]
pub struct ChangeSender {
    sender: Sender<Batch>,
}

impl ChangeSender {
    /// Queue a batch; empty batches are ignored
    pub fn enqueue(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.sender
            .send(batch)
            .map_err(|_| LoaderError::QueueClosed)
    }

    /// Number of batches waiting
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Consumer side of the queue, owned by the single consumer loop
pub struct ChangeQueue {
    receiver: Receiver<Batch>,
}

impl ChangeQueue {
    /// Wait up to `timeout` for the next batch; `Ok(None)` on timeout
    pub fn dequeue(&self, timeout: Duration) -> Result<Option<Batch>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(batch) => Ok(Some(batch)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LoaderError::QueueClosed),
        }
    }

    /// Number of batches waiting
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Engine callback that copies each handle into an owned record and queues
/// the batch.
///
/// A handle that cannot be read is logged and skipped; the rest of the batch
/// is still queued.
pub struct QueueHandler {
    queue: ChangeSender,
    metrics: BridgeMetrics,
}

impl QueueHandler {
    pub fn new(queue: ChangeSender, metrics: BridgeMetrics) -> Self {
        Self { queue, metrics }
    }

    fn extract(record: &dyn ChangeEvent) -> Result<RawChangeRecord> {
        Ok(RawChangeRecord {
            key: record.key()?.map(<[u8]>::to_vec),
            value: record.value()?.map(<[u8]>::to_vec),
            destination: record.destination()?.unwrap_or_default().to_string(),
        })
    }
}

impl ChangeHandler for QueueHandler {
    fn handle_batch(&self, records: &[&dyn ChangeEvent]) {
        if records.is_empty() {
            return;
        }

        let mut batch = Vec::with_capacity(records.len());
        for record in records {
            match Self::extract(*record) {
                Ok(raw) => batch.push(raw),
                Err(e) => {
                    self.metrics.records_extract_failed_total.inc();
                    warn!(error = %e, "Skipping change record that could not be read");
                }
            }
        }

        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        debug!(records = count, "Queuing change batch");
        match self.queue.enqueue(batch) {
            Ok(()) => {
                self.metrics.batches_enqueued_total.inc();
                self.metrics.records_enqueued_total.inc_by(count as u64);
                self.metrics.queue_depth.set(self.queue.len() as i64);
            }
            Err(e) => {
                warn!(error = %e, records = count, "Change batch lost, queue unavailable");
            }
        }
    }
}
