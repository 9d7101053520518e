//! Test doubles for the engine and load boundaries.

#![allow(dead_code)]

use cdc_loader::destination::{LoadInfo, LoadPipeline, TableLoadInfo};
use cdc_loader::engine::{ChangeEngine, ChangeEvent, ChangeHandler};
use cdc_loader::services::cdc::{LoadUnit, RawChangeRecord};
use cdc_loader::{LoaderError, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use uuid::Uuid;

/// Debezium envelope with schema wrapper
pub fn envelope(op: &str, table: &str, before: Value, after: Value) -> Value {
    json!({
        "schema": {"type": "struct", "name": "shop.inventory.Envelope"},
        "payload": {
            "op": op,
            "before": before,
            "after": after,
            "source": {"connector": "mysql", "db": "inventory", "table": table},
            "ts_ms": 1_700_000_000_000i64
        }
    })
}

pub fn record(value: Value) -> RawChangeRecord {
    RawChangeRecord::new(None, Some(value.to_string().into_bytes()), "cdc.inventory")
}

pub fn tombstone() -> RawChangeRecord {
    RawChangeRecord::new(Some(b"{\"id\":1}".to_vec()), None, "cdc.inventory.orders")
}

/// Everything the pipeline was asked to do, shared with the test
#[derive(Default)]
pub struct Calls {
    pub loads: Vec<Vec<LoadUnit>>,
    pub syncs: usize,
}

/// Load pipeline that records its calls and can be told to fail
#[derive(Clone, Default)]
pub struct RecordingPipeline {
    pub calls: Arc<Mutex<Calls>>,
    pub fail_loads: Arc<AtomicBool>,
}

impl RecordingPipeline {
    pub fn loads(&self) -> Vec<Vec<LoadUnit>> {
        self.calls.lock().unwrap().loads.clone()
    }

    pub fn syncs(&self) -> usize {
        self.calls.lock().unwrap().syncs
    }
}

impl LoadPipeline for RecordingPipeline {
    fn run(&mut self, units: Vec<LoadUnit>) -> Result<LoadInfo> {
        let tables = units
            .iter()
            .map(|unit| TableLoadInfo {
                table: unit.table.clone(),
                write_disposition: unit.write_disposition,
                rows: unit.rows.len(),
            })
            .collect();
        self.calls.lock().unwrap().loads.push(units);

        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(LoaderError::Load("warehouse rejected the load".to_string()));
        }
        Ok(LoadInfo {
            load_id: Uuid::new_v4(),
            pipeline_name: "mysql_cdc".to_string(),
            dataset_name: "mysql_cdc_data".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            tables,
        })
    }

    fn sync_destination(&mut self) -> Result<()> {
        self.calls.lock().unwrap().syncs += 1;
        Ok(())
    }
}

/// Engine handle over owned bytes
pub struct SyntheticEvent {
    pub value: Option<Vec<u8>>,
    pub destination: String,
}

impl ChangeEvent for SyntheticEvent {
    fn key(&self) -> Result<Option<&[u8]>> {
        Ok(None)
    }

    fn value(&self) -> Result<Option<&[u8]>> {
        Ok(self.value.as_deref())
    }

    fn destination(&self) -> Result<Option<&str>> {
        Ok(Some(&self.destination))
    }
}

/// Engine that delivers a fixed list of batches from its own thread, then stops
pub struct SyntheticEngine {
    batches: Vec<Vec<Option<Value>>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SyntheticEngine {
    pub fn new(batches: Vec<Vec<Option<Value>>>) -> Self {
        Self {
            batches,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl ChangeEngine for SyntheticEngine {
    fn start(&mut self, handler: Arc<dyn ChangeHandler>) -> Result<()> {
        let batches = std::mem::take(&mut self.batches);
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        self.handle = Some(thread::spawn(move || {
            for batch in batches {
                let events: Vec<SyntheticEvent> = batch
                    .into_iter()
                    .map(|value| SyntheticEvent {
                        value: value.map(|v| v.to_string().into_bytes()),
                        destination: "cdc.inventory".to_string(),
                    })
                    .collect();
                let handles: Vec<&dyn ChangeEvent> =
                    events.iter().map(|e| e as &dyn ChangeEvent).collect();
                handler.handle_batch(&handles);
            }
            running.store(false, Ordering::SeqCst);
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| LoaderError::Engine("synthetic engine panicked".to_string()))?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
