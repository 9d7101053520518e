//! Integration Tests: Consumer Loop
//!
//! Drives the consumer loop with synthetic batches and a recording load
//! pipeline.
//!
//! Coverage:
//! - Merge rows for tables with a primary key (create and delete)
//! - Tombstone-only batches never reach the pipeline
//! - Malformed records are dropped without affecting their siblings
//! - Grouping neither loses nor duplicates events
//! - Load failures abandon the batch and the loop keeps going
//! - Engine -> queue -> consumer hand-off across threads

mod common;

use cdc_loader::engine::ChangeEngine;
use cdc_loader::services::cdc::{
    build_load_units, change_queue, group_by_table, parse_event, BatchOutcome, ConsumerLoop,
    PrimaryKeys, QueueHandler, RawChangeRecord, WriteDisposition,
};
use cdc_loader::{BridgeMetrics, StopSignal};
use common::{envelope, record, tombstone, RecordingPipeline, SyntheticEngine};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn orders_keyed() -> PrimaryKeys {
    [("orders", "id")].into_iter().collect()
}

fn consumer_with(
    pipeline: RecordingPipeline,
    primary_keys: PrimaryKeys,
) -> ConsumerLoop<RecordingPipeline> {
    let (_, queue) = change_queue();
    ConsumerLoop::new(
        queue,
        pipeline,
        primary_keys,
        StopSignal::new(),
        BridgeMetrics::new(),
    )
    .with_poll_timeout(Duration::from_millis(20))
}

#[test]
fn test_create_on_keyed_table_is_merged() {
    let pipeline = RecordingPipeline::default();
    let mut consumer = consumer_with(pipeline.clone(), orders_keyed());

    let batch = vec![record(envelope(
        "c",
        "orders",
        Value::Null,
        json!({"id": 1, "amt": 10}),
    ))];
    let outcome = consumer.process_batch(batch);

    assert!(matches!(outcome, BatchOutcome::Loaded(_)));
    let loads = pipeline.loads();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].len(), 1);

    let unit = &loads[0][0];
    assert_eq!(unit.table, "orders");
    assert_eq!(unit.write_disposition, WriteDisposition::Merge);
    assert_eq!(unit.primary_key.as_deref(), Some("id"));
    assert_eq!(
        unit.rows
            .iter()
            .map(|row| Value::Object(row.clone()))
            .collect::<Vec<_>>(),
        vec![json!({"id": 1, "amt": 10, "__deleted": false})]
    );
}

#[test]
fn test_delete_on_keyed_table_marks_row_deleted() {
    let pipeline = RecordingPipeline::default();
    let mut consumer = consumer_with(pipeline.clone(), orders_keyed());

    let batch = vec![record(envelope(
        "d",
        "orders",
        json!({"id": 1, "amt": 10}),
        Value::Null,
    ))];
    consumer.process_batch(batch);

    let loads = pipeline.loads();
    assert_eq!(
        Value::Object(loads[0][0].rows[0].clone()),
        json!({"id": 1, "amt": 10, "__deleted": true})
    );
}

#[test]
fn test_tombstone_batch_never_reaches_pipeline() {
    let pipeline = RecordingPipeline::default();
    let mut consumer = consumer_with(pipeline.clone(), orders_keyed());

    let batch = vec![tombstone()];
    assert!(batch.iter().all(|r| parse_event(r).is_err()));

    let outcome = consumer.process_batch(batch);

    assert!(matches!(outcome, BatchOutcome::Skipped));
    assert!(pipeline.loads().is_empty());
    assert_eq!(pipeline.syncs(), 0);
}

#[test]
fn test_malformed_record_does_not_affect_siblings() {
    let pipeline = RecordingPipeline::default();
    let mut consumer = consumer_with(pipeline.clone(), orders_keyed());

    let batch = vec![
        RawChangeRecord::new(None, Some(b"{not json".to_vec()), "cdc.inventory"),
        record(envelope("c", "orders", Value::Null, json!({"id": 2, "amt": 5}))),
    ];
    let outcome = consumer.process_batch(batch);

    assert!(matches!(outcome, BatchOutcome::Loaded(ref info) if info.total_rows() == 1));
    let loads = pipeline.loads();
    assert_eq!(loads[0].len(), 1);
    assert_eq!(loads[0][0].rows[0]["id"], json!(2));
    assert_eq!(consumer.summary().records_dropped, 1);
}

#[test]
fn test_grouping_preserves_every_surviving_event() {
    let batch = vec![
        record(envelope("c", "orders", Value::Null, json!({"id": 1}))),
        record(envelope("c", "customers", Value::Null, json!({"id": 9}))),
        tombstone(),
        record(envelope("u", "orders", json!({"id": 1}), json!({"id": 1, "amt": 3}))),
        record(envelope("d", "customers", Value::Null, Value::Null)),
        record(envelope("r", "audit", Value::Null, json!({"id": 4}))),
        record(json!({"payload": {"op": "c", "after": {"id": 5}}})),
    ];

    let events: Vec<_> = batch.iter().filter_map(|r| parse_event(r).ok()).collect();
    assert_eq!(events.len(), 4);

    let groups = group_by_table(events.clone());
    let grouped: usize = groups.iter().map(|g| g.len()).sum();
    assert_eq!(grouped, events.len());

    let units = build_load_units(events, &orders_keyed());
    let tables: Vec<&str> = units.iter().map(|u| u.table.as_str()).collect();
    assert_eq!(tables, vec!["orders", "customers", "audit"]);

    let audit = &units[2];
    assert_eq!(audit.write_disposition, WriteDisposition::Append);
    assert_eq!(audit.rows[0]["__op"], json!("r"));
}

#[test]
fn test_failed_load_is_abandoned_and_loop_continues() {
    let pipeline = RecordingPipeline::default();
    pipeline.fail_loads.store(true, Ordering::SeqCst);
    let mut consumer = consumer_with(pipeline.clone(), PrimaryKeys::new());

    let first = consumer.process_batch(vec![record(envelope(
        "c",
        "audit",
        Value::Null,
        json!({"id": 1}),
    ))]);
    assert!(matches!(first, BatchOutcome::Failed));

    pipeline.fail_loads.store(false, Ordering::SeqCst);
    let second = consumer.process_batch(vec![record(envelope(
        "d",
        "audit",
        json!({"id": 1}),
        Value::Null,
    ))]);
    assert!(matches!(second, BatchOutcome::Loaded(_)));

    let loads = pipeline.loads();
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[1][0].rows[0]["__op"], json!("delete"));
    // Flush is attempted after both the failed and the successful load
    assert_eq!(pipeline.syncs(), 2);
    assert_eq!(consumer.summary().batches_failed, 1);
    assert_eq!(consumer.summary().batches_loaded, 1);
}

#[test]
fn test_engine_batches_flow_through_queue_to_pipeline() {
    let (sender, queue) = change_queue();
    let metrics = BridgeMetrics::new();
    let stop = StopSignal::new();
    let pipeline = RecordingPipeline::default();

    let mut consumer = ConsumerLoop::new(
        queue,
        pipeline.clone(),
        orders_keyed(),
        stop.clone(),
        metrics.clone(),
    )
    .with_poll_timeout(Duration::from_millis(20));
    let consumer_thread = thread::spawn(move || consumer.run());

    let mut engine = SyntheticEngine::new(vec![
        vec![
            Some(envelope("c", "orders", Value::Null, json!({"id": 1}))),
            None,
        ],
        vec![None],
        vec![Some(envelope("u", "orders", json!({"id": 1}), json!({"id": 1, "amt": 2})))],
    ]);
    engine
        .start(Arc::new(QueueHandler::new(sender.clone(), metrics.clone())))
        .unwrap();

    let started = Instant::now();
    while (engine.is_running() || !sender.is_empty() || pipeline.loads().len() < 2)
        && started.elapsed() < Duration::from_secs(5)
    {
        thread::sleep(Duration::from_millis(10));
    }
    engine.stop().unwrap();
    stop.stop();

    let summary = consumer_thread.join().unwrap().unwrap();
    assert_eq!(summary.batches_received, 3);
    assert_eq!(summary.batches_loaded, 2);
    assert_eq!(summary.batches_skipped, 1);
    assert_eq!(summary.records_dropped, 2);

    let loads = pipeline.loads();
    assert_eq!(loads[0][0].rows[0]["__deleted"], json!(false));
    assert_eq!(loads[1][0].rows[0]["amt"], json!(2));
    assert_eq!(metrics.batches_enqueued_total.get(), 3);
}
