//! Debezium change-data-capture loader.
//!
//! A change engine delivers batches of Debezium change events on its own
//! thread; a queue hands them to a single consumer thread that parses each
//! record, groups the events by table and loads them into a destination,
//! merging on configured primary keys and appending everything else.

pub mod config;
pub mod destination;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod services;
pub mod shutdown;

pub use config::{EngineKind, LoaderConfig, Properties};
pub use error::{LoaderError, Result};
pub use metrics::BridgeMetrics;
pub use shutdown::StopSignal;
