//! Downstream load boundary.
//!
//! A [`LoadPipeline`] receives every load unit of one drained batch in a
//! single call and is expected to apply them as one load: upsert on the
//! primary key for merge units, plain insert for append units. The consumer
//! loop owns the pipeline on its own thread, so implementations need not be
//! `Sync`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::error::Result;
use crate::services::cdc::{LoadUnit, WriteDisposition};

pub mod local;

pub use local::LocalDestination;

pub trait LoadPipeline {
    /// Load all units of one batch as a single load
    fn run(&mut self, units: Vec<LoadUnit>) -> Result<LoadInfo>;

    /// Force loaded data to durable storage and release destination locks
    fn sync_destination(&mut self) -> Result<()>;
}

impl<P: LoadPipeline + ?Sized> LoadPipeline for Box<P> {
    fn run(&mut self, units: Vec<LoadUnit>) -> Result<LoadInfo> {
        (**self).run(units)
    }

    fn sync_destination(&mut self) -> Result<()> {
        (**self).sync_destination()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableLoadInfo {
    pub table: String,
    pub write_disposition: WriteDisposition,
    pub rows: usize,
}

/// Outcome of a successful load
#[derive(Debug, Clone, Serialize)]
pub struct LoadInfo {
    pub load_id: Uuid,
    pub pipeline_name: String,
    pub dataset_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableLoadInfo>,
}

impl LoadInfo {
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

impl fmt::Display for LoadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipeline {} load {} into dataset {}: {} rows across {} tables in {}ms",
            self.pipeline_name,
            self.load_id,
            self.dataset_name,
            self.total_rows(),
            self.tables.len(),
            (self.finished_at - self.started_at).num_milliseconds()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_info_display_summarises_tables() {
        let now = Utc::now();
        let info = LoadInfo {
            load_id: Uuid::nil(),
            pipeline_name: "mysql_cdc".to_string(),
            dataset_name: "mysql_cdc_data".to_string(),
            started_at: now,
            finished_at: now,
            tables: vec![
                TableLoadInfo {
                    table: "orders".to_string(),
                    write_disposition: WriteDisposition::Merge,
                    rows: 3,
                },
                TableLoadInfo {
                    table: "audit".to_string(),
                    write_disposition: WriteDisposition::Append,
                    rows: 2,
                },
            ],
        };

        assert_eq!(info.total_rows(), 5);
        let rendered = info.to_string();
        assert!(rendered.contains("5 rows across 2 tables"));
        assert!(rendered.contains("mysql_cdc_data"));
    }
}
