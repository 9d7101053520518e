use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::grouper::TableGroup;
use super::models::Row;
use crate::error::LoaderError;

/// Soft-delete marker injected into rows of merge tables
pub const DELETED_COLUMN: &str = "__deleted";

/// Operation marker injected into rows of append tables
pub const OP_COLUMN: &str = "__op";

/// How the destination writes the rows of a load unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteDisposition {
    /// Upsert on the primary key
    Merge,
    /// Insert every row as new history
    Append,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::Merge => "merge",
            WriteDisposition::Append => "append",
        }
    }
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One table's worth of rows handed to the destination
#[derive(Debug, Clone, PartialEq)]
pub struct LoadUnit {
    pub table: String,
    pub write_disposition: WriteDisposition,
    /// Merge key; set only for merge units
    pub primary_key: Option<String>,
    pub rows: Vec<Row>,
}

/// Static table -> primary-key column mapping supplied at start-up.
///
/// Parsed from `table:column` pairs separated by commas
/// (`orders:id,customers:customer_id`) or from a JSON object
/// (`{"orders": "id"}`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryKeys(HashMap<String, String>);

impl PrimaryKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary-key column for `table`; empty column names count as absent
    pub fn get(&self, table: &str) -> Option<&str> {
        self.0
            .get(table)
            .map(String::as_str)
            .filter(|column| !column.is_empty())
    }

    pub fn insert(&mut self, table: impl Into<String>, column: impl Into<String>) {
        self.0.insert(table.into(), column.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.0.keys().map(String::as_str).collect();
        tables.sort_unstable();
        tables
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PrimaryKeys {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(table, column)| (table.into(), column.into()))
                .collect(),
        )
    }
}

impl FromStr for PrimaryKeys {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::new());
        }

        if trimmed.starts_with('{') {
            let map: HashMap<String, String> = serde_json::from_str(trimmed).map_err(|e| {
                LoaderError::Config(format!("Invalid primary key mapping '{}': {}", trimmed, e))
            })?;
            return Ok(Self(map));
        }

        trimmed
            .split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                pair.split_once(':')
                    .map(|(table, column)| (table.trim().to_string(), column.trim().to_string()))
                    .filter(|(table, _)| !table.is_empty())
                    .ok_or_else(|| {
                        LoaderError::Config(format!(
                            "Invalid primary key entry '{}', expected table:column",
                            pair
                        ))
                    })
            })
            .collect()
    }
}

/// Build the load unit for one table group.
///
/// Tables with a configured primary key are merged and every row carries
/// `__deleted`; the destination treats it as a soft-delete marker, it does not
/// remove the row. Tables without one are appended and every row carries
/// `__op` (`"delete"` for deletes, the raw operation code otherwise).
/// Payloads are owned by the group, so they are tagged in place.
pub fn build_load_unit(group: TableGroup, primary_keys: &PrimaryKeys) -> LoadUnit {
    let primary_key = primary_keys.get(&group.table).map(str::to_string);
    let write_disposition = if primary_key.is_some() {
        WriteDisposition::Merge
    } else {
        WriteDisposition::Append
    };

    let rows = group
        .events
        .into_iter()
        .map(|event| {
            let mut row = event.payload;
            match write_disposition {
                WriteDisposition::Merge => {
                    row.insert(DELETED_COLUMN.to_string(), Value::Bool(event.op.is_delete()));
                }
                WriteDisposition::Append => {
                    let op = if event.op.is_delete() {
                        "delete"
                    } else {
                        event.op.code()
                    };
                    row.insert(OP_COLUMN.to_string(), Value::String(op.to_string()));
                }
            }
            row
        })
        .collect();

    LoadUnit {
        table: group.table,
        write_disposition,
        primary_key,
        rows,
    }
}
