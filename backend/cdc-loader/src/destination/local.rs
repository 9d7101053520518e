//! Filesystem destination.
//!
//! Each dataset is a directory holding one JSON-lines file per table plus a
//! `_loads.jsonl` journal with one entry per successful load. A load stages
//! every touched table to a temporary file and renames them into place only
//! after all of them were written, so a failed load leaves existing tables
//! untouched.

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{LoadInfo, LoadPipeline, TableLoadInfo};
use crate::error::{LoaderError, Result};
use crate::services::cdc::{LoadUnit, Row, WriteDisposition};

const LOADS_JOURNAL: &str = "_loads.jsonl";
const TABLE_EXTENSION: &str = "jsonl";

pub struct LocalDestination {
    pipeline_name: String,
    dataset_name: String,
    dataset_dir: PathBuf,
    /// Files written since the last sync
    unsynced: BTreeSet<PathBuf>,
}

impl LocalDestination {
    /// Open (creating if needed) the dataset directory under `data_dir`
    pub fn open(
        data_dir: impl AsRef<Path>,
        pipeline_name: impl Into<String>,
        dataset_name: impl Into<String>,
    ) -> Result<Self> {
        let dataset_name = dataset_name.into();
        let dataset_dir = data_dir.as_ref().join(encode_name(&dataset_name));
        fs::create_dir_all(&dataset_dir)?;

        info!(
            dataset_dir = %dataset_dir.display(),
            "Local destination ready"
        );

        Ok(Self {
            pipeline_name: pipeline_name.into(),
            dataset_name,
            dataset_dir,
            unsynced: BTreeSet::new(),
        })
    }

    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dataset_dir
            .join(format!("{}.{}", encode_name(table), TABLE_EXTENSION))
    }

    /// Current rows of `table`; a table that was never loaded is empty
    pub fn read_table(&self, table: &str) -> Result<Vec<Row>> {
        read_rows(&self.table_path(table))
    }

    fn stage(&self, units: &[LoadUnit]) -> Result<HashMap<PathBuf, Vec<Row>>> {
        let mut staged: HashMap<PathBuf, Vec<Row>> = HashMap::new();

        for unit in units {
            let path = self.table_path(&unit.table);
            let current = match staged.remove(&path) {
                Some(rows) => rows,
                None => read_rows(&path)?,
            };

            let rows = match unit.write_disposition {
                WriteDisposition::Append => {
                    let mut rows = current;
                    rows.extend(unit.rows.iter().cloned());
                    rows
                }
                WriteDisposition::Merge => {
                    let key = unit.primary_key.as_deref().ok_or_else(|| {
                        LoaderError::Load(format!(
                            "merge load for table '{}' has no primary key",
                            unit.table
                        ))
                    })?;
                    merge_rows(&unit.table, key, current, &unit.rows)?
                }
            };
            staged.insert(path, rows);
        }

        Ok(staged)
    }

    /// Move staged files into place; on failure no temp file is left behind
    fn commit(&mut self, temp_files: Vec<(PathBuf, PathBuf)>) -> Result<()> {
        let mut pending = temp_files.into_iter();
        while let Some((temp, path)) = pending.next() {
            if let Err(e) = fs::rename(&temp, &path) {
                let _ = fs::remove_file(&temp);
                for (rest, _) in pending {
                    let _ = fs::remove_file(&rest);
                }
                return Err(e.into());
            }
            self.unsynced.insert(path);
        }
        Ok(())
    }

    fn append_journal(&mut self, info: &LoadInfo) -> Result<()> {
        let path = self.dataset_dir.join(LOADS_JOURNAL);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(info)?)?;
        self.unsynced.insert(path);
        Ok(())
    }
}

impl LoadPipeline for LocalDestination {
    fn run(&mut self, units: Vec<LoadUnit>) -> Result<LoadInfo> {
        let load_id = Uuid::new_v4();
        let started_at = Utc::now();

        let staged = self.stage(&units)?;

        let mut temp_files = Vec::with_capacity(staged.len());
        for (path, rows) in &staged {
            let temp = path.with_extension(format!("{}.tmp-{}", TABLE_EXTENSION, load_id));
            if let Err(e) = write_rows(&temp, rows) {
                let _ = fs::remove_file(&temp);
                for (written, _) in &temp_files {
                    let _ = fs::remove_file(written);
                }
                return Err(e);
            }
            temp_files.push((temp, path.clone()));
        }

        self.commit(temp_files)?;

        let info = LoadInfo {
            load_id,
            pipeline_name: self.pipeline_name.clone(),
            dataset_name: self.dataset_name.clone(),
            started_at,
            finished_at: Utc::now(),
            tables: units
                .iter()
                .map(|unit| TableLoadInfo {
                    table: unit.table.clone(),
                    write_disposition: unit.write_disposition,
                    rows: unit.rows.len(),
                })
                .collect(),
        };

        if let Err(e) = self.append_journal(&info) {
            warn!(load_id = %load_id, error = %e, "Failed to record load in journal");
        }

        debug!(load_id = %load_id, tables = info.tables.len(), "Local load committed");
        Ok(info)
    }

    fn sync_destination(&mut self) -> Result<()> {
        // A path leaves the set only once it is on disk
        let pending: Vec<PathBuf> = self.unsynced.iter().cloned().collect();
        for path in &pending {
            File::open(path)?.sync_all()?;
            self.unsynced.remove(path);
        }

        #[cfg(unix)]
        File::open(&self.dataset_dir)?.sync_all()?;

        debug!(files = pending.len(), "Local destination synced");
        Ok(())
    }
}

/// Upsert `incoming` into `current` by the value of `key`; later rows win
fn merge_rows(table: &str, key: &str, current: Vec<Row>, incoming: &[Row]) -> Result<Vec<Row>> {
    let mut by_key: IndexMap<String, Row> = IndexMap::with_capacity(current.len() + incoming.len());

    for (index, row) in current.into_iter().enumerate() {
        // Rows written before the table had a key stay as they are
        let id = match row.get(key) {
            Some(value) if !value.is_null() => serde_json::to_string(value)?,
            _ => format!("\u{0}unkeyed-{}", index),
        };
        by_key.insert(id, row);
    }

    for row in incoming {
        let id = match row.get(key) {
            Some(value) if !value.is_null() => serde_json::to_string(value)?,
            _ => {
                return Err(LoaderError::Load(format!(
                    "row for table '{}' is missing primary key column '{}'",
                    table, key
                )))
            }
        };
        by_key.insert(id, row.clone());
    }

    Ok(by_key.into_values().collect())
}

fn read_rows(path: &Path) -> Result<Vec<Row>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut rows = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line)? {
            Value::Object(row) => rows.push(row),
            _ => {
                return Err(LoaderError::Load(format!(
                    "{}:{} is not a JSON object",
                    path.display(),
                    line_no + 1
                )))
            }
        }
    }
    Ok(rows)
}

fn write_rows(path: &Path, rows: &[Row]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Reversible file name for a table or dataset.
///
/// ASCII letters and digits are kept, `_` becomes `__` and every other byte
/// becomes `_xx` (lowercase hex), so distinct names never share a file.
fn encode_name(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }

    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'_' => encoded.push_str("__"),
            b if b.is_ascii_alphanumeric() => encoded.push(b as char),
            b => encoded.push_str(&format!("_{:02x}", b)),
        }
    }
    encoded
}
