use serde_json::Value;
use std::fmt;

use super::models::{ChangeEnvelope, ParsedEvent, RawChangeRecord};

/// Why a raw record produced no event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Null value; the preceding delete already carried the row image
    Tombstone,
    /// Value is not a usable Debezium envelope
    Malformed(String),
    /// The selected before/after image is null, empty or not an object
    MissingImage,
    MissingTable,
}

impl DropReason {
    /// Stable label for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Tombstone => "tombstone",
            DropReason::Malformed(_) => "malformed",
            DropReason::MissingImage => "missing_image",
            DropReason::MissingTable => "missing_table",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Malformed(detail) => write!(f, "malformed: {}", detail),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Parse one raw record into a normalized change event.
///
/// `Err` is the drop sentinel and never aborts the surrounding batch. Deletes
/// take the `before` image, every other operation takes `after`.
pub fn parse_event(record: &RawChangeRecord) -> Result<ParsedEvent, DropReason> {
    let value = record.value.as_deref().ok_or(DropReason::Tombstone)?;

    let envelope = ChangeEnvelope::from_slice(value)
        .map_err(|e| DropReason::Malformed(format!("invalid change envelope: {}", e)))?;
    let payload = envelope.into_payload();
    let table = payload.table().map(str::to_string);

    let op = payload
        .op
        .ok_or_else(|| DropReason::Malformed("missing 'op' field".to_string()))?;

    let image = if op.is_delete() {
        payload.before
    } else {
        payload.after
    };
    let row = match image {
        Some(Value::Object(row)) if !row.is_empty() => row,
        _ => return Err(DropReason::MissingImage),
    };

    let table = table.ok_or(DropReason::MissingTable)?;

    Ok(ParsedEvent {
        op,
        table,
        payload: row,
    })
}
