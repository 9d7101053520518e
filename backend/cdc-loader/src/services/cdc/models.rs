use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A single row image as delivered by Debezium (column name -> value)
pub type Row = Map<String, Value>;

/// Raw change record copied out of an engine handle.
///
/// Holds only owned data so nothing refers back to engine-owned memory once
/// the engine callback returns. `value` is `None` for a tombstone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawChangeRecord {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub destination: String,
}

impl RawChangeRecord {
    pub fn new(key: Option<Vec<u8>>, value: Option<Vec<u8>>, destination: impl Into<String>) -> Self {
        Self {
            key,
            value,
            destination: destination.into(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A batch of records delivered atomically by one engine callback
pub type Batch = Vec<RawChangeRecord>;

/// CDC operation types from Debezium
///
/// Codes outside `c`/`u`/`d`/`r` are kept verbatim in `Other` so they can be
/// passed downstream unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeOp {
    /// Insert operation (c = create)
    Create,
    /// Update operation (u = update)
    Update,
    /// Delete operation (d = delete)
    Delete,
    /// Read operation (r = read, initial snapshot)
    Read,
    Other(String),
}

impl ChangeOp {
    /// The operation code exactly as Debezium sent it
    pub fn code(&self) -> &str {
        match self {
            ChangeOp::Create => "c",
            ChangeOp::Update => "u",
            ChangeOp::Delete => "d",
            ChangeOp::Read => "r",
            ChangeOp::Other(code) => code,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeOp::Delete)
    }
}

impl From<&str> for ChangeOp {
    fn from(code: &str) -> Self {
        match code {
            "c" => ChangeOp::Create,
            "u" => ChangeOp::Update,
            "d" => ChangeOp::Delete,
            "r" => ChangeOp::Read,
            other => ChangeOp::Other(other.to_string()),
        }
    }
}

impl From<String> for ChangeOp {
    fn from(code: String) -> Self {
        match code.as_str() {
            "c" | "u" | "d" | "r" => ChangeOp::from(code.as_str()),
            _ => ChangeOp::Other(code),
        }
    }
}

impl From<ChangeOp> for String {
    fn from(op: ChangeOp) -> Self {
        match op {
            ChangeOp::Other(code) => code,
            known => known.code().to_string(),
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Debezium change envelope
///
/// When `value.converter.schemas.enable = false`, Debezium sends the payload directly
/// without a wrapper object. An object carrying a `payload` key is always
/// decoded as the wrapped form, so a broken payload reports its own error.
#[derive(Debug, Clone)]
pub enum ChangeEnvelope {
    /// Format with schema wrapper (value.converter.schemas.enable = true)
    WithSchema { payload: ChangePayload },
    /// Format without schema wrapper (value.converter.schemas.enable = false)
    WithoutSchema(ChangePayload),
}

impl<'de> Deserialize<'de> for ChangeEnvelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut object = Map::<String, Value>::deserialize(deserializer)?;
        match object.remove("payload") {
            Some(payload) => serde_json::from_value(payload)
                .map(|payload| ChangeEnvelope::WithSchema { payload })
                .map_err(de::Error::custom),
            None => serde_json::from_value(Value::Object(object))
                .map(ChangeEnvelope::WithoutSchema)
                .map_err(de::Error::custom),
        }
    }
}

impl ChangeEnvelope {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Get the payload regardless of message format
    pub fn payload(&self) -> &ChangePayload {
        match self {
            ChangeEnvelope::WithSchema { payload } => payload,
            ChangeEnvelope::WithoutSchema(payload) => payload,
        }
    }

    pub fn into_payload(self) -> ChangePayload {
        match self {
            ChangeEnvelope::WithSchema { payload } => payload,
            ChangeEnvelope::WithoutSchema(payload) => payload,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangePayload {
    /// Operation type (c/u/d/r, anything else passed through)
    pub op: Option<ChangeOp>,

    /// State before the change (null for Insert, populated for Update/Delete)
    pub before: Option<Value>,

    /// State after the change (populated for Insert/Update, null for Delete)
    pub after: Option<Value>,

    /// Source metadata (database, table, timestamp, etc.)
    pub source: Option<ChangeSource>,

    /// Transaction timestamp, kept as sent
    pub ts_ms: Option<Value>,
}

impl ChangePayload {
    /// Table name from the source block, if present and non-empty
    pub fn table(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|s| s.table.as_deref())
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeSource {
    /// Connector type (e.g., "mysql")
    pub connector: Option<Value>,

    /// Database name
    pub db: Option<Value>,

    /// Table name
    pub table: Option<String>,

    /// Timestamp, kept as sent
    pub ts_ms: Option<Value>,
}

/// A change event normalized for loading: operation, target table and the
/// row image that represents it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub op: ChangeOp,
    pub table: String,
    pub payload: Row,
}
