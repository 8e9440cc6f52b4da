use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ScraperResult;
use crate::program::DataFilter;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryDataStore;
pub use sqlite::SqliteDataStore;

/// Column types a data store understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
    Blob,
}

impl ColumnType {
    pub fn sql_name(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
            Self::Blob => "BLOB",
        }
    }

    pub fn from_sql_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Some(Self::Text),
            "INTEGER" => Some(Self::Integer),
            "REAL" => Some(Self::Real),
            "BOOLEAN" => Some(Self::Boolean),
            "TIMESTAMP" => Some(Self::Timestamp),
            "BLOB" => Some(Self::Blob),
            _ => None,
        }
    }

    /// Normalizes a JSON value to the canonical form stored in a column
    ///
    /// Scraped text is accepted for numeric, boolean and timestamp columns
    /// when it parses. Timestamps are Unix milliseconds, blobs are base64.
    pub fn coerce(self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        let mismatch = || format!("cannot store {} in a {} column", value, self.sql_name());

        match self {
            Self::Text => Ok(match value {
                Value::String(s) => Value::String(s.clone()),
                Value::Number(n) => Value::String(n.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                other => Value::String(other.to_string()),
            }),
            Self::Integer => match value {
                Value::Number(n) if n.is_i64() => Ok(value.clone()),
                Value::Number(n) => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| Value::from(f as i64))
                    .ok_or_else(mismatch),
                Value::Bool(b) => Ok(Value::from(*b as i64)),
                Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch()),
                _ => Err(mismatch()),
            },
            Self::Real => match value {
                Value::Number(n) => n.as_f64().map(Value::from).ok_or_else(mismatch),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Value::from)
                    .ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            Self::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(mismatch()),
                },
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(mismatch()),
                },
                _ => Err(mismatch()),
            },
            Self::Timestamp => match value {
                Value::Number(n) => n.as_i64().map(Value::from).ok_or_else(mismatch),
                Value::String(s) => {
                    if let Ok(millis) = s.trim().parse::<i64>() {
                        Ok(Value::from(millis))
                    } else {
                        chrono::DateTime::parse_from_rfc3339(s.trim())
                            .map(|dt| Value::from(dt.timestamp_millis()))
                            .map_err(|_| mismatch())
                    }
                }
                _ => Err(mismatch()),
            },
            Self::Blob => match value {
                Value::String(s) => base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map(|_| value.clone())
                    .map_err(|_| format!("BLOB values must be base64 encoded, got {}", value)),
                _ => Err(mismatch()),
            },
        }
    }
}

/// Column definition used when creating a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// A stored row, keyed by its integer primary key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub values: Map<String, Value>,
}

/// A record bound to an iteration, together with the store it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundRecord {
    pub store: String,
    pub record: Record,
}

/// Which row a read addresses
#[derive(Debug, Clone, Copy)]
pub enum RowSelector<'a> {
    Row(i64),
    /// First matching row in primary-key order
    Filtered(&'a [DataFilter]),
}

/// Whether a write creates a row or updates an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Insert,
    Update(i64),
}

/// External data store adapter
///
/// All reads and writes made by a running program go through this trait.
/// Implementations serialize writes per store; `set_many` is atomic.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn create_store(&self, name: &str, columns: &[ColumnDef]) -> ScraperResult<()>;

    async fn columns(&self, store: &str) -> ScraperResult<Vec<ColumnDef>>;

    /// `None` when no row matches
    async fn get(&self, store: &str, column: &str, selector: RowSelector<'_>) -> ScraperResult<Option<Value>>;

    async fn set(&self, store: &str, target: WriteTarget, column: &str, value: Value) -> ScraperResult<i64> {
        let mut values = Map::new();
        values.insert(column.to_string(), value);
        self.set_many(store, target, values).await
    }

    /// Writes every column in one transaction and returns the row id
    async fn set_many(&self, store: &str, target: WriteTarget, values: Map<String, Value>) -> ScraperResult<i64>;

    /// Deletes matching rows and returns how many were removed
    async fn delete(&self, store: &str, filters: &[DataFilter]) -> ScraperResult<usize>;

    async fn delete_row(&self, store: &str, id: i64) -> ScraperResult<bool>;

    /// Ids of matching rows in primary-key order
    async fn row_ids(&self, store: &str, filters: &[DataFilter]) -> ScraperResult<Vec<i64>>;

    async fn row(&self, store: &str, id: i64) -> ScraperResult<Option<Record>>;
}
