//! Relational persistence.
//!
//! A [`Persister`] writes [`PersistableRecord`]s into a table described by a
//! [`TableDescriptor`]. Batches are written as one statement: either every
//! record is applied or the call fails and nothing changes.
//!
//! Implementations:
//! - `postgres`: sqlx + sea-query (feature `postgres`)
//! - `mock`: in-memory, with failure injection

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use mock::MockPersister;
#[cfg(feature = "postgres")]
pub use postgres::PostgresPersister;

/// Postgres identifier length limit.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Errors that can occur during persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "postgres")]
    #[error("Query build error: {0}")]
    Query(#[from] sea_query::error::Error),

    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Column mismatch on {table}: {message}")]
    ColumnMismatch { table: String, message: String },

    #[error("Table {0} does not exist")]
    UnknownTable(String),

    #[error("Table {0} has no retention column")]
    NoRetentionColumn(String),

    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Column storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    BigInt,
    Timestamp,
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }

    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

/// Schema, table, key and columns of a persisted entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub schema: String,
    pub table: String,
    pub primary_key: String,
    /// Timestamp column used by [`Persister::delete_expired`].
    pub retention_column: Option<String>,
    /// Every column, the primary key included.
    pub columns: Vec<ColumnSpec>,
}

impl TableDescriptor {
    /// `schema.table`, for logs and errors.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Columns other than the primary key.
    pub fn value_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(move |c| c.name != self.primary_key)
    }

    /// Check identifiers and that key and retention columns exist.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.schema)?;
        validate_identifier(&self.table)?;
        for column in &self.columns {
            validate_identifier(&column.name)?;
        }

        let mismatch = |message: String| PersistError::ColumnMismatch {
            table: self.qualified_name(),
            message,
        };
        if self.column(&self.primary_key).is_none() {
            return Err(mismatch(format!(
                "primary key '{}' is not a column",
                self.primary_key
            )));
        }
        if let Some(retention) = &self.retention_column {
            match self.column(retention) {
                Some(c) if c.column_type == ColumnType::Timestamp => {}
                Some(_) => {
                    return Err(mismatch(format!(
                        "retention column '{}' is not a timestamp",
                        retention
                    )))
                }
                None => {
                    return Err(mismatch(format!(
                        "retention column '{}' is not a column",
                        retention
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Accept plain SQL identifiers only: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(PersistError::InvalidIdentifier(name.to_string()))
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Text(String),
    BigInt(i64),
    Timestamp(DateTime<Utc>),
    Null,
}

impl ColumnValue {
    fn matches(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (ColumnValue::Null, _)
                | (ColumnValue::Text(_), ColumnType::Text)
                | (ColumnValue::BigInt(_), ColumnType::BigInt)
                | (ColumnValue::Timestamp(_), ColumnType::Timestamp)
        )
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Text(s) => write!(f, "{}", s),
            ColumnValue::BigInt(n) => write!(f, "{}", n),
            ColumnValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            ColumnValue::Null => f.write_str("NULL"),
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::BigInt(value)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(value: DateTime<Utc>) -> Self {
        ColumnValue::Timestamp(value)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ColumnValue::Null)
    }
}

/// A row to write, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistableRecord {
    values: BTreeMap<String, ColumnValue>,
}

impl PersistableRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<ColumnValue>) {
        self.values.insert(column.into(), value.into());
    }

    /// Value of `column`; absent columns read as `Null`.
    pub fn get(&self, column: &str) -> &ColumnValue {
        self.values.get(column).unwrap_or(&ColumnValue::Null)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &ColumnValue)> {
        self.values.iter()
    }

    /// Check the record against `table`: known columns, matching types, a
    /// non-null key, and values for every required column.
    pub fn validate(&self, table: &TableDescriptor) -> Result<()> {
        let mismatch = |message: String| PersistError::ColumnMismatch {
            table: table.qualified_name(),
            message,
        };
        for (name, value) in &self.values {
            let column = table
                .column(name)
                .ok_or_else(|| mismatch(format!("unknown column '{}'", name)))?;
            if !value.matches(column.column_type) {
                return Err(mismatch(format!(
                    "column '{}' expects {:?}, got {:?}",
                    name, column.column_type, value
                )));
            }
        }
        for column in &table.columns {
            let nullable = column.nullable && column.name != table.primary_key;
            if !nullable && *self.get(&column.name) == ColumnValue::Null {
                return Err(mismatch(format!("column '{}' is required", column.name)));
            }
        }
        Ok(())
    }
}

/// What happens when an inserted key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the existing row (first writer wins).
    Skip,
    /// Overwrite every non-key column (last writer wins).
    Update,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::Skip => f.write_str("skip"),
            ConflictStrategy::Update => f.write_str("update"),
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(ConflictStrategy::Skip),
            "update" => Ok(ConflictStrategy::Update),
            other => Err(format!("unknown conflict strategy '{}'", other)),
        }
    }
}

/// Validate `records` and fold repeated keys within the batch.
///
/// A single statement cannot touch the same key twice, so the batch is
/// reduced first in the way the strategy would resolve it against the table:
/// `Skip` keeps the first occurrence, `Update` the last. Order of first
/// appearance is preserved.
pub fn collapse_conflicts(
    table: &TableDescriptor,
    records: &[PersistableRecord],
    strategy: ConflictStrategy,
) -> Result<Vec<PersistableRecord>> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: BTreeMap<String, PersistableRecord> = BTreeMap::new();

    for record in records {
        record.validate(table)?;
        let key = record.get(&table.primary_key).to_string();
        match by_key.get_mut(&key) {
            None => {
                order.push(key.clone());
                by_key.insert(key, record.clone());
            }
            Some(existing) => {
                if strategy == ConflictStrategy::Update {
                    *existing = record.clone();
                }
            }
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect())
}

/// Relational store used by the consumer and the maintenance tools.
///
/// Each task owns its own persister; implementations hold a single
/// connection and are not meant to be shared across concurrent loops.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn schema_exists(&self, schema: &str) -> Result<bool>;

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    /// Create the schema and then the table if absent. Never alters an
    /// existing table. Returns true if anything was created.
    async fn ensure_table(&self, table: &TableDescriptor) -> Result<bool>;

    /// Insert `records` as one atomic statement, resolving key conflicts with
    /// `strategy`. Returns the number of rows written.
    async fn insert_batch(
        &self,
        table: &TableDescriptor,
        records: &[PersistableRecord],
        strategy: ConflictStrategy,
    ) -> Result<u64>;

    async fn count(&self, table: &TableDescriptor) -> Result<u64>;

    /// Row with primary key `key`, if any.
    async fn fetch(
        &self,
        table: &TableDescriptor,
        key: &ColumnValue,
    ) -> Result<Option<PersistableRecord>>;

    /// Delete rows whose retention column is older than `cutoff`.
    async fn delete_expired(&self, table: &TableDescriptor, cutoff: DateTime<Utc>) -> Result<u64>;

    /// `DROP TABLE IF EXISTS`.
    async fn drop_table(&self, table: &TableDescriptor) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> TableDescriptor {
        TableDescriptor {
            schema: "test".to_string(),
            table: "people".to_string(),
            primary_key: "id".to_string(),
            retention_column: None,
            columns: vec![
                ColumnSpec::required("id", ColumnType::BigInt),
                ColumnSpec::nullable("name", ColumnType::Text),
            ],
        }
    }

    fn person(id: i64, name: &str) -> PersistableRecord {
        PersistableRecord::new().with("id", id).with("name", name)
    }

    fn names(records: &[PersistableRecord]) -> Vec<&str> {
        records
            .iter()
            .filter_map(|r| r.get("name").as_text())
            .collect()
    }

    #[test]
    fn test_collapse_skip_keeps_first() {
        let batch = vec![person(1, "Alice"), person(2, "Bob"), person(1, "John")];
        let collapsed = collapse_conflicts(&people(), &batch, ConflictStrategy::Skip).unwrap();
        assert_eq!(names(&collapsed), vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_collapse_update_keeps_last() {
        let batch = vec![person(1, "Alice"), person(2, "Bob"), person(1, "John")];
        let collapsed = collapse_conflicts(&people(), &batch, ConflictStrategy::Update).unwrap();
        assert_eq!(names(&collapsed), vec!["John", "Bob"]);
    }

    #[test]
    fn test_record_validation() {
        let table = people();
        assert!(person(1, "Alice").validate(&table).is_ok());
        assert!(PersistableRecord::new().with("id", 1i64).validate(&table).is_ok());

        let unknown = person(1, "Alice").with("age", 3i64);
        assert!(matches!(
            unknown.validate(&table),
            Err(PersistError::ColumnMismatch { .. })
        ));

        let wrong_type = PersistableRecord::new().with("id", "one");
        assert!(wrong_type.validate(&table).is_err());

        let no_key = PersistableRecord::new().with("name", "Alice");
        assert!(no_key.validate(&table).is_err());
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(people().validate().is_ok());

        let mut bad_key = people();
        bad_key.primary_key = "missing".to_string();
        assert!(bad_key.validate().is_err());

        let mut bad_retention = people();
        bad_retention.retention_column = Some("name".to_string());
        assert!(bad_retention.validate().is_err());

        let mut bad_name = people();
        bad_name.table = "people; DROP TABLE x".to_string();
        assert!(matches!(
            bad_name.validate(),
            Err(PersistError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("simple_message").is_ok());
        assert!(validate_identifier("_t1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("SKIP".parse::<ConflictStrategy>(), Ok(ConflictStrategy::Skip));
        assert_eq!("update".parse::<ConflictStrategy>(), Ok(ConflictStrategy::Update));
        assert!("merge".parse::<ConflictStrategy>().is_err());
        assert_eq!(ConflictStrategy::Update.to_string(), "update");
    }
}
