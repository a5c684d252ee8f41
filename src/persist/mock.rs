//! In-memory Persister for testing.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    collapse_conflicts, ColumnValue, ConflictStrategy, PersistError, PersistableRecord, Persister,
    Result, TableDescriptor,
};

#[derive(Default)]
struct MockState {
    schemas: BTreeSet<String>,
    /// (schema, table) -> rows keyed by rendered primary key.
    tables: BTreeMap<(String, String), BTreeMap<String, PersistableRecord>>,
}

/// Persister that keeps tables in memory.
#[derive(Default)]
pub struct MockPersister {
    state: RwLock<MockState>,
    fail_on_insert: RwLock<bool>,
    insert_calls: RwLock<usize>,
}

impl MockPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_insert(&self, fail: bool) {
        *self.fail_on_insert.write().await = fail;
    }

    /// Number of `insert_batch` calls, failed ones included.
    pub async fn insert_calls(&self) -> usize {
        *self.insert_calls.read().await
    }

    /// Every row of `table`, ordered by key.
    pub async fn rows(&self, table: &TableDescriptor) -> Vec<PersistableRecord> {
        self.state
            .read()
            .await
            .tables
            .get(&key(table))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn key(table: &TableDescriptor) -> (String, String) {
    (table.schema.clone(), table.table.clone())
}

#[async_trait]
impl Persister for MockPersister {
    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        Ok(self.state.read().await.schemas.contains(schema))
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        Ok(self
            .state
            .read()
            .await
            .tables
            .contains_key(&(schema.to_string(), table.to_string())))
    }

    async fn ensure_table(&self, table: &TableDescriptor) -> Result<bool> {
        table.validate()?;
        let mut state = self.state.write().await;
        let created_schema = state.schemas.insert(table.schema.clone());
        let mut created_table = false;
        state.tables.entry(key(table)).or_insert_with(|| {
            created_table = true;
            BTreeMap::new()
        });
        Ok(created_schema || created_table)
    }

    async fn insert_batch(
        &self,
        table: &TableDescriptor,
        records: &[PersistableRecord],
        strategy: ConflictStrategy,
    ) -> Result<u64> {
        *self.insert_calls.write().await += 1;
        if *self.fail_on_insert.read().await {
            return Err(PersistError::Injected(format!(
                "insert into {}",
                table.qualified_name()
            )));
        }

        let batch = collapse_conflicts(table, records, strategy)?;
        let mut state = self.state.write().await;
        let rows = state
            .tables
            .get_mut(&key(table))
            .ok_or_else(|| PersistError::UnknownTable(table.qualified_name()))?;

        let mut written = 0;
        for record in batch {
            let pk = record.get(&table.primary_key).to_string();
            match strategy {
                ConflictStrategy::Skip if rows.contains_key(&pk) => {}
                _ => {
                    rows.insert(pk, record);
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn count(&self, table: &TableDescriptor) -> Result<u64> {
        let state = self.state.read().await;
        let rows = state
            .tables
            .get(&key(table))
            .ok_or_else(|| PersistError::UnknownTable(table.qualified_name()))?;
        Ok(rows.len() as u64)
    }

    async fn fetch(
        &self,
        table: &TableDescriptor,
        pk: &ColumnValue,
    ) -> Result<Option<PersistableRecord>> {
        let state = self.state.read().await;
        let rows = state
            .tables
            .get(&key(table))
            .ok_or_else(|| PersistError::UnknownTable(table.qualified_name()))?;
        Ok(rows.get(&pk.to_string()).cloned())
    }

    async fn delete_expired(&self, table: &TableDescriptor, cutoff: DateTime<Utc>) -> Result<u64> {
        let column = table
            .retention_column
            .clone()
            .ok_or_else(|| PersistError::NoRetentionColumn(table.qualified_name()))?;
        let mut state = self.state.write().await;
        let rows = state
            .tables
            .get_mut(&key(table))
            .ok_or_else(|| PersistError::UnknownTable(table.qualified_name()))?;

        let before = rows.len();
        rows.retain(|_, record| match record.get(&column) {
            ColumnValue::Timestamp(at) => *at >= cutoff,
            _ => true,
        });
        Ok((before - rows.len()) as u64)
    }

    async fn drop_table(&self, table: &TableDescriptor) -> Result<()> {
        self.state.write().await.tables.remove(&key(table));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{ColumnSpec, ColumnType};
    use chrono::Duration;

    fn people() -> TableDescriptor {
        TableDescriptor {
            schema: "test".to_string(),
            table: "people".to_string(),
            primary_key: "id".to_string(),
            retention_column: Some("seen_at".to_string()),
            columns: vec![
                ColumnSpec::required("id", ColumnType::BigInt),
                ColumnSpec::nullable("name", ColumnType::Text),
                ColumnSpec::nullable("seen_at", ColumnType::Timestamp),
            ],
        }
    }

    fn batch() -> Vec<PersistableRecord> {
        vec![
            PersistableRecord::new().with("id", 1i64).with("name", "Alice"),
            PersistableRecord::new().with("id", 2i64).with("name", "Bob"),
            PersistableRecord::new().with("id", 1i64).with("name", "John"),
        ]
    }

    async fn name_of(persister: &MockPersister, id: i64) -> String {
        persister
            .fetch(&people(), &ColumnValue::BigInt(id))
            .await
            .unwrap()
            .unwrap()
            .get("name")
            .as_text()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_skip_strategy_keeps_first_writer() {
        let persister = MockPersister::new();
        persister.ensure_table(&people()).await.unwrap();
        persister
            .insert_batch(&people(), &batch(), ConflictStrategy::Skip)
            .await
            .unwrap();

        assert_eq!(name_of(&persister, 1).await, "Alice");
        assert_eq!(persister.count(&people()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_strategy_keeps_last_writer() {
        let persister = MockPersister::new();
        persister.ensure_table(&people()).await.unwrap();
        persister
            .insert_batch(&people(), &batch(), ConflictStrategy::Update)
            .await
            .unwrap();

        assert_eq!(name_of(&persister, 1).await, "John");
        assert_eq!(persister.count(&people()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_record_changes_nothing() {
        let persister = MockPersister::new();
        persister.ensure_table(&people()).await.unwrap();
        let mut records = batch();
        records.push(PersistableRecord::new().with("id", 3i64).with("unknown", "x"));

        assert!(persister
            .insert_batch(&people(), &records, ConflictStrategy::Skip)
            .await
            .is_err());
        assert_eq!(persister.count(&people()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ensure_table_is_idempotent() {
        let persister = MockPersister::new();
        assert!(!persister.schema_exists("test").await.unwrap());
        assert!(persister.ensure_table(&people()).await.unwrap());
        assert!(!persister.ensure_table(&people()).await.unwrap());
        assert!(persister.table_exists("test", "people").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_expired_and_drop() {
        let persister = MockPersister::new();
        let table = people();
        persister.ensure_table(&table).await.unwrap();
        let now = Utc::now();
        let records = vec![
            PersistableRecord::new()
                .with("id", 1i64)
                .with("seen_at", now - Duration::days(10)),
            PersistableRecord::new().with("id", 2i64).with("seen_at", now),
        ];
        persister
            .insert_batch(&table, &records, ConflictStrategy::Skip)
            .await
            .unwrap();

        let removed = persister
            .delete_expired(&table, now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(persister.count(&table).await.unwrap(), 1);

        persister.drop_table(&table).await.unwrap();
        assert!(!persister.table_exists("test", "people").await.unwrap());
        assert!(matches!(
            persister.count(&table).await,
            Err(PersistError::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let persister = MockPersister::new();
        persister.ensure_table(&people()).await.unwrap();
        persister.set_fail_on_insert(true).await;

        let result = persister
            .insert_batch(&people(), &batch(), ConflictStrategy::Skip)
            .await;
        assert!(matches!(result, Err(PersistError::Injected(_))));
        assert_eq!(persister.insert_calls().await, 1);
    }
}
