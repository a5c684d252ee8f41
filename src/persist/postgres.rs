//! PostgreSQL Persister.
//!
//! DDL and reads are rendered with sea-query; inserts and deletes carry
//! user data and are bound through sea-query-binder.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{
    Alias, Asterisk, ColumnDef, Expr, Func, InsertStatement, IntoTableRef, OnConflict,
    PostgresQueryBuilder, Query, SimpleExpr, Table, TableRef,
};
use sea_query_binder::SqlxBinder;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use super::{
    collapse_conflicts, ColumnSpec, ColumnType, ColumnValue, ConflictStrategy, PersistError,
    PersistableRecord, Persister, Result, TableDescriptor,
};

/// Persister backed by a single Postgres connection.
pub struct PostgresPersister {
    pool: PgPool,
}

impl PostgresPersister {
    /// Connect to `uri` with one connection.
    pub async fn connect(uri: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(1).connect(uri).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn table_ref(table: &TableDescriptor) -> TableRef {
    (
        Alias::new(table.schema.as_str()),
        Alias::new(table.table.as_str()),
    )
        .into_table_ref()
}

fn column_def(table: &TableDescriptor, column: &ColumnSpec) -> ColumnDef {
    let mut def = ColumnDef::new(Alias::new(column.name.as_str()));
    match column.column_type {
        ColumnType::Text => def.text(),
        ColumnType::BigInt => def.big_integer(),
        ColumnType::Timestamp => def.timestamp_with_time_zone(),
    };
    if column.name == table.primary_key {
        def.primary_key();
    } else if !column.nullable {
        def.not_null();
    }
    def
}

/// Bindable value for `column_type`. Nulls are typed so Postgres can infer them.
fn to_expr(value: &ColumnValue, column_type: ColumnType) -> SimpleExpr {
    let value: sea_query::Value = match (value, column_type) {
        (ColumnValue::Text(s), _) => s.clone().into(),
        (ColumnValue::BigInt(n), _) => (*n).into(),
        (ColumnValue::Timestamp(t), _) => (*t).into(),
        (ColumnValue::Null, ColumnType::Text) => sea_query::Value::String(None),
        (ColumnValue::Null, ColumnType::BigInt) => sea_query::Value::BigInt(None),
        (ColumnValue::Null, ColumnType::Timestamp) => sea_query::Value::ChronoDateTimeUtc(None),
    };
    value.into()
}

fn decode(row: &PgRow, table: &TableDescriptor) -> Result<PersistableRecord> {
    let mut record = PersistableRecord::new();
    for column in &table.columns {
        let name = column.name.as_str();
        let value: ColumnValue = match column.column_type {
            ColumnType::Text => row.try_get::<Option<String>, _>(name)?.into(),
            ColumnType::BigInt => row.try_get::<Option<i64>, _>(name)?.into(),
            ColumnType::Timestamp => row.try_get::<Option<DateTime<Utc>>, _>(name)?.into(),
        };
        record.set(name, value);
    }
    Ok(record)
}

/// Single INSERT for an already collapsed batch.
fn insert_statement(
    table: &TableDescriptor,
    batch: &[PersistableRecord],
    strategy: ConflictStrategy,
) -> Result<InsertStatement> {
    let mut insert = Query::insert();
    insert
        .into_table(table_ref(table))
        .columns(table.columns.iter().map(|c| Alias::new(c.name.as_str())));
    for record in batch {
        insert.values(
            table
                .columns
                .iter()
                .map(|c| to_expr(record.get(&c.name), c.column_type)),
        )?;
    }

    let value_columns: Vec<Alias> = table
        .value_columns()
        .map(|c| Alias::new(c.name.as_str()))
        .collect();
    let mut on_conflict = OnConflict::column(Alias::new(table.primary_key.as_str()));
    match strategy {
        ConflictStrategy::Update if !value_columns.is_empty() => {
            on_conflict.update_columns(value_columns);
        }
        _ => {
            on_conflict.do_nothing();
        }
    }
    insert.on_conflict(on_conflict);
    Ok(insert)
}

#[async_trait]
impl Persister for PostgresPersister {
    async fn schema_exists(&self, schema: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(schema)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn ensure_table(&self, table: &TableDescriptor) -> Result<bool> {
        table.validate()?;
        let mut created = false;

        if !self.schema_exists(&table.schema).await? {
            // sea-query has no CREATE SCHEMA; the name was validated above.
            let create_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", table.schema);
            sqlx::query(&create_schema).execute(&self.pool).await?;
            info!(schema = %table.schema, "Created schema");
            created = true;
        }

        if self.table_exists(&table.schema, &table.table).await? {
            if !created {
                info!(table = %table.qualified_name(), "Table already exists");
            }
            return Ok(created);
        }

        let mut create = Table::create();
        create.table(table_ref(table)).if_not_exists();
        for column in &table.columns {
            create.col(column_def(table, column));
        }
        let create_table = create.to_string(PostgresQueryBuilder);
        sqlx::query(&create_table).execute(&self.pool).await?;
        info!(table = %table.qualified_name(), "Created table");
        Ok(true)
    }

    async fn insert_batch(
        &self,
        table: &TableDescriptor,
        records: &[PersistableRecord],
        strategy: ConflictStrategy,
    ) -> Result<u64> {
        table.validate()?;
        let batch = collapse_conflicts(table, records, strategy)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let (sql, values) =
            insert_statement(table, &batch, strategy)?.build_sqlx(PostgresQueryBuilder);
        let written = sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(
            table = %table.qualified_name(),
            %strategy,
            submitted = records.len(),
            written,
            "Inserted batch"
        );
        Ok(written)
    }

    async fn count(&self, table: &TableDescriptor) -> Result<u64> {
        table.validate()?;
        let query = Query::select()
            .expr(Func::count(Expr::col(Asterisk)))
            .from(table_ref(table))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    async fn fetch(
        &self,
        table: &TableDescriptor,
        key: &ColumnValue,
    ) -> Result<Option<PersistableRecord>> {
        table.validate()?;
        let key_type = table
            .column(&table.primary_key)
            .map(|c| c.column_type)
            .ok_or_else(|| PersistError::UnknownTable(table.qualified_name()))?;

        let (sql, values) = Query::select()
            .columns(table.columns.iter().map(|c| Alias::new(c.name.as_str())))
            .from(table_ref(table))
            .and_where(Expr::col(Alias::new(table.primary_key.as_str())).eq(to_expr(key, key_type)))
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode(&row, table)).transpose()
    }

    async fn delete_expired(&self, table: &TableDescriptor, cutoff: DateTime<Utc>) -> Result<u64> {
        table.validate()?;
        let column = table
            .retention_column
            .as_deref()
            .ok_or_else(|| PersistError::NoRetentionColumn(table.qualified_name()))?;

        let (sql, values) = Query::delete()
            .from_table(table_ref(table))
            .and_where(Expr::col(Alias::new(column)).lt(cutoff))
            .build_sqlx(PostgresQueryBuilder);

        let deleted = sqlx::query_with(&sql, values)
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(table = %table.qualified_name(), %cutoff, deleted, "Deleted expired rows");
        Ok(deleted)
    }

    async fn drop_table(&self, table: &TableDescriptor) -> Result<()> {
        table.validate()?;
        let drop = Table::drop()
            .table(table_ref(table))
            .if_exists()
            .to_string(PostgresQueryBuilder);
        sqlx::query(&drop).execute(&self.pool).await?;
        info!(table = %table.qualified_name(), "Dropped table");
        Ok(())
    }
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

    fn render_insert(strategy: ConflictStrategy) -> String {
        let table = people();
        let batch = [
            PersistableRecord::new().with("id", 1i64),
            PersistableRecord::new().with("id", 2i64).with("name", "Bob"),
        ];
        insert_statement(&table, &batch, strategy)
            .unwrap()
            .to_string(PostgresQueryBuilder)
    }

    #[test]
    fn test_conflict_clauses() {
        let skip = render_insert(ConflictStrategy::Skip);
        assert!(skip.starts_with(r#"INSERT INTO "test"."people" ("id", "name")"#), "{}", skip);
        assert!(skip.contains(r#"VALUES (1, NULL), (2, 'Bob')"#), "{}", skip);
        assert!(skip.contains(r#"ON CONFLICT ("id") DO NOTHING"#), "{}", skip);

        let update = render_insert(ConflictStrategy::Update);
        assert!(
            update.contains(r#"ON CONFLICT ("id") DO UPDATE SET "name" = "excluded"."name""#),
            "{}",
            update
        );
    }

    #[test]
    fn test_key_only_table_never_updates() {
        let table = TableDescriptor {
            columns: vec![ColumnSpec::required("id", ColumnType::BigInt)],
            ..people()
        };
        let batch = [PersistableRecord::new().with("id", 1i64)];
        let sql = insert_statement(&table, &batch, ConflictStrategy::Update)
            .unwrap()
            .to_string(PostgresQueryBuilder);
        assert!(sql.contains(r#"ON CONFLICT ("id") DO NOTHING"#), "{}", sql);
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_table_before_querying() {
        // Nothing listens here; a query attempt would fail as Database.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://sqsink@127.0.0.1:1/none")
            .unwrap();
        let persister = PostgresPersister::new(pool);
        let table = TableDescriptor {
            table: "people; DROP TABLE people".to_string(),
            ..people()
        };
        let batch = [PersistableRecord::new().with("id", 1i64)];

        let result = persister
            .insert_batch(&table, &batch, ConflictStrategy::Skip)
            .await;
        assert!(
            matches!(result, Err(PersistError::InvalidIdentifier(ref name)) if name == "people; DROP TABLE people"),
            "{:?}",
            result
        );
    }

    #[test]
    fn test_create_table_statement() {
        let table = people();
        let mut create = Table::create();
        create.table(table_ref(&table)).if_not_exists();
        for column in &table.columns {
            create.col(column_def(&table, column));
        }
        let sql = create.to_string(PostgresQueryBuilder);
        assert!(sql.starts_with(r#"CREATE TABLE IF NOT EXISTS "test"."people""#), "{}", sql);
        assert!(sql.contains(r#""id" bigint PRIMARY KEY"#), "{}", sql);
        assert!(sql.contains(r#""name" text"#), "{}", sql);
    }
}
