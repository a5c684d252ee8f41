//! sqsink-retention: store maintenance
//!
//! Deletes rows of the configured entity's table whose retention column is
//! older than `store.retention_days`. With SQSINK_DROP_TABLE=true the table
//! is dropped instead.
//!
//! ## Configuration
//! - SQSINK_CONFIG: Path to a YAML config file (optional)
//! - SQSINK__STORE__RETENTION_DAYS: Age limit in days (default: 7)
//! - SQSINK_DROP_TABLE: Drop the table instead of pruning it (default: false)
//! - SQSINK_LOG: Log filter (default: info)

use chrono::{Duration, Utc};
use tracing::info;

use sqsink::config::Config;
use sqsink::persist::{Persister, PostgresPersister};
use sqsink::utils::bootstrap::init_tracing;

const DROP_TABLE_ENV_VAR: &str = "SQSINK_DROP_TABLE";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    config.validate()?;
    let table = config.store.entity()?.table;
    let persister = PostgresPersister::connect(config.store.uri()?).await?;

    let drop_table = std::env::var(DROP_TABLE_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);
    if drop_table {
        persister.drop_table(&table).await?;
        return Ok(());
    }

    let cutoff = Utc::now() - Duration::days(config.store.retention_days);
    let deleted = persister.delete_expired(&table, cutoff).await?;
    let remaining = persister.count(&table).await?;
    info!(
        table = %table.qualified_name(),
        %cutoff,
        deleted,
        remaining,
        "sqsink-retention finished"
    );
    Ok(())
}
