//! Application configuration.
//!
//! Aggregates every section into a single [`Config`] loaded from YAML files
//! and `SQSINK__`-prefixed environment variables, then checked with
//! [`Config::validate`] before anything talks to the broker.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::ReceiveOptions;
use crate::consumer::ConsumerSettings;
use crate::credentials::{
    CredentialError, CredentialProvider, CredentialRegistry, RoleIdentity, StsCredentialSource,
    DEFAULT_ASSUME_ROLE_DURATION_SECS,
};
use crate::entity::{EntityDescriptor, BUILT_IN_ENTITIES};
use crate::persist::ConflictStrategy;
use crate::producer::PacingPolicy;
use crate::topology::{TopologySettings, DEFAULT_MAX_RECEIVE_COUNT};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "sqsink.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SQSINK_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SQSINK";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SQSINK_LOG";

/// SQS bounds.
const MAX_MESSAGES_PER_POLL: i32 = 10;
const MAX_WAIT_TIME_SECS: i32 = 20;
const MAX_VISIBILITY_TIMEOUT_SECS: i32 = 43_200;

/// Configuration load and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required setting '{0}'")]
    Missing(&'static str),

    #[error("Invalid setting '{field}': {message}")]
    Invalid { field: &'static str, message: String },

    #[error("Credential setup failed: {0}")]
    Credentials(#[from] CredentialError),
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

/// Identity used for every broker call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Role ARN to assume. Without one the default identity is used as-is.
    pub role: Option<String>,
    pub session_name: String,
    pub assume_role_duration_secs: i32,
    pub region: String,
    /// Talk to a local emulator with dummy credentials; disables role assumption.
    pub local_emulator: bool,
    pub endpoint_url: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            role: None,
            session_name: "sqsink".to_string(),
            assume_role_duration_secs: DEFAULT_ASSUME_ROLE_DURATION_SECS,
            region: "eu-west-3".to_string(),
            local_emulator: false,
            endpoint_url: "http://localhost:4566".to_string(),
        }
    }
}

impl IdentityConfig {
    /// Role identity, when a role is configured and the emulator is off.
    pub fn role_identity(&self) -> Option<RoleIdentity> {
        if self.local_emulator {
            return None;
        }
        self.role.as_ref().map(|role| {
            RoleIdentity::new(role, &self.session_name)
                .with_duration(self.assume_role_duration_secs)
        })
    }

    /// Credential provider for this identity.
    ///
    /// Assumed roles go through `registry`, so every caller asking for the
    /// same role and session shares one provider and one refresh.
    pub async fn credential_provider(
        &self,
        registry: &CredentialRegistry,
    ) -> Result<Arc<CredentialProvider>, ConfigError> {
        if self.local_emulator {
            return Ok(Arc::new(CredentialProvider::local_emulator(
                &self.region,
                &self.endpoint_url,
            )));
        }
        let Some(identity) = self.role_identity() else {
            return Ok(Arc::new(CredentialProvider::ambient(&self.region)));
        };
        if let Some(existing) = registry.get(&identity) {
            return Ok(existing);
        }
        let source = Arc::new(StsCredentialSource::from_env(&self.region).await);
        Ok(registry.get_or_create(&self.region, identity, source)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub topic_name: Option<String>,
    pub queue_name: Option<String>,
    pub max_receive_count: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            topic_name: None,
            queue_name: None,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
        }
    }
}

impl TopologyConfig {
    pub fn topic_name(&self) -> Result<&str, ConfigError> {
        self.topic_name
            .as_deref()
            .ok_or(ConfigError::Missing("topology.topic_name"))
    }

    pub fn queue_name(&self) -> Result<&str, ConfigError> {
        self.queue_name
            .as_deref()
            .ok_or(ConfigError::Missing("topology.queue_name"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub polling_interval_secs: u64,
    pub max_messages_per_poll: i32,
    pub visibility_timeout_secs: i32,
    pub wait_time_secs: i32,
    /// Worst-case time to persist and acknowledge one full batch. The
    /// visibility timeout must exceed it.
    pub processing_budget_secs: i32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            polling_interval_secs: 1,
            max_messages_per_poll: 10,
            visibility_timeout_secs: 30,
            wait_time_secs: 20,
            processing_budget_secs: 10,
        }
    }
}

impl ConsumerConfig {
    pub fn receive_options(&self) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: self.max_messages_per_poll,
            wait_time_secs: self.wait_time_secs,
            visibility_timeout_secs: self.visibility_timeout_secs,
        }
    }

    pub fn settings(&self, queue_url: impl Into<String>) -> ConsumerSettings {
        ConsumerSettings {
            queue_url: queue_url.into(),
            polling_interval: Duration::from_secs(self.polling_interval_secs),
            receive: self.receive_options(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub uri: Option<String>,
    pub entity: String,
    /// Overrides the entity's documented conflict strategy.
    pub strategy: Option<ConflictStrategy>,
    pub retention_days: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: None,
            entity: "simple_message".to_string(),
            strategy: None,
            retention_days: 7,
        }
    }
}

impl StoreConfig {
    pub fn uri(&self) -> Result<&str, ConfigError> {
        self.uri.as_deref().ok_or(ConfigError::Missing("store.uri"))
    }

    /// Entity descriptor with the configured strategy applied.
    pub fn entity(&self) -> Result<EntityDescriptor, ConfigError> {
        let entity = EntityDescriptor::by_name(&self.entity).ok_or_else(|| {
            invalid(
                "store.entity",
                format!("'{}' is not one of {:?}", self.entity, BUILT_IN_ENTITIES),
            )
        })?;
        Ok(match self.strategy {
            Some(strategy) => entity.with_strategy(strategy),
            None => entity,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub message_count: usize,
    pub min_interval_ms: u64,
    pub max_jitter_ms: u64,
    pub subject: Option<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            message_count: 20,
            min_interval_ms: 1000,
            max_jitter_ms: 4000,
            subject: None,
        }
    }
}

impl ProducerConfig {
    pub fn pacing(&self) -> PacingPolicy {
        PacingPolicy {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub topology: TopologyConfig,
    pub consumer: ConsumerConfig,
    pub store: StoreConfig,
    pub producer: ProducerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `sqsink.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix and `__` nesting
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Reject unsafe or out-of-range combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(identity) = self.identity.role_identity() {
            identity.validate()?;
        }

        let consumer = &self.consumer;
        if !(1..=MAX_MESSAGES_PER_POLL).contains(&consumer.max_messages_per_poll) {
            return Err(invalid(
                "consumer.max_messages_per_poll",
                format!("{} is outside 1..={}", consumer.max_messages_per_poll, MAX_MESSAGES_PER_POLL),
            ));
        }
        if !(0..=MAX_WAIT_TIME_SECS).contains(&consumer.wait_time_secs) {
            return Err(invalid(
                "consumer.wait_time_secs",
                format!("{} is outside 0..={}", consumer.wait_time_secs, MAX_WAIT_TIME_SECS),
            ));
        }
        if !(0..=MAX_VISIBILITY_TIMEOUT_SECS).contains(&consumer.visibility_timeout_secs) {
            return Err(invalid(
                "consumer.visibility_timeout_secs",
                format!(
                    "{} is outside 0..={}",
                    consumer.visibility_timeout_secs, MAX_VISIBILITY_TIMEOUT_SECS
                ),
            ));
        }
        // A batch still in flight when its messages become visible again is
        // handed to a second consumer.
        if consumer.visibility_timeout_secs <= consumer.processing_budget_secs {
            return Err(invalid(
                "consumer.visibility_timeout_secs",
                format!(
                    "{}s must exceed processing_budget_secs ({}s)",
                    consumer.visibility_timeout_secs, consumer.processing_budget_secs
                ),
            ));
        }

        if self.topology.max_receive_count == 0 {
            return Err(invalid("topology.max_receive_count", "must be at least 1"));
        }
        if self.store.retention_days < 0 {
            return Err(invalid("store.retention_days", "must not be negative"));
        }
        self.store.entity()?;
        Ok(())
    }

    pub fn topology_settings(&self) -> TopologySettings {
        TopologySettings {
            max_receive_count: self.topology.max_receive_count,
            visibility_timeout_secs: Some(self.consumer.visibility_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("SQSINK") {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.identity.region, "eu-west-3");
        assert_eq!(config.identity.session_name, "sqsink");
        assert_eq!(config.consumer.max_messages_per_poll, 10);
        assert_eq!(config.consumer.wait_time_secs, 20);
        assert_eq!(config.consumer.visibility_timeout_secs, 30);
        assert_eq!(config.topology.max_receive_count, 5);
        assert_eq!(config.producer.message_count, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_visibility_must_exceed_processing_budget() {
        let mut config = Config::default();
        config.consumer.processing_budget_secs = 30;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "consumer.visibility_timeout_secs",
                ..
            })
        ));
        config.consumer.visibility_timeout_secs = 31;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_receive_bounds() {
        let mut config = Config::default();
        config.consumer.max_messages_per_poll = 11;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.consumer.wait_time_secs = 21;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_duration_checked() {
        let mut config = Config::default();
        config.identity.role = Some("arn:aws:iam::123456789012:role/consumer".to_string());
        config.identity.assume_role_duration_secs = 600;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Credentials(CredentialError::InvalidDuration(600)))
        ));

        // The emulator never assumes a role, so the duration is irrelevant.
        config.identity.local_emulator = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_entity_rejected() {
        let mut config = Config::default();
        config.store.entity = "invoice".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_override() {
        let mut config = Config::default();
        assert_eq!(config.store.entity().unwrap().strategy, ConflictStrategy::Skip);
        config.store.strategy = Some(ConflictStrategy::Update);
        assert_eq!(config.store.entity().unwrap().strategy, ConflictStrategy::Update);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "topology:\n  topic_name: orders-topic\n  queue_name: orders\nconsumer:\n  wait_time_secs: 5\nstore:\n  entity: consultation\n  strategy: skip"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.topology.topic_name().unwrap(), "orders-topic");
        assert_eq!(config.topology.queue_name().unwrap(), "orders");
        assert_eq!(config.consumer.wait_time_secs, 5);
        assert_eq!(config.consumer.max_messages_per_poll, 10);
        assert_eq!(config.store.strategy, Some(ConflictStrategy::Skip));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("SQSINK__CONSUMER__VISIBILITY_TIMEOUT_SECS", "60");
        std::env::set_var("SQSINK__TOPOLOGY__QUEUE_NAME", "from-env");
        std::env::set_var("SQSINK__IDENTITY__LOCAL_EMULATOR", "true");

        let config = Config::load(None).unwrap();
        clear_env();

        assert_eq!(config.consumer.visibility_timeout_secs, 60);
        assert_eq!(config.topology.queue_name().unwrap(), "from-env");
        assert!(config.identity.local_emulator);
        assert!(config.topology.topic_name().is_err());
    }

    #[tokio::test]
    async fn test_emulator_provider() {
        let identity = IdentityConfig {
            local_emulator: true,
            role: Some("arn:aws:iam::123456789012:role/ignored".to_string()),
            ..Default::default()
        };
        assert!(identity.role_identity().is_none());
        let provider = identity
            .credential_provider(&CredentialRegistry::new())
            .await
            .unwrap();
        let config = provider.sdk_config().await.unwrap();
        assert_eq!(config.endpoint_url(), Some("http://localhost:4566"));
    }

    #[tokio::test]
    async fn test_same_role_shares_one_provider() {
        let identity = IdentityConfig {
            role: Some("arn:aws:iam::123456789012:role/consumer".to_string()),
            ..Default::default()
        };
        let registry = CredentialRegistry::new();

        let first = identity.credential_provider(&registry).await.unwrap();
        let second = identity.credential_provider(&registry).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(first.refresh_count(), 0);

        let other = IdentityConfig {
            session_name: "sqsink-producer".to_string(),
            ..identity.clone()
        }
        .credential_provider(&registry)
        .await
        .unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }
}
