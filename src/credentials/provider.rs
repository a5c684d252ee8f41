//! Credential provider and identity registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::SharedCredentialsProvider;
use chrono::Utc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info};

use super::{CredentialSource, Credentials, Result, RoleIdentity};

/// Access key used against a local emulator (LocalStack accepts anything).
const EMULATOR_ACCESS_KEY: &str = "test";

/// How a provider obtains credentials.
#[derive(Clone)]
pub enum CredentialMode {
    /// Assume `identity` through `source`; refreshed whenever expired.
    AssumeRole {
        identity: RoleIdentity,
        source: Arc<dyn CredentialSource>,
    },
    /// No role configured: the environment's default provider chain.
    /// Never refreshed by this provider.
    Ambient,
    /// Local emulator with static dummy credentials. Never refreshed.
    LocalEmulator { endpoint_url: String },
}

impl std::fmt::Debug for CredentialMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AssumeRole { identity, .. } => f
                .debug_struct("AssumeRole")
                .field("identity", identity)
                .finish_non_exhaustive(),
            Self::Ambient => f.write_str("Ambient"),
            Self::LocalEmulator { endpoint_url } => f
                .debug_struct("LocalEmulator")
                .field("endpoint_url", endpoint_url)
                .finish(),
        }
    }
}

/// An AWS service client that can be built from shared SDK configuration.
pub trait ServiceClient: Sized {
    /// Service name used in logs.
    const SERVICE: &'static str;

    /// Build the client from an SDK configuration.
    fn from_sdk_config(config: &SdkConfig) -> Self;
}

impl ServiceClient for aws_sdk_sns::Client {
    const SERVICE: &'static str = "sns";

    fn from_sdk_config(config: &SdkConfig) -> Self {
        Self::new(config)
    }
}

impl ServiceClient for aws_sdk_sqs::Client {
    const SERVICE: &'static str = "sqs";

    fn from_sdk_config(config: &SdkConfig) -> Self {
        Self::new(config)
    }
}

impl ServiceClient for aws_sdk_sts::Client {
    const SERVICE: &'static str = "sts";

    fn from_sdk_config(config: &SdkConfig) -> Self {
        Self::new(config)
    }
}

/// A credential set together with the SDK configuration built from it.
struct Issued {
    credentials: Credentials,
    sdk_config: SdkConfig,
}

/// Owns one temporary credential set and builds service clients from it.
///
/// Constructed once at process start and shared through `Arc` by every
/// component that talks to the broker.
pub struct CredentialProvider {
    region: String,
    mode: CredentialMode,
    issued: RwLock<Option<Arc<Issued>>>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
    static_config: OnceCell<SdkConfig>,
}

impl CredentialProvider {
    /// Provider assuming `identity`, issuing credentials through `source`.
    pub fn assume_role(
        region: impl Into<String>,
        identity: RoleIdentity,
        source: Arc<dyn CredentialSource>,
    ) -> Result<Self> {
        identity.validate()?;
        Ok(Self::with_mode(
            region,
            CredentialMode::AssumeRole { identity, source },
        ))
    }

    /// Provider using the environment's default identity.
    pub fn ambient(region: impl Into<String>) -> Self {
        Self::with_mode(region, CredentialMode::Ambient)
    }

    /// Provider for a local emulator listening on `endpoint_url`.
    pub fn local_emulator(region: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self::with_mode(
            region,
            CredentialMode::LocalEmulator {
                endpoint_url: endpoint_url.into(),
            },
        )
    }

    fn with_mode(region: impl Into<String>, mode: CredentialMode) -> Self {
        Self {
            region: region.into(),
            mode,
            issued: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refreshes: AtomicU64::new(0),
            static_config: OnceCell::new(),
        }
    }

    /// Region every client is built for.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Credential mode of this provider.
    pub fn mode(&self) -> &CredentialMode {
        &self.mode
    }

    /// Number of token exchanges performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Credentials currently held, if any were issued.
    pub async fn current_credentials(&self) -> Option<Credentials> {
        self.issued
            .read()
            .await
            .as_ref()
            .map(|issued| issued.credentials.clone())
    }

    /// Build a client for service `C`, refreshing expired credentials first.
    pub async fn client<C: ServiceClient>(&self) -> Result<C> {
        let config = self.sdk_config().await?;
        debug!(service = C::SERVICE, region = %self.region, "Building service client");
        Ok(C::from_sdk_config(&config))
    }

    /// SDK configuration backed by usable credentials.
    pub async fn sdk_config(&self) -> Result<SdkConfig> {
        match &self.mode {
            CredentialMode::AssumeRole { identity, source } => {
                let issued = self.fresh_issued(identity, source.as_ref()).await?;
                Ok(issued.sdk_config.clone())
            }
            CredentialMode::Ambient => {
                let region = self.region.clone();
                let config = self
                    .static_config
                    .get_or_init(|| async move {
                        aws_config::defaults(BehaviorVersion::latest())
                            .region(Region::new(region))
                            .load()
                            .await
                    })
                    .await;
                Ok(config.clone())
            }
            CredentialMode::LocalEmulator { endpoint_url } => {
                let config = self
                    .static_config
                    .get_or_init(|| async {
                        let creds = aws_credential_types::Credentials::new(
                            EMULATOR_ACCESS_KEY,
                            EMULATOR_ACCESS_KEY,
                            None,
                            None,
                            "local-emulator",
                        );
                        build_sdk_config(&self.region, creds, Some(endpoint_url))
                    })
                    .await;
                Ok(config.clone())
            }
        }
    }

    /// Return the held credentials, issuing new ones when absent or expired.
    ///
    /// Readers never block each other; a refresh holds `refresh_lock` so only
    /// one exchange is in flight, and late arrivals re-check before exchanging.
    async fn fresh_issued(
        &self,
        identity: &RoleIdentity,
        source: &dyn CredentialSource,
    ) -> Result<Arc<Issued>> {
        if let Some(issued) = self.usable().await {
            return Ok(issued);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(issued) = self.usable().await {
            return Ok(issued);
        }

        let had_previous = self.issued.read().await.is_some();
        let credentials = source.issue(identity).await?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        let aws_creds = aws_credential_types::Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            Some(credentials.session_token.clone()),
            Some(SystemTime::from(credentials.expires_at)),
            "sts-assume-role",
        );
        let issued = Arc::new(Issued {
            sdk_config: build_sdk_config(&self.region, aws_creds, None),
            credentials,
        });

        info!(
            role = %identity.role,
            session = %identity.session_name,
            expires_at = %issued.credentials.expires_at,
            refreshed = had_previous,
            "Issued temporary credentials"
        );

        *self.issued.write().await = Some(Arc::clone(&issued));
        Ok(issued)
    }

    /// Held credentials if present and not expired.
    async fn usable(&self) -> Option<Arc<Issued>> {
        let guard = self.issued.read().await;
        match guard.as_ref() {
            Some(issued) if !issued.credentials.is_expired_at(Utc::now()) => {
                Some(Arc::clone(issued))
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("region", &self.region)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

fn build_sdk_config(
    region: &str,
    credentials: aws_credential_types::Credentials,
    endpoint_url: Option<&str>,
) -> SdkConfig {
    let mut builder = SdkConfig::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .credentials_provider(SharedCredentialsProvider::new(credentials));
    if let Some(endpoint) = endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }
    builder.build()
}

/// Hands out one shared provider per (role, session name) identity.
///
/// Asking twice for the same identity returns the same provider, so callers
/// never end up with two independently refreshing copies.
#[derive(Default)]
pub struct CredentialRegistry {
    providers: std::sync::Mutex<HashMap<(String, String), Arc<CredentialProvider>>>,
}

static GLOBAL_REGISTRY: OnceLock<CredentialRegistry> = OnceLock::new();

fn registry_key(identity: &RoleIdentity) -> (String, String) {
    (identity.role.clone(), identity.session_name.clone())
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used by the binaries.
    pub fn global() -> &'static CredentialRegistry {
        GLOBAL_REGISTRY.get_or_init(CredentialRegistry::new)
    }

    /// Provider already registered for `identity`.
    pub fn get(&self, identity: &RoleIdentity) -> Option<Arc<CredentialProvider>> {
        self.providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&registry_key(identity))
            .cloned()
    }

    /// Get the provider for `identity`, creating it on first request.
    ///
    /// `region` and `source` are only used when the provider is created.
    pub fn get_or_create(
        &self,
        region: &str,
        identity: RoleIdentity,
        source: Arc<dyn CredentialSource>,
    ) -> Result<Arc<CredentialProvider>> {
        let key = registry_key(&identity);
        let mut providers = self
            .providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = providers.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let provider = Arc::new(CredentialProvider::assume_role(region, identity, source)?);
        providers.insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    /// Number of distinct identities registered.
    pub fn len(&self) -> usize {
        self.providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
