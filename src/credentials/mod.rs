//! Temporary credential lifecycle.
//!
//! A [`CredentialProvider`] owns one set of temporary credentials for one
//! identity and hands out AWS service clients built from them. Credentials
//! are issued lazily on first use and re-issued when their expiry has passed.
//! Refresh is serialized so concurrent callers trigger at most one token
//! exchange and always see a complete credential set.

mod provider;
mod sts;

pub use provider::{CredentialMode, CredentialProvider, CredentialRegistry, ServiceClient};
pub use sts::StsCredentialSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Default assume-role session duration (1 hour).
pub const DEFAULT_ASSUME_ROLE_DURATION_SECS: i32 = 3600;
/// Lower bound accepted by STS for assume-role sessions.
pub const MIN_ASSUME_ROLE_DURATION_SECS: i32 = 900;
/// Upper bound accepted by STS for assume-role sessions (8 hours).
pub const MAX_ASSUME_ROLE_DURATION_SECS: i32 = 28800;

/// Result type for credential operations.
pub type Result<T> = std::result::Result<T, CredentialError>;

/// Errors raised while issuing or refreshing credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error(
        "Assume role duration {0}s is outside {min}..={max}",
        min = MIN_ASSUME_ROLE_DURATION_SECS,
        max = MAX_ASSUME_ROLE_DURATION_SECS
    )]
    InvalidDuration(i32),

    #[error("Token exchange failed for role '{role}': {message}")]
    Exchange { role: String, message: String },

    #[error("Token exchange for role '{0}' returned no credentials")]
    EmptyResponse(String),
}

/// Role and session name that scope a credential set.
///
/// Two providers built for the same identity must share state; see
/// [`CredentialRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoleIdentity {
    /// Role ARN to assume.
    pub role: String,
    /// Session name recorded by STS.
    pub session_name: String,
    /// Requested session lifetime in seconds.
    pub duration_secs: i32,
}

impl RoleIdentity {
    /// Create an identity with the default session duration.
    pub fn new(role: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            session_name: session_name.into(),
            duration_secs: DEFAULT_ASSUME_ROLE_DURATION_SECS,
        }
    }

    /// Override the requested session duration.
    pub fn with_duration(mut self, secs: i32) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Check the duration against the STS bounds.
    pub fn validate(&self) -> Result<()> {
        if (MIN_ASSUME_ROLE_DURATION_SECS..=MAX_ASSUME_ROLE_DURATION_SECS)
            .contains(&self.duration_secs)
        {
            Ok(())
        } else {
            Err(CredentialError::InvalidDuration(self.duration_secs))
        }
    }
}

/// An issued, immutable set of temporary credentials.
///
/// Superseded as a whole by the next refresh, never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// True once `now` is past the expiry timestamp.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Upstream token exchange.
///
/// Implemented by [`StsCredentialSource`] in production; tests substitute a
/// counting fake.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Issue a fresh, time-bounded credential set for `identity`.
    async fn issue(&self, identity: &RoleIdentity) -> Result<Credentials>;
}
