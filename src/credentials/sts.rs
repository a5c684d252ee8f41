//! STS-backed credential source.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sts::error::DisplayErrorContext;
use chrono::{DateTime, Utc};
use tracing::error;

use super::{CredentialError, CredentialSource, Credentials, Result, RoleIdentity};

/// Issues credentials through `sts:AssumeRole` using the base identity of
/// the environment (instance profile, env vars, SSO...).
pub struct StsCredentialSource {
    sts: aws_sdk_sts::Client,
}

impl StsCredentialSource {
    /// Create a source from the default provider chain in `region`.
    pub async fn from_env(region: impl Into<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.into()))
            .load()
            .await;
        Self {
            sts: aws_sdk_sts::Client::new(&config),
        }
    }

    /// Wrap an existing STS client.
    pub fn new(sts: aws_sdk_sts::Client) -> Self {
        Self { sts }
    }
}

#[async_trait]
impl CredentialSource for StsCredentialSource {
    async fn issue(&self, identity: &RoleIdentity) -> Result<Credentials> {
        let output = self
            .sts
            .assume_role()
            .role_arn(&identity.role)
            .role_session_name(&identity.session_name)
            .duration_seconds(identity.duration_secs)
            .send()
            .await
            .map_err(|e| {
                let message = DisplayErrorContext(&e).to_string();
                error!(role = %identity.role, error = %message, "AssumeRole failed");
                CredentialError::Exchange {
                    role: identity.role.clone(),
                    message,
                }
            })?;

        let creds = output
            .credentials()
            .ok_or_else(|| CredentialError::EmptyResponse(identity.role.clone()))?;

        let expiration = creds.expiration();
        let expires_at = DateTime::<Utc>::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| CredentialError::Exchange {
                role: identity.role.clone(),
                message: format!("expiration out of range: {:?}", expiration),
            })?;

        Ok(Credentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().to_string(),
            expires_at,
        })
    }
}
