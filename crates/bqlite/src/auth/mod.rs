// SPDX-License-Identifier: Apache-2.0

//! Credential resolution and access tokens
//!
//! Exactly one credential source is selected per client, in this order:
//! - an explicit [`Credentials`] object
//! - an explicit JSON key file path
//! - ambient defaults: `GOOGLE_APPLICATION_CREDENTIALS`, the gcloud
//!   well-known file, then the compute metadata server

pub mod service_account;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::client::rest::error_from_response;
use crate::config::CredentialConfig;
use crate::error::{BqError, BqResult};

pub use service_account::{AuthorizedUserKey, ServiceAccountKey};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Tokens are refreshed this long before the server-side expiry
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Lifetime assumed when a token response carries no `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

fn refresh_deadline(expires_in: Option<u64>, now: Instant) -> Instant {
    let lifetime = expires_in
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME);
    now + lifetime.saturating_sub(EXPIRY_SKEW)
}

/// Resolved credential handed to the client constructor
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// Service-account key
    ServiceAccount(ServiceAccountKey),

    /// gcloud user credentials with a refresh token
    AuthorizedUser(AuthorizedUserKey),

    /// Pre-obtained bearer token
    AccessToken { token: String },

    /// Token endpoint of the compute metadata server
    MetadataServer { base_url: String },
}

impl Credentials {
    /// Parse a JSON key (`service_account` or `authorized_user`)
    pub fn from_json(json: &str) -> BqResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| BqError::Credential(format!("unrecognized credential JSON: {}", e)))
    }

    /// Read and parse a JSON key file
    pub async fn from_key_file(path: &Path) -> BqResult<Self> {
        debug!("Loading credentials from {}", path.display());
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            BqError::Credential(format!("cannot read key file {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Credential kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::ServiceAccount(_) => "service_account",
            Credentials::AuthorizedUser(_) => "authorized_user",
            Credentials::AccessToken { .. } => "access_token",
            Credentials::MetadataServer { .. } => "metadata_server",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ServiceAccount(key) => f.debug_tuple("ServiceAccount").field(key).finish(),
            Credentials::AuthorizedUser(key) => f.debug_tuple("AuthorizedUser").field(key).finish(),
            Credentials::AccessToken { .. } => f.write_str("AccessToken"),
            Credentials::MetadataServer { base_url } => f
                .debug_struct("MetadataServer")
                .field("base_url", base_url)
                .finish(),
        }
    }
}

/// Where the resolved credential came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Explicit,
    KeyFile(PathBuf),
    Environment(PathBuf),
    WellKnownFile(PathBuf),
    MetadataServer(String),
}

/// Picks one credential source according to the configured precedence
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    config: CredentialConfig,
}

impl CredentialResolver {
    pub fn new(config: CredentialConfig) -> Self {
        Self { config }
    }

    /// Select the highest-precedence source that is configured
    pub async fn select(&self) -> BqResult<CredentialSource> {
        if self.config.explicit.is_some() {
            return Ok(CredentialSource::Explicit);
        }
        if let Some(path) = &self.config.key_file {
            return Ok(CredentialSource::KeyFile(path.clone()));
        }

        let ambient = &self.config.ambient;
        if let Some(path) = &ambient.env_key_file {
            return Ok(CredentialSource::Environment(path.clone()));
        }
        if let Some(path) = &ambient.well_known_file {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return Ok(CredentialSource::WellKnownFile(path.clone()));
            }
        }
        if let Some(url) = &ambient.metadata_server {
            return Ok(CredentialSource::MetadataServer(url.clone()));
        }

        Err(BqError::Credential(
            "no valid credential source found: no explicit credentials, key file, or ambient default"
                .to_string(),
        ))
    }

    /// Resolve the selected source into credentials
    pub async fn resolve(&self) -> BqResult<(CredentialSource, Credentials)> {
        let source = self.select().await?;

        let credentials = match &source {
            CredentialSource::Explicit => match &self.config.explicit {
                Some(credentials) => credentials.clone(),
                None => return Err(BqError::Credential("explicit credentials missing".into())),
            },
            CredentialSource::KeyFile(path) | CredentialSource::WellKnownFile(path) => {
                Credentials::from_key_file(path).await?
            }
            CredentialSource::Environment(path) => {
                info!("No explicit credentials; using key file from environment");
                Credentials::from_key_file(path).await?
            }
            CredentialSource::MetadataServer(url) => {
                info!("No explicit credentials; using compute metadata server");
                Credentials::MetadataServer {
                    base_url: url.clone(),
                }
            }
        };

        debug!("Resolved {} credentials from {:?}", credentials.kind(), source);
        Ok((source, credentials))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.refresh_at.map_or(true, |at| Instant::now() < at)
    }
}

/// Exchanges credentials for bearer tokens and caches them until expiry
pub struct TokenProvider {
    credentials: Credentials,
    scope: String,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(credentials: Credentials, scope: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            credentials,
            scope: scope.into(),
            http,
            cached: RwLock::new(None),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Current bearer token, fetching a new one when missing or expiring
    pub async fn access_token(&self) -> BqResult<String> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
                return Ok(token.token.clone());
            }
        }

        let mut cached = self.cached.write().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.token.clone());
        }

        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    async fn fetch(&self) -> BqResult<CachedToken> {
        let request = match &self.credentials {
            Credentials::AccessToken { token } => {
                return Ok(CachedToken {
                    token: token.clone(),
                    refresh_at: None,
                });
            }
            Credentials::ServiceAccount(key) => {
                let now = chrono::Utc::now().timestamp().max(0) as u64;
                let assertion = key.assertion(&self.scope, now)?;
                self.http.post(&key.token_uri).form(&[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.as_str()),
                ])
            }
            Credentials::AuthorizedUser(key) => self.http.post(&key.token_uri).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", key.client_id.as_str()),
                ("client_secret", key.client_secret.as_str()),
                ("refresh_token", key.refresh_token.as_str()),
            ]),
            Credentials::MetadataServer { base_url } => self
                .http
                .get(format!(
                    "{}/computeMetadata/v1/instance/service-accounts/default/token",
                    base_url.trim_end_matches('/')
                ))
                .query(&[("scopes", self.scope.as_str())])
                .header("Metadata-Flavor", "Google"),
        };

        debug!("Fetching access token for {} credentials", self.credentials.kind());
        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let body: TokenResponse = resp.json().await?;
        Ok(CachedToken {
            token: body.access_token,
            refresh_at: Some(refresh_deadline(body.expires_in, Instant::now())),
        })
    }
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("credentials", &self.credentials)
            .field("scope", &self.scope)
            .finish()
    }
}
