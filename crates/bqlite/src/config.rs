// SPDX-License-Identifier: Apache-2.0

//! Configuration for the BigQuery client

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::error::{BqError, BqResult};

/// Environment variable naming a credential file for ambient lookup
pub const CREDENTIALS_ENV_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Metadata server host used when `GCE_METADATA_HOST` is not set
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Configuration for [`crate::BqLite`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BqConfig {
    /// Credential sources
    #[serde(default)]
    pub credentials: CredentialConfig,

    /// REST endpoint configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Default options applied to every query
    #[serde(default)]
    pub query: QueryOptions,
}

impl BqConfig {
    /// Default configuration whose ambient credential sources are taken from
    /// the process environment.
    ///
    /// [`BqConfig::default`] leaves the ambient sources empty.
    pub fn from_env() -> Self {
        Self {
            credentials: CredentialConfig {
                ambient: AmbientCredentials::from_env(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> BqResult<()> {
        self.api.validate()?;
        self.query.validate()
    }
}

/// Credential sources, in precedence order: explicit credential, key file,
/// ambient default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Explicit credential object
    #[serde(default)]
    pub explicit: Option<Credentials>,

    /// Path to a JSON key file
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Ambient default sources
    #[serde(default)]
    pub ambient: AmbientCredentials,
}

impl CredentialConfig {
    /// Use an explicit credential object
    pub fn explicit(credentials: Credentials) -> Self {
        Self {
            explicit: Some(credentials),
            ..Default::default()
        }
    }

    /// Use a JSON key file
    pub fn key_file(path: impl Into<PathBuf>) -> Self {
        Self {
            key_file: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Ambient default credential sources.
///
/// Captured once from the process environment by [`AmbientCredentials::from_env`];
/// resolution never reads environment variables itself, so tests can pass any
/// combination explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbientCredentials {
    /// Key file named by `GOOGLE_APPLICATION_CREDENTIALS`
    #[serde(default)]
    pub env_key_file: Option<PathBuf>,

    /// gcloud application default credentials file
    #[serde(default)]
    pub well_known_file: Option<PathBuf>,

    /// Compute metadata server base URL
    #[serde(default)]
    pub metadata_server: Option<String>,
}

impl AmbientCredentials {
    /// Snapshot the ambient sources visible to this process
    pub fn from_env() -> Self {
        let env_key_file = std::env::var_os(CREDENTIALS_ENV_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let well_known_file = std::env::var_os("CLOUDSDK_CONFIG")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME")
                    .map(|home| PathBuf::from(home).join(".config").join("gcloud"))
            })
            .map(|dir| dir.join("application_default_credentials.json"));

        let metadata_server = Some(metadata_base_url(
            std::env::var("GCE_METADATA_HOST").ok().as_deref(),
        ));

        Self {
            env_key_file,
            well_known_file,
            metadata_server,
        }
    }

    /// Whether no ambient source is configured at all
    pub fn is_empty(&self) -> bool {
        self.env_key_file.is_none()
            && self.well_known_file.is_none()
            && self.metadata_server.is_none()
    }
}

fn metadata_base_url(host: Option<&str>) -> String {
    let host = host
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .unwrap_or(DEFAULT_METADATA_HOST);
    format!("http://{host}")
}

/// REST endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// BigQuery v2 base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// OAuth scope requested for access tokens
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Server-side wait for a query call, in milliseconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    /// Interval between job state checks, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long `read_to_table` waits for its job, in seconds
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            scope: default_scope(),
            query_timeout_ms: default_query_timeout(),
            poll_interval_ms: default_poll_interval(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

impl ApiConfig {
    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get job wait timeout as Duration
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Validate endpoint settings
    pub fn validate(&self) -> BqResult<()> {
        let url = url::Url::parse(&self.base_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BqError::InvalidConfig(format!(
                "expected http(s) base URL, got: {}",
                url.scheme()
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(BqError::InvalidConfig(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-query options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Use legacy SQL dialect
    #[serde(default)]
    pub use_legacy_sql: bool,

    /// Allow results from the query cache
    #[serde(default)]
    pub use_query_cache: bool,

    /// Page size for result paging
    #[serde(default)]
    pub max_results: Option<u32>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            use_legacy_sql: false,
            use_query_cache: false,
            max_results: None,
        }
    }
}

impl QueryOptions {
    /// Validate options
    pub fn validate(&self) -> BqResult<()> {
        if self.max_results == Some(0) {
            return Err(BqError::InvalidConfig(
                "max_results must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a query job does with an existing destination table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    /// Replace the table contents
    #[default]
    WriteTruncate,
    /// Append to the table
    WriteAppend,
    /// Fail unless the table is empty
    WriteEmpty,
}

impl WriteDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteDisposition::WriteTruncate => "WRITE_TRUNCATE",
            WriteDisposition::WriteAppend => "WRITE_APPEND",
            WriteDisposition::WriteEmpty => "WRITE_EMPTY",
        }
    }
}

fn default_base_url() -> String {
    "https://bigquery.googleapis.com/bigquery/v2".to_string()
}

fn default_scope() -> String {
    "https://www.googleapis.com/auth/bigquery".to_string()
}

fn default_query_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_poll_interval() -> u64 {
    1_000 // 1 second
}

fn default_wait_timeout() -> u64 {
    1_800 // 30 minutes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BqConfig::default();
        assert_eq!(
            config.api.base_url,
            "https://bigquery.googleapis.com/bigquery/v2"
        );
        assert_eq!(config.api.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.api.wait_timeout(), Duration::from_secs(1800));
        assert!(!config.query.use_legacy_sql);
        assert!(!config.query.use_query_cache);
        assert_eq!(config.query.max_results, None);
        assert!(config.credentials.explicit.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: BqConfig = serde_json::from_str(
            r#"{"credentials": {"key_file": "/keys/sa.json"}, "query": {"max_results": 500}}"#,
        )
        .unwrap();

        assert_eq!(
            config.credentials.key_file,
            Some(PathBuf::from("/keys/sa.json"))
        );
        assert_eq!(config.query.max_results, Some(500));
        assert_eq!(config.api.query_timeout_ms, 10_000);
        assert!(config.credentials.ambient.is_empty());
    }

    #[test]
    fn test_invalid_base_url_scheme() {
        let api = ApiConfig {
            base_url: "ftp://example.com".to_string(),
            ..Default::default()
        };
        assert!(matches!(api.validate(), Err(BqError::InvalidConfig(_))));

        let api = ApiConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(api.validate(), Err(BqError::UrlParse(_))));
    }

    #[test]
    fn test_metadata_server_falls_back_to_default_host() {
        assert_eq!(metadata_base_url(None), "http://metadata.google.internal");
        assert_eq!(metadata_base_url(Some("")), "http://metadata.google.internal");
        assert_eq!(metadata_base_url(Some("127.0.0.1:8080")), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_from_env_always_includes_metadata_server() {
        let ambient = AmbientCredentials::from_env();
        assert!(ambient.metadata_server.is_some());
        assert!(!ambient.is_empty());

        let config = BqConfig::from_env();
        assert_eq!(config.credentials.ambient, ambient);
        assert!(config.credentials.explicit.is_none());
        assert!(config.credentials.key_file.is_none());
    }

    #[test]
    fn test_zero_max_results_rejected() {
        let query = QueryOptions {
            max_results: Some(0),
            ..Default::default()
        };
        assert!(query.validate().is_err());
    }

    #[test]
    fn test_write_disposition_serde() {
        assert_eq!(WriteDisposition::default(), WriteDisposition::WriteTruncate);
        let json = serde_json::to_string(&WriteDisposition::WriteAppend).unwrap();
        assert_eq!(json, "\"WRITE_APPEND\"");
        assert_eq!(WriteDisposition::WriteEmpty.as_str(), "WRITE_EMPTY");
    }
}
