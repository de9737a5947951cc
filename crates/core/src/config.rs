//! Provider configuration loading.
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Config file (TOML)
//! 3. Environment variables: `SKYTAP_USERNAME`, `SKYTAP_API_TOKEN`, `SKYTAP_BASE_URL`
//!
//! # Example Config
//!
//! ```toml
//! username = "lab-admin"
//! api_token = "..."
//! poll_interval_secs = 10
//!
//! [timeouts]
//! create = 900
//!
//! [timeouts.environment]
//! delete = 1200
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, OptionExt, Result};

pub const USERNAME_ENV: &str = "SKYTAP_USERNAME";
pub const API_TOKEN_ENV: &str = "SKYTAP_API_TOKEN";
pub const BASE_URL_ENV: &str = "SKYTAP_BASE_URL";

/// Explicit provider configuration, built once and passed into every reconciler call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Account username.
    #[serde(default)]
    pub username: String,

    /// API token for the account.
    #[serde(default)]
    pub api_token: String,

    /// Base URL of the provisioning API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Transport timeout for a single HTTP request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Interval between runstate polls.
    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,

    /// Delay before the first runstate poll.
    #[serde(default = "default_poll_secs")]
    pub initial_delay_secs: u64,

    /// Per-operation timeouts with optional per-kind overrides.
    #[serde(default)]
    pub timeouts: TimeoutOverrides,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            api_token: String::new(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            poll_interval_secs: default_poll_secs(),
            initial_delay_secs: default_poll_secs(),
            timeouts: TimeoutOverrides::default(),
        }
    }
}

impl ProviderConfig {
    /// Load configuration from an optional file, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::toml_parse_failed(e.to_string()))
    }

    /// Apply environment overrides through an injectable lookup. Blank values are ignored.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(username) = lookup(USERNAME_ENV).non_blank() {
            self.username = username;
        }
        if let Some(token) = lookup(API_TOKEN_ENV).non_blank() {
            self.api_token = token;
        }
        if let Some(url) = lookup(BASE_URL_ENV).non_blank() {
            self.base_url = url;
        }
        self.base_url()?;
        Ok(self)
    }

    /// Set credentials directly.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, token: impl Into<String>) -> Self {
        self.username = username.into();
        self.api_token = token.into();
        self
    }

    /// Check required fields and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(Error::missing_credential("username", USERNAME_ENV));
        }
        if self.api_token.trim().is_empty() {
            return Err(Error::missing_credential("api_token", API_TOKEN_ENV));
        }
        self.validate_timing()
    }

    /// Check timing values only (credentials are not needed for simulated runs).
    pub fn validate_timing(&self) -> Result<()> {
        self.base_url()?;
        if self.request_timeout_secs == 0 {
            return Err(Error::invalid_config("request_timeout_secs must be positive"));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::invalid_config("poll_interval_secs must be positive"));
        }
        self.timeouts.validate()
    }

    /// Parsed base URL.
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.base_url)
            .map_err(|e| Error::invalid_config(format!("base_url '{}': {e}", self.base_url)))
    }

    /// Transport timeout as a duration.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Initial poll delay as a duration.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

/// Resolved timeouts for the four operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    pub create: Duration,
    pub read: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(DEFAULT_MUTATE_SECS),
            read: Duration::from_secs(DEFAULT_READ_SECS),
            update: Duration::from_secs(DEFAULT_MUTATE_SECS),
            delete: Duration::from_secs(DEFAULT_MUTATE_SECS),
        }
    }
}

/// Timeout table as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutOverrides {
    #[serde(default = "default_mutate_secs")]
    pub create: u64,
    #[serde(default = "default_read_secs")]
    pub read: u64,
    #[serde(default = "default_mutate_secs")]
    pub update: u64,
    #[serde(default = "default_mutate_secs")]
    pub delete: u64,

    /// Per-kind overrides keyed by kind name (`environment`, `vm`, ...).
    #[serde(flatten)]
    pub per_kind: BTreeMap<String, PartialTimeouts>,
}

impl Default for TimeoutOverrides {
    fn default() -> Self {
        Self {
            create: DEFAULT_MUTATE_SECS,
            read: DEFAULT_READ_SECS,
            update: DEFAULT_MUTATE_SECS,
            delete: DEFAULT_MUTATE_SECS,
            per_kind: BTreeMap::new(),
        }
    }
}

/// Optional per-kind timeout values; unset fields inherit the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartialTimeouts {
    pub create: Option<u64>,
    pub read: Option<u64>,
    pub update: Option<u64>,
    pub delete: Option<u64>,
}

impl TimeoutOverrides {
    /// Resolve the timeouts that apply to one resource kind.
    #[must_use]
    pub fn for_kind(&self, kind: &str) -> OperationTimeouts {
        let partial = self.per_kind.get(kind).cloned().unwrap_or_default();
        OperationTimeouts {
            create: Duration::from_secs(partial.create.unwrap_or(self.create)),
            read: Duration::from_secs(partial.read.unwrap_or(self.read)),
            update: Duration::from_secs(partial.update.unwrap_or(self.update)),
            delete: Duration::from_secs(partial.delete.unwrap_or(self.delete)),
        }
    }

    fn validate(&self) -> Result<()> {
        let defaults = [self.create, self.read, self.update, self.delete];
        if defaults.contains(&0) {
            return Err(Error::invalid_config("timeouts must be positive"));
        }
        self.per_kind
            .iter()
            .find(|(_, t)| {
                [t.create, t.read, t.update, t.delete]
                    .iter()
                    .any(|v| *v == Some(0))
            })
            .map_or(Ok(()), |(kind, _)| {
                Err(Error::invalid_config(format!(
                    "timeouts for '{kind}' must be positive"
                )))
            })
    }
}

const DEFAULT_MUTATE_SECS: u64 = 600;
const DEFAULT_READ_SECS: u64 = 120;

fn default_base_url() -> String {
    "https://cloud.skytap.com/".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    60
}

const fn default_poll_secs() -> u64 {
    10
}

const fn default_mutate_secs() -> u64 {
    DEFAULT_MUTATE_SECS
}

const fn default_read_secs() -> u64 {
    DEFAULT_READ_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProviderConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.initial_delay(), Duration::from_secs(10));
        assert_eq!(config.base_url, "https://cloud.skytap.com/");
        assert_eq!(
            config.timeouts.for_kind("environment"),
            OperationTimeouts::default()
        );
    }

    #[test]
    fn test_parse_with_kind_overrides() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = ProviderConfig::from_toml(
            r#"
            username = "admin"
            api_token = "secret"

            [timeouts]
            create = 900

            [timeouts.environment]
            delete = 1200
            "#,
        )?;

        let env = config.timeouts.for_kind("environment");
        assert_eq!(env.create, Duration::from_secs(900));
        assert_eq!(env.delete, Duration::from_secs(1200));
        assert_eq!(env.read, Duration::from_secs(120));

        let vm = config.timeouts.for_kind("vm");
        assert_eq!(vm.delete, Duration::from_secs(600));
        assert!(config.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_env_overrides_file_values() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = ProviderConfig::from_toml("username = \"from-file\"")?.with_env(|key| {
            match key {
                API_TOKEN_ENV => Some("from-env".to_string()),
                _ => None,
            }
        })?;
        assert_eq!(config.username, "from-file");
        assert_eq!(config.api_token, "from-env");
        Ok(())
    }

    #[test]
    fn test_blank_env_value_does_not_override() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = ProviderConfig::from_toml("username = \"from-file\"")?
            .with_env(|key| (key == USERNAME_ENV).then(|| "  ".to_string()))?;
        assert_eq!(config.username, "from-file");
        Ok(())
    }

    #[test]
    fn test_missing_token_is_rejected() {
        let config = ProviderConfig::default().with_credentials("admin", " ");
        let result = config.validate();
        assert!(matches!(result, Err(Error::MissingCredential { .. })));
    }

    #[test]
    fn test_zero_kind_timeout_is_rejected() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = ProviderConfig::from_toml("[timeouts.vm]\ncreate = 0")?
            .with_credentials("admin", "secret");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
        Ok(())
    }

    #[test]
    fn test_bad_base_url_env() {
        let result = ProviderConfig::default().with_env(|key| {
            (key == BASE_URL_ENV).then(|| "not a url".to_string())
        });
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_from_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("provider.toml");
        std::fs::write(&path, "username = \"a\"\napi_token = \"b\"\npoll_interval_secs = 3\n")?;
        let config = ProviderConfig::from_file(&path)?;
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        Ok(())
    }
}
