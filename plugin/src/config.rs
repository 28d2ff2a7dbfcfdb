use crate::store::ChatUser;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Empty app key")]
    EmptyAppKey,

    #[error("Plugin URL must use http or https: {0}")]
    InvalidPluginUrl(Url),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("RSA key size {0} is below the 1024 bit minimum")]
    WeakRsaKey(usize),

    #[error("Duplicate directory user id: {0}")]
    DuplicateUser(String),
}

/// Plugin configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener serving the plugin routes
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// Public base URL the chat platform serves this plugin under.
    /// Used to build OAuth1 callbacks and tracker-facing links.
    pub plugin_url: Url,
    /// Application key registered with the issue tracker. Doubles as the
    /// OAuth1 consumer key for newly installed Server instances.
    pub app_key: String,
    /// Shared secret expected on `/webhook`. Webhooks are rejected while empty.
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub temporary_credentials_ttl_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub one_time_secret_ttl_secs: u64,
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: usize,
    /// Chat platform users known to this process.
    #[serde(default)]
    pub directory: Vec<ChatUser>,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_ttl_secs() -> u64 {
    15 * 60
}

fn default_rsa_key_bits() -> usize {
    2048
}

impl Config {
    /// Validates the plugin configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.app_key.is_empty() {
            return Err(ValidationError::EmptyAppKey);
        }

        if !matches!(self.plugin_url.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidPluginUrl(self.plugin_url.clone()));
        }

        for (name, value) in [
            ("request_timeout_secs", self.request_timeout_secs),
            (
                "temporary_credentials_ttl_secs",
                self.temporary_credentials_ttl_secs,
            ),
            ("one_time_secret_ttl_secs", self.one_time_secret_ttl_secs),
        ] {
            if value == 0 {
                return Err(ValidationError::ZeroDuration(name));
            }
        }

        if self.rsa_key_bits < 1024 {
            return Err(ValidationError::WeakRsaKey(self.rsa_key_bits));
        }

        let mut user_ids = HashSet::new();
        for user in &self.directory {
            if !user_ids.insert(&user.id) {
                return Err(ValidationError::DuplicateUser(user.id.clone()));
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn temporary_credentials_ttl(&self) -> Duration {
        Duration::from_secs(self.temporary_credentials_ttl_secs)
    }

    pub fn one_time_secret_ttl(&self) -> Duration {
        Duration::from_secs(self.one_time_secret_ttl_secs)
    }

    /// Absolute URL of a plugin route, e.g. `plugin_route("/oauth1/complete.html")`.
    pub fn plugin_route(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.plugin_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    /// Validates the listener configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}
