//! Configured issue-tracker installations.
//!
//! An [`Instance`] is either a self-hosted Server installation authenticated
//! with three-legged OAuth1 (RSA-SHA1), or a hosted Cloud installation that
//! signs every outbound call with an HS256 JWT derived from the shared secret
//! it received at install time. Both variants serialize to one record with a
//! `Type` discriminant.

mod cloud;
pub mod jwt;
pub mod oauth1;
mod server;

pub use cloud::{AtlassianSecurityContext, CloudInstance, ConnectToken};
pub use server::{OAUTH1_CALLBACK_PATH, ServerInstance, public_key_pem};

use crate::client::JiraClient;
use crate::config::Config;
use crate::errors::InstanceError;
use crate::store::SecretStore;
use indexmap::IndexMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Index of every stored instance, keyed by URL.
pub type KnownInstances = IndexMap<String, InstanceType>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Server,
    Cloud,
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceType::Server => f.write_str("server"),
            InstanceType::Cloud => f.write_str("cloud"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "Type", rename_all = "lowercase")]
pub enum Instance {
    Server(ServerInstance),
    Cloud(CloudInstance),
}

impl Instance {
    /// Stable key of the instance: its base URL.
    pub fn key(&self) -> &str {
        match self {
            Instance::Server(server) => &server.key,
            Instance::Cloud(cloud) => &cloud.key,
        }
    }

    pub fn url(&self) -> &str {
        self.key()
    }

    pub fn instance_type(&self) -> InstanceType {
        match self {
            Instance::Server(_) => InstanceType::Server,
            Instance::Cloud(_) => InstanceType::Cloud,
        }
    }

    /// Human readable summary, in display order.
    pub fn display_details(&self) -> IndexMap<String, String> {
        let mut details = IndexMap::new();
        details.insert("Type".to_string(), self.instance_type().to_string());
        details.insert("URL".to_string(), self.url().to_string());

        match self {
            Instance::Server(server) => {
                details.insert("Consumer key".to_string(), server.consumer_key.clone());
            }
            Instance::Cloud(cloud) => {
                let context = &cloud.atlassian_security_context;
                details.insert("Installed".to_string(), cloud.installed.to_string());
                details.insert("App key".to_string(), context.key.clone());
                details.insert("Client key".to_string(), context.client_key.clone());
                if !context.display_url.is_empty() {
                    details.insert("Display URL".to_string(), context.display_url.clone());
                }
            }
        }

        details
    }

    /// Starts the connect flow for `caller_id` and returns the URL the caller
    /// has to visit to authorize access on the tracker.
    pub async fn user_connect_url(
        &self,
        config: &Config,
        secrets: &dyn SecretStore,
        http: &reqwest::Client,
        caller_id: &str,
    ) -> Result<String, InstanceError> {
        match self {
            Instance::Server(server) => {
                server
                    .user_connect_url(config, secrets, http, caller_id)
                    .await
            }
            Instance::Cloud(cloud) => cloud.user_connect_url(config, secrets, caller_id).await,
        }
    }

    /// Builds a client authenticated as `jira_user`.
    pub async fn client(
        &self,
        config: &Config,
        secrets: &dyn SecretStore,
        http: &reqwest::Client,
        jira_user: &JiraUser,
    ) -> Result<JiraClient, InstanceError> {
        match self {
            Instance::Server(server) => server.client(config, secrets, http, jira_user).await,
            Instance::Cloud(cloud) => cloud.client(http, jira_user),
        }
    }
}

/// The caller's identity and credentials on the issue tracker.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct JiraUser {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, rename = "OAuth1AccessToken")]
    pub oauth1_access_token: String,
    #[serde(default, rename = "OAuth1AccessSecret")]
    pub oauth1_access_secret: String,
}

impl JiraUser {
    pub fn has_oauth1_credentials(&self) -> bool {
        !self.oauth1_access_token.is_empty() && !self.oauth1_access_secret.is_empty()
    }

    /// Name used to index the user: the Server username, or the Cloud account id.
    pub fn username(&self) -> &str {
        if self.name.is_empty() {
            &self.account_id
        } else {
            &self.name
        }
    }
}

/// Request token pair issued mid-flow, pending authorization by the caller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct OAuth1aTemporaryCredentials {
    pub token: String,
    pub secret: String,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub(crate) fn random_hex(len: usize) -> String {
    hex::encode(random_bytes(len))
}
