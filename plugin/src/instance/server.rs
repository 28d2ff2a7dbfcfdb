use crate::client::JiraClient;
use crate::config::Config;
use crate::errors::InstanceError;
use crate::instance::oauth1::{self, OAuth1Config, Signer};
use crate::instance::{JiraUser, OAuth1aTemporaryCredentials};
use crate::store::SecretStore;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use url::Url;

pub const OAUTH1_CALLBACK_PATH: &str = "/oauth1/complete.html";

/// Self-hosted Jira, linked through an OAuth1 application link whose
/// consumer holds this plugin's RSA public key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerInstance {
    pub key: String,
    #[serde(rename = "JIRAServerURL")]
    pub server_url: String,
    #[serde(rename = "MattermostKey")]
    pub consumer_key: String,
    #[serde(skip)]
    oauth1_config: OnceLock<OAuth1Config>,
}

// The OAuth1 config is a cache derived from the other fields.
impl PartialEq for ServerInstance {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.server_url == other.server_url
            && self.consumer_key == other.consumer_key
    }
}

impl ServerInstance {
    pub fn new(server_url: &str, consumer_key: &str) -> Self {
        let server_url = server_url.trim_end_matches('/').to_string();
        ServerInstance {
            key: server_url.clone(),
            server_url,
            consumer_key: consumer_key.to_string(),
            oauth1_config: OnceLock::new(),
        }
    }

    fn oauth1_config(&self, config: &Config) -> &OAuth1Config {
        self.oauth1_config.get_or_init(|| {
            OAuth1Config::for_server(
                &self.server_url,
                &self.consumer_key,
                config.plugin_route(OAUTH1_CALLBACK_PATH),
            )
        })
    }

    pub(crate) async fn user_connect_url(
        &self,
        config: &Config,
        secrets: &dyn SecretStore,
        http: &reqwest::Client,
        caller_id: &str,
    ) -> Result<String, InstanceError> {
        let oauth1_config = self.oauth1_config(config);
        let signer = Signer::new(secrets.ensure_rsa_key().await?);

        let request_token = oauth1::request_token(http, oauth1_config, &signer).await?;
        let url = oauth1::authorization_url(oauth1_config, &request_token.token)?;

        secrets
            .store_oauth1_temporary_credentials(
                caller_id,
                &OAuth1aTemporaryCredentials {
                    token: request_token.token,
                    secret: request_token.secret,
                },
            )
            .await?;

        tracing::debug!(instance = %self.key, caller_id, "issued OAuth1 request token");
        Ok(url.to_string())
    }

    pub(crate) async fn client(
        &self,
        config: &Config,
        secrets: &dyn SecretStore,
        http: &reqwest::Client,
        jira_user: &JiraUser,
    ) -> Result<JiraClient, InstanceError> {
        if !jira_user.has_oauth1_credentials() {
            return Err(InstanceError::NotConnected(format!(
                "no OAuth1 credentials for {}, connect your account to {} first",
                jira_user.username(),
                self.server_url
            )));
        }

        let signer = Signer::new(secrets.ensure_rsa_key().await?);
        Ok(JiraClient::oauth1(
            http.clone(),
            Url::parse(&self.server_url)?,
            self.oauth1_config(config).consumer_key.clone(),
            signer,
            jira_user.oauth1_access_token.clone(),
        ))
    }

    /// Finishes the three-legged flow for `caller_id`: consumes the pending
    /// request token, exchanges it for an access token and resolves the
    /// tracker identity behind it.
    pub async fn complete_oauth1(
        &self,
        config: &Config,
        secrets: &dyn SecretStore,
        http: &reqwest::Client,
        caller_id: &str,
        oauth_token: &str,
        verifier: &str,
    ) -> Result<JiraUser, InstanceError> {
        let pending = secrets
            .load_oauth1_temporary_credentials(caller_id)
            .await?
            .ok_or_else(|| {
                InstanceError::PendingAuthorization(
                    "no pending authorization for this user".into(),
                )
            })?;
        if pending.token != oauth_token {
            return Err(InstanceError::PendingAuthorization(
                "request token does not match the pending authorization".into(),
            ));
        }

        let oauth1_config = self.oauth1_config(config);
        let signer = Signer::new(secrets.ensure_rsa_key().await?);
        let access =
            oauth1::access_token(http, oauth1_config, &signer, &pending.token, verifier).await?;

        let mut jira_user = JiraUser {
            oauth1_access_token: access.token,
            oauth1_access_secret: access.secret,
            ..Default::default()
        };

        let me = self
            .client(config, secrets, http, &jira_user)
            .await?
            .get_self()
            .await?;
        jira_user.key = me.key;
        jira_user.name = me.name;
        jira_user.account_id = me.account_id;
        jira_user.display_name = me.display_name;

        Ok(jira_user)
    }
}

/// SPKI PEM of the plugin's RSA key, to be pasted into the tracker's
/// application link.
pub async fn public_key_pem(secrets: &dyn SecretStore) -> Result<String, InstanceError> {
    let key = secrets.ensure_rsa_key().await?;
    key.to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| InstanceError::Key(e.to_string()))
}
