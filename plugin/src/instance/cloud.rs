use crate::client::JiraClient;
use crate::config::Config;
use crate::errors::InstanceError;
use crate::instance::jwt::{self, JwtClaims};
use crate::instance::{JiraUser, random_hex, unix_now};
use crate::store::SecretStore;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL;
use hmac::Mac;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Installation payload the tracker posts to the `installed` lifecycle hook.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AtlassianSecurityContext {
    pub key: String,
    pub client_key: String,
    pub shared_secret: String,
    pub base_url: String,
    #[serde(default)]
    pub display_url: String,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub event_type: String,
}

impl fmt::Debug for AtlassianSecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtlassianSecurityContext")
            .field("key", &self.key)
            .field("client_key", &self.client_key)
            .field("base_url", &self.base_url)
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Hosted Jira, authenticated through an Atlassian Connect installation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CloudInstance {
    pub key: String,
    pub installed: bool,
    pub atlassian_security_context: AtlassianSecurityContext,
}

impl CloudInstance {
    pub fn new(context: AtlassianSecurityContext) -> Self {
        CloudInstance {
            key: context.base_url.trim_end_matches('/').to_string(),
            installed: true,
            atlassian_security_context: context,
        }
    }

    /// A record an administrator registered ahead of the tracker's
    /// `installed` callback. It carries no shared secret yet.
    pub fn pending(base_url: &str) -> Self {
        let key = base_url.trim_end_matches('/').to_string();
        CloudInstance {
            atlassian_security_context: AtlassianSecurityContext {
                base_url: key.clone(),
                ..Default::default()
            },
            key,
            installed: false,
        }
    }

    fn shared_secret(&self) -> &[u8] {
        self.atlassian_security_context.shared_secret.as_bytes()
    }

    pub(crate) async fn user_connect_url(
        &self,
        config: &Config,
        secrets: &dyn SecretStore,
        caller_id: &str,
    ) -> Result<String, InstanceError> {
        let secret = random_hex(32);
        secrets.store_one_time_secret(caller_id, &secret).await?;

        let token = ConnectToken {
            caller_id: caller_id.to_string(),
            secret,
            expires: unix_now() + config.one_time_secret_ttl().as_secs(),
        }
        .seal(&secrets.ensure_encryption_secret().await?)?;

        let url = Url::parse_with_params(
            &format!(
                "{}/plugins/servlet/ac/{}/user-config",
                self.key, self.atlassian_security_context.key
            ),
            &[("mm_token", token)],
        )?;
        Ok(url.to_string())
    }

    pub(crate) fn client(
        &self,
        http: &reqwest::Client,
        jira_user: &JiraUser,
    ) -> Result<JiraClient, InstanceError> {
        let subject = Some(jira_user.account_id.clone()).filter(|id| !id.is_empty());
        Ok(JiraClient::jwt(
            http.clone(),
            Url::parse(&self.key)?,
            self.atlassian_security_context.key.clone(),
            self.atlassian_security_context.shared_secret.clone(),
            subject,
        ))
    }

    /// Checks a JWT the tracker signed with this installation's shared secret.
    pub fn verify_jwt(&self, token: &str) -> Result<JwtClaims, InstanceError> {
        if !self.installed || self.shared_secret().is_empty() {
            return Err(InstanceError::Jwt(format!(
                "{} has no installation to verify against",
                self.key
            )));
        }
        let claims = jwt::decode(token, self.shared_secret(), unix_now())?;
        if claims.iss != self.atlassian_security_context.client_key {
            return Err(InstanceError::Jwt(format!(
                "token issued by {} instead of {}",
                claims.iss, self.atlassian_security_context.client_key
            )));
        }
        Ok(claims)
    }

    /// Completes the connect flow started by `user_connect_url`. Returns the
    /// caller id the flow was started for and the tracker identity to store.
    pub async fn complete_user_connect(
        &self,
        secrets: &dyn SecretStore,
        mm_token: &str,
        jwt: &str,
    ) -> Result<(String, JiraUser), InstanceError> {
        let claims = self.verify_jwt(jwt)?;
        let account_id = claims
            .sub
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| InstanceError::Jwt("token has no subject".into()))?;

        let token = ConnectToken::unseal(mm_token, &secrets.ensure_encryption_secret().await?)?;
        if token.expires <= unix_now() {
            return Err(InstanceError::ConnectToken("token expired".into()));
        }

        let stored = secrets
            .load_one_time_secret(&token.caller_id)
            .await?
            .ok_or_else(|| InstanceError::ConnectToken("no pending connect request".into()))?;
        if stored != token.secret {
            return Err(InstanceError::ConnectToken(
                "secret does not match the pending connect request".into(),
            ));
        }

        let jira_user = JiraUser {
            key: account_id.clone(),
            account_id,
            ..Default::default()
        };
        Ok((token.caller_id, jira_user))
    }
}

/// Proof that a connect flow was started by a given caller, sealed with the
/// plugin's encryption secret so it survives the round trip through the tracker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConnectToken {
    pub caller_id: String,
    pub secret: String,
    pub expires: u64,
}

impl ConnectToken {
    pub fn seal(&self, key: &[u8]) -> Result<String, InstanceError> {
        let payload = serde_json::to_vec(self)
            .map(|bytes| BASE64URL.encode(bytes))
            .map_err(|e| InstanceError::ConnectToken(e.to_string()))?;

        let mut mac = jwt::mac(key)?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{payload}.{signature}"))
    }

    pub fn unseal(token: &str, key: &[u8]) -> Result<Self, InstanceError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| InstanceError::ConnectToken("malformed token".into()))?;
        let signature =
            hex::decode(signature).map_err(|e| InstanceError::ConnectToken(e.to_string()))?;

        let mut mac = jwt::mac(key)?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| InstanceError::ConnectToken("signature mismatch".into()))?;

        let bytes = BASE64URL
            .decode(payload)
            .map_err(|e| InstanceError::ConnectToken(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| InstanceError::ConnectToken(e.to_string()))
    }
}
