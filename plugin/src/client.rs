use crate::errors::InstanceError;
use crate::instance::jwt::{self, JwtClaims};
use crate::instance::oauth1::{self, Signer};
use crate::instance::{InstanceType, unix_now};
use http::Method;
use http::header::AUTHORIZATION;
use serde::Deserialize;
use std::fmt;
use url::Url;

/// Lifetime of the JWTs minted for outbound Cloud requests.
const JWT_LIFETIME_SECS: u64 = 180;

/// The tracker identity behind a set of credentials.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JiraSelf {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Clone)]
enum ClientAuth {
    OAuth1 {
        consumer_key: String,
        signer: Signer,
        token: String,
    },
    Jwt {
        issuer: String,
        shared_secret: String,
        subject: Option<String>,
    },
}

/// HTTP client for one tracker instance, signing every request it builds.
#[derive(Clone)]
pub struct JiraClient {
    http: reqwest::Client,
    base_url: Url,
    auth: ClientAuth,
}

impl JiraClient {
    pub(crate) fn oauth1(
        http: reqwest::Client,
        base_url: Url,
        consumer_key: String,
        signer: Signer,
        token: String,
    ) -> Self {
        JiraClient {
            http,
            base_url,
            auth: ClientAuth::OAuth1 {
                consumer_key,
                signer,
                token,
            },
        }
    }

    pub(crate) fn jwt(
        http: reqwest::Client,
        base_url: Url,
        issuer: String,
        shared_secret: String,
        subject: Option<String>,
    ) -> Self {
        JiraClient {
            http,
            base_url,
            auth: ClientAuth::Jwt {
                issuer,
                shared_secret,
                subject,
            },
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn protocol(&self) -> InstanceType {
        match self.auth {
            ClientAuth::OAuth1 { .. } => InstanceType::Server,
            ClientAuth::Jwt { .. } => InstanceType::Cloud,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, InstanceError> {
        Ok(Url::parse(&format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        ))?)
    }

    /// Builds a request to `path` (relative to the instance URL) carrying
    /// the `Authorization` header of the instance's protocol.
    pub fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, InstanceError> {
        let url = self.endpoint(path)?;

        let authorization = match &self.auth {
            ClientAuth::OAuth1 {
                consumer_key,
                signer,
                token,
            } => oauth1::authorization_header(
                consumer_key,
                signer,
                &method,
                &url,
                Some(token.as_str()),
                &[],
            ),
            ClientAuth::Jwt {
                issuer,
                shared_secret,
                subject,
            } => {
                let now = unix_now();
                let claims = JwtClaims {
                    iss: issuer.clone(),
                    iat: now,
                    exp: now + JWT_LIFETIME_SECS,
                    sub: subject.clone(),
                    qsh: Some(jwt::query_string_hash(&method, &url, &self.base_url)),
                };
                format!("JWT {}", jwt::encode(&claims, shared_secret.as_bytes())?)
            }
        };

        Ok(self
            .http
            .request(method, url)
            .header(AUTHORIZATION, authorization))
    }

    /// Fetches the user the client is authenticated as.
    pub async fn get_self(&self) -> Result<JiraSelf, InstanceError> {
        let response = self.request(Method::GET, "/rest/api/2/myself")?.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(InstanceError::UpstreamStatus {
                url: response.url().to_string(),
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json::<JiraSelf>().await?)
    }
}

impl fmt::Debug for JiraClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JiraClient")
            .field("base_url", &self.base_url.as_str())
            .field("protocol", &self.protocol())
            .finish_non_exhaustive()
    }
}
