//! OAuth 1.0a (RFC 5849) with RSA-SHA1 signatures, as spoken by Jira Server
//! application links.

use crate::errors::InstanceError;
use crate::instance::{random_hex, unix_now};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::Method;
use http::header::AUTHORIZATION;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer as _};
use sha1::Sha1;
use std::fmt;
use url::{Position, Url};

/// RFC 3986 unreserved characters stay as-is, everything else is encoded.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub(crate) fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

/// Endpoints and identity of one OAuth1 consumer registration.
#[derive(Clone, Debug, PartialEq)]
pub struct OAuth1Config {
    pub consumer_key: String,
    pub callback_url: String,
    pub request_token_url: String,
    pub authorize_url: String,
    pub access_token_url: String,
}

impl OAuth1Config {
    /// Standard Jira Server servlet endpoints under `server_url`.
    pub fn for_server(server_url: &str, consumer_key: &str, callback_url: String) -> Self {
        let base = server_url.trim_end_matches('/');
        OAuth1Config {
            consumer_key: consumer_key.to_string(),
            callback_url,
            request_token_url: format!("{base}/plugins/servlet/oauth/request-token"),
            authorize_url: format!("{base}/plugins/servlet/oauth/authorize"),
            access_token_url: format!("{base}/plugins/servlet/oauth/access-token"),
        }
    }
}

#[derive(Clone)]
pub struct Signer {
    key: SigningKey<Sha1>,
}

impl Signer {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Signer {
            key: SigningKey::<Sha1>::new(private_key),
        }
    }

    fn sign(&self, base_string: &str) -> String {
        let signature = self.key.sign(base_string.as_bytes());
        BASE64.encode(signature.to_bytes())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Signer { method: RSA-SHA1, .. }")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenPair {
    pub token: String,
    pub secret: String,
}

/// Builds the `Authorization: OAuth ...` header for one request.
pub fn authorization_header(
    consumer_key: &str,
    signer: &Signer,
    method: &Method,
    url: &Url,
    token: Option<&str>,
    extra: &[(&str, &str)],
) -> String {
    let nonce = random_hex(16);
    let timestamp = unix_now().to_string();
    signed_header(
        consumer_key,
        signer,
        method,
        url,
        token,
        extra,
        &nonce,
        &timestamp,
    )
}

#[allow(clippy::too_many_arguments)]
fn signed_header(
    consumer_key: &str,
    signer: &Signer,
    method: &Method,
    url: &Url,
    token: Option<&str>,
    extra: &[(&str, &str)],
    nonce: &str,
    timestamp: &str,
) -> String {
    let mut params: Vec<(String, String)> = vec![
        ("oauth_consumer_key".into(), consumer_key.into()),
        ("oauth_nonce".into(), nonce.into()),
        ("oauth_signature_method".into(), "RSA-SHA1".into()),
        ("oauth_timestamp".into(), timestamp.into()),
        ("oauth_version".into(), "1.0".into()),
    ];
    if let Some(token) = token {
        params.push(("oauth_token".into(), token.into()));
    }
    params.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));

    let base_string = signature_base_string(method, url, &params);
    params.push(("oauth_signature".into(), signer.sign(&base_string)));
    params.sort();

    let fields: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
        .collect();
    format!("OAuth {}", fields.join(", "))
}

/// `METHOD&base-url&normalized-parameters`, each part percent-encoded.
/// Query parameters of `url` take part in the signature.
pub(crate) fn signature_base_string(
    method: &Method,
    url: &Url,
    params: &[(String, String)],
) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.extend(
        url.query_pairs()
            .map(|(k, v)| (percent_encode(&k), percent_encode(&v))),
    );
    encoded.sort();

    let normalized: Vec<String> = encoded.iter().map(|(k, v)| format!("{k}={v}")).collect();

    format!(
        "{}&{}&{}",
        method.as_str().to_uppercase(),
        percent_encode(&url[..Position::AfterPath]),
        percent_encode(&normalized.join("&"))
    )
}

/// First leg: obtains an unauthorized request token.
pub async fn request_token(
    http: &reqwest::Client,
    config: &OAuth1Config,
    signer: &Signer,
) -> Result<TokenPair, InstanceError> {
    let url = Url::parse(&config.request_token_url)?;
    let header = authorization_header(
        &config.consumer_key,
        signer,
        &Method::POST,
        &url,
        None,
        &[("oauth_callback", config.callback_url.as_str())],
    );
    post_for_token(http, url, header).await
}

/// Second leg: where the caller authorizes the request token.
pub fn authorization_url(config: &OAuth1Config, request_token: &str) -> Result<Url, InstanceError> {
    Ok(Url::parse_with_params(
        &config.authorize_url,
        &[("oauth_token", request_token)],
    )?)
}

/// Third leg: trades an authorized request token for an access token.
pub async fn access_token(
    http: &reqwest::Client,
    config: &OAuth1Config,
    signer: &Signer,
    request_token: &str,
    verifier: &str,
) -> Result<TokenPair, InstanceError> {
    let url = Url::parse(&config.access_token_url)?;
    let header = authorization_header(
        &config.consumer_key,
        signer,
        &Method::POST,
        &url,
        Some(request_token),
        &[("oauth_verifier", verifier)],
    );
    post_for_token(http, url, header).await
}

async fn post_for_token(
    http: &reqwest::Client,
    url: Url,
    header: String,
) -> Result<TokenPair, InstanceError> {
    let response = http
        .post(url.clone())
        .header(AUTHORIZATION, header)
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(InstanceError::UpstreamStatus {
            url: url.to_string(),
            status,
            body,
        });
    }

    parse_token_response(&body)
}

fn parse_token_response(body: &str) -> Result<TokenPair, InstanceError> {
    let mut token = None;
    let mut secret = None;
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        match key.as_ref() {
            "oauth_token" => token = Some(value.into_owned()),
            "oauth_token_secret" => secret = Some(value.into_owned()),
            _ => {}
        }
    }

    match (token, secret) {
        (Some(token), Some(secret)) if !token.is_empty() => Ok(TokenPair { token, secret }),
        _ => Err(InstanceError::OAuth1(format!(
            "token response is missing oauth_token or oauth_token_secret: {body}"
        ))),
    }
}
