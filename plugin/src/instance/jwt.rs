//! HS256 JSON Web Tokens with the Atlassian Connect query-string-hash claim.

use crate::errors::InstanceError;
use crate::instance::oauth1::percent_encode;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL;
use hmac::{Hmac, Mac};
use http::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Deserialize)]
struct Header {
    alg: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qsh: Option<String>,
}

pub(crate) fn mac(secret: &[u8]) -> Result<HmacSha256, InstanceError> {
    HmacSha256::new_from_slice(secret).map_err(|e| InstanceError::Jwt(e.to_string()))
}

pub fn encode(claims: &JwtClaims, secret: &[u8]) -> Result<String, InstanceError> {
    let payload = serde_json::to_vec(claims).map_err(|e| InstanceError::Jwt(e.to_string()))?;
    let signing_input = format!(
        "{}.{}",
        BASE64URL.encode(HEADER),
        BASE64URL.encode(payload)
    );

    let mut mac = mac(secret)?;
    mac.update(signing_input.as_bytes());
    let signature = BASE64URL.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Verifies signature, algorithm and expiry (against `now`, unix seconds).
pub fn decode(token: &str, secret: &[u8], now: u64) -> Result<JwtClaims, InstanceError> {
    let (signing_input, signature) = token
        .rsplit_once('.')
        .ok_or_else(|| InstanceError::Jwt("malformed token".into()))?;
    let (header, payload) = signing_input
        .split_once('.')
        .ok_or_else(|| InstanceError::Jwt("malformed token".into()))?;

    let header: Header = decode_segment(header)?;
    if header.alg != "HS256" {
        return Err(InstanceError::Jwt(format!(
            "unsupported algorithm {}",
            header.alg
        )));
    }

    let signature = BASE64URL
        .decode(signature)
        .map_err(|e| InstanceError::Jwt(e.to_string()))?;
    let mut mac = mac(secret)?;
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| InstanceError::Jwt("signature mismatch".into()))?;

    let claims: JwtClaims = decode_segment(payload)?;
    if claims.exp <= now {
        return Err(InstanceError::Jwt("token expired".into()));
    }

    Ok(claims)
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, InstanceError> {
    let bytes = BASE64URL
        .decode(segment)
        .map_err(|e| InstanceError::Jwt(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| InstanceError::Jwt(e.to_string()))
}

/// Canonical request `METHOD&path&query` for `url`, relative to the context
/// path of `base`. The `jwt` parameter itself never takes part.
pub fn canonical_request(method: &Method, url: &Url, base: &Url) -> String {
    let context_path = base.path().trim_end_matches('/');
    let path = url.path().strip_prefix(context_path).unwrap_or(url.path());
    let path = if path.is_empty() { "/" } else { path };

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        if key == "jwt" {
            continue;
        }
        grouped
            .entry(percent_encode(&key))
            .or_default()
            .push(percent_encode(&value));
    }

    let query: Vec<String> = grouped
        .into_iter()
        .map(|(key, mut values)| {
            values.sort();
            format!("{key}={}", values.join(","))
        })
        .collect();

    format!(
        "{}&{}&{}",
        method.as_str().to_uppercase(),
        path,
        query.join("&")
    )
}

pub fn query_string_hash(method: &Method, url: &Url, base: &Url) -> String {
    hex::encode(Sha256::digest(canonical_request(method, url, base).as_bytes()))
}
