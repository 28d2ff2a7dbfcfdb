use super::{CurrentInstanceStore, InstanceStore, SecretStore, UserStore};
use crate::config::Config;
use crate::errors::StoreError;
use crate::instance::{Instance, JiraUser, KnownInstances, OAuth1aTemporaryCredentials};
use async_trait::async_trait;
use rand::RngCore;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const CURRENT_INSTANCE_KEY: &str = "current_jira_instance";
const KNOWN_INSTANCES_KEY: &str = "known_jira_instances";
const RSA_KEY: &str = "rsa_key";
const ENCRYPTION_SECRET_KEY: &str = "encryption_secret";

const INSTANCE_PREFIX: &str = "jira_instance_";
const USER_PREFIX: &str = "user_";
const USERNAME_PREFIX: &str = "username_";
const ONE_TIME_SECRET_PREFIX: &str = "ots_";
const TEMPORARY_CREDENTIALS_PREFIX: &str = "oauth1_temporary_credentials_";

const ENCRYPTION_SECRET_LEN: usize = 32;

/// Raw key/value backend.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Writes `value` only if `key` holds nothing. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Reads and deletes `key`. Backends that can do this atomically should.
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.get(key).await?;
        if value.is_some() {
            self.delete(key).await?;
        }
        Ok(value)
    }
}

#[async_trait]
impl<K: KvStore + ?Sized> KvStore for Arc<K> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        (**self).set(key, value).await
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        (**self).set_with_expiry(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        (**self).set_if_absent(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).take(key).await
    }
}

/// Lifetimes and sizes of the secrets a [`PluginStore`] creates.
#[derive(Clone, Copy, Debug)]
pub struct SecretSettings {
    pub temporary_credentials_ttl: Duration,
    pub one_time_secret_ttl: Duration,
    pub rsa_key_bits: usize,
}

impl SecretSettings {
    pub fn from_config(config: &Config) -> Self {
        SecretSettings {
            temporary_credentials_ttl: config.temporary_credentials_ttl(),
            one_time_secret_ttl: config.one_time_secret_ttl(),
            rsa_key_bits: config.rsa_key_bits,
        }
    }
}

/// Implements every collaborator store on top of one [`KvStore`].
///
/// Values are JSON. Keys that embed an instance URL or a caller id are hashed
/// so that they have a bounded length and charset.
pub struct PluginStore<K> {
    kv: K,
    settings: SecretSettings,
}

impl<K: KvStore> PluginStore<K> {
    pub fn new(kv: K, settings: SecretSettings) -> Self {
        PluginStore { kv, settings }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.kv.get(key).await? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn take_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.kv.take(key).await? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn store_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let bytes = encode(key, value)?;
        match ttl {
            Some(ttl) => self.kv.set_with_expiry(key, bytes, ttl).await,
            None => self.kv.set(key, bytes).await,
        }
    }

    /// Returns the bytes under `key`, creating them with `create` if absent.
    /// When two callers race, both end up with the value that was written first.
    async fn ensure_with<F, Fut>(&self, key: &str, create: F) -> Result<Vec<u8>, StoreError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, StoreError>> + Send,
    {
        if let Some(existing) = self.kv.get(key).await? {
            return Ok(existing);
        }

        let created = create().await?;
        if self.kv.set_if_absent(key, created.clone()).await? {
            tracing::info!(key, "created secret");
            return Ok(created);
        }

        tracing::debug!(key, "lost secret creation race, reading back");
        self.kv
            .get(key)
            .await?
            .ok_or_else(|| StoreError::Vanished(key.to_string()))
    }
}

#[async_trait]
impl<K: KvStore> CurrentInstanceStore for PluginStore<K> {
    async fn store_current_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.store_json(CURRENT_INSTANCE_KEY, instance, None).await
    }

    async fn load_current_instance(&self) -> Result<Option<Instance>, StoreError> {
        self.load_json(CURRENT_INSTANCE_KEY).await
    }

    async fn clear_current_instance(&self) -> Result<(), StoreError> {
        self.kv.delete(CURRENT_INSTANCE_KEY).await
    }
}

#[async_trait]
impl<K: KvStore> InstanceStore for PluginStore<K> {
    async fn store_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        self.store_json(&instance_key(instance.key()), instance, None)
            .await
    }

    async fn delete_instance(&self, key: &str) -> Result<(), StoreError> {
        self.kv.delete(&instance_key(key)).await
    }

    async fn load_instance(&self, key: &str) -> Result<Option<Instance>, StoreError> {
        self.load_json(&instance_key(key)).await
    }

    async fn store_known_instances(&self, known: &KnownInstances) -> Result<(), StoreError> {
        self.store_json(KNOWN_INSTANCES_KEY, known, None).await
    }

    async fn load_known_instances(&self) -> Result<KnownInstances, StoreError> {
        Ok(self
            .load_json(KNOWN_INSTANCES_KEY)
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl<K: KvStore> UserStore for PluginStore<K> {
    async fn store_user(
        &self,
        instance: &Instance,
        caller_id: &str,
        jira_user: &JiraUser,
    ) -> Result<(), StoreError> {
        self.store_json(&user_key(instance.key(), caller_id), jira_user, None)
            .await?;

        let username = jira_user.username();
        if !username.is_empty() {
            self.kv
                .set(
                    &username_key(instance.key(), username),
                    caller_id.as_bytes().to_vec(),
                )
                .await?;
        }
        Ok(())
    }

    async fn load_user(
        &self,
        instance: &Instance,
        caller_id: &str,
    ) -> Result<Option<JiraUser>, StoreError> {
        self.load_json(&user_key(instance.key(), caller_id)).await
    }

    async fn load_user_id_by_username(
        &self,
        instance: &Instance,
        username: &str,
    ) -> Result<Option<String>, StoreError> {
        let key = username_key(instance.key(), username);
        match self.kv.get(&key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Decode {
                    key,
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn delete_user(&self, instance: &Instance, caller_id: &str) -> Result<(), StoreError> {
        let key = user_key(instance.key(), caller_id);
        if let Some(jira_user) = self.load_json::<JiraUser>(&key).await? {
            let username = jira_user.username();
            if !username.is_empty() {
                self.kv
                    .delete(&username_key(instance.key(), username))
                    .await?;
            }
        }
        self.kv.delete(&key).await
    }
}

#[async_trait]
impl<K: KvStore> SecretStore for PluginStore<K> {
    async fn ensure_encryption_secret(&self) -> Result<Vec<u8>, StoreError> {
        self.ensure_with(ENCRYPTION_SECRET_KEY, || async {
            let mut secret = vec![0u8; ENCRYPTION_SECRET_LEN];
            rand::thread_rng().fill_bytes(&mut secret);
            Ok::<_, StoreError>(secret)
        })
        .await
    }

    async fn ensure_rsa_key(&self) -> Result<RsaPrivateKey, StoreError> {
        let bits = self.settings.rsa_key_bits;
        let pem = self
            .ensure_with(RSA_KEY, || async move {
                let pem = tokio::task::spawn_blocking(move || generate_rsa_pem(bits))
                    .await
                    .map_err(|e| StoreError::KeyGeneration(e.to_string()))??;
                Ok::<_, StoreError>(pem.into_bytes())
            })
            .await?;

        let pem = String::from_utf8(pem).map_err(|e| StoreError::Decode {
            key: RSA_KEY.to_string(),
            message: e.to_string(),
        })?;
        RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| StoreError::Decode {
            key: RSA_KEY.to_string(),
            message: e.to_string(),
        })
    }

    async fn store_one_time_secret(&self, token: &str, secret: &str) -> Result<(), StoreError> {
        self.kv
            .set_with_expiry(
                &one_time_secret_key(token),
                secret.as_bytes().to_vec(),
                self.settings.one_time_secret_ttl,
            )
            .await
    }

    async fn load_one_time_secret(&self, token: &str) -> Result<Option<String>, StoreError> {
        let key = one_time_secret_key(token);
        match self.kv.take(&key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Decode {
                    key,
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    async fn store_oauth1_temporary_credentials(
        &self,
        caller_id: &str,
        credentials: &OAuth1aTemporaryCredentials,
    ) -> Result<(), StoreError> {
        self.store_json(
            &temporary_credentials_key(caller_id),
            credentials,
            Some(self.settings.temporary_credentials_ttl),
        )
        .await
    }

    async fn load_oauth1_temporary_credentials(
        &self,
        caller_id: &str,
    ) -> Result<Option<OAuth1aTemporaryCredentials>, StoreError> {
        self.take_json(&temporary_credentials_key(caller_id)).await
    }
}

fn generate_rsa_pem(bits: usize) -> Result<String, StoreError> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| StoreError::KeyGeneration(e.to_string()))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| StoreError::KeyGeneration(e.to_string()))?;
    Ok(pem.to_string())
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Encode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Decode {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn hashed_key(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{prefix}{}", hex::encode(hasher.finalize()))
}

pub(crate) fn instance_key(instance_key: &str) -> String {
    hashed_key(INSTANCE_PREFIX, &[instance_key])
}

pub(crate) fn user_key(instance_key: &str, caller_id: &str) -> String {
    hashed_key(USER_PREFIX, &[instance_key, caller_id])
}

pub(crate) fn username_key(instance_key: &str, username: &str) -> String {
    hashed_key(USERNAME_PREFIX, &[instance_key, username])
}

pub(crate) fn one_time_secret_key(token: &str) -> String {
    hashed_key(ONE_TIME_SECRET_PREFIX, &[token])
}

pub(crate) fn temporary_credentials_key(caller_id: &str) -> String {
    hashed_key(TEMPORARY_CREDENTIALS_PREFIX, &[caller_id])
}
