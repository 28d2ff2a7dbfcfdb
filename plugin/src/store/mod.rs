//! Persistence collaborators consumed by the authorization pipeline.
//!
//! The pipeline only sees the narrow traits below. [`PluginStore`] implements
//! all of them on top of any [`KvStore`]; [`MemoryKvStore`] is the in-process
//! backend.

mod kv;
mod memory;

pub use kv::{KvStore, PluginStore, SecretSettings};
#[cfg(test)]
pub(crate) use kv::temporary_credentials_key;
pub use memory::MemoryKvStore;

use crate::errors::StoreError;
use crate::instance::{Instance, JiraUser, KnownInstances, OAuth1aTemporaryCredentials};
use async_trait::async_trait;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SYSTEM_ADMIN_ROLE: &str = "system_admin";

#[async_trait]
pub trait CurrentInstanceStore: Send + Sync {
    async fn store_current_instance(&self, instance: &Instance) -> Result<(), StoreError>;
    async fn load_current_instance(&self) -> Result<Option<Instance>, StoreError>;
    async fn clear_current_instance(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn store_instance(&self, instance: &Instance) -> Result<(), StoreError>;
    async fn delete_instance(&self, key: &str) -> Result<(), StoreError>;
    async fn load_instance(&self, key: &str) -> Result<Option<Instance>, StoreError>;
    async fn store_known_instances(&self, known: &KnownInstances) -> Result<(), StoreError>;
    async fn load_known_instances(&self) -> Result<KnownInstances, StoreError>;
}

/// Tracker identities, keyed per (instance, caller id).
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn store_user(
        &self,
        instance: &Instance,
        caller_id: &str,
        jira_user: &JiraUser,
    ) -> Result<(), StoreError>;
    async fn load_user(
        &self,
        instance: &Instance,
        caller_id: &str,
    ) -> Result<Option<JiraUser>, StoreError>;
    async fn load_user_id_by_username(
        &self,
        instance: &Instance,
        username: &str,
    ) -> Result<Option<String>, StoreError>;
    async fn delete_user(&self, instance: &Instance, caller_id: &str) -> Result<(), StoreError>;
}

/// Key material and short-lived secrets. `ensure_*` create the value on first
/// use and converge on a single winner when callers race.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn ensure_encryption_secret(&self) -> Result<Vec<u8>, StoreError>;
    async fn ensure_rsa_key(&self) -> Result<RsaPrivateKey, StoreError>;
    async fn store_one_time_secret(&self, token: &str, secret: &str) -> Result<(), StoreError>;
    /// Returns the secret at most once.
    async fn load_one_time_secret(&self, token: &str) -> Result<Option<String>, StoreError>;
    async fn store_oauth1_temporary_credentials(
        &self,
        caller_id: &str,
        credentials: &OAuth1aTemporaryCredentials,
    ) -> Result<(), StoreError>;
    /// Returns the credentials at most once.
    async fn load_oauth1_temporary_credentials(
        &self,
        caller_id: &str,
    ) -> Result<Option<OAuth1aTemporaryCredentials>, StoreError>;
}

/// A user of the chat platform.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl ChatUser {
    pub fn is_system_admin(&self) -> bool {
        self.roles.iter().any(|role| role == SYSTEM_ADMIN_ROLE)
    }
}

/// The chat platform's user directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<ChatUser>, StoreError>;
}

/// Directory backed by a fixed list of users.
#[derive(Clone, Debug, Default)]
pub struct StaticUserDirectory {
    users: HashMap<String, ChatUser>,
}

impl StaticUserDirectory {
    pub fn new(users: impl IntoIterator<Item = ChatUser>) -> Self {
        StaticUserDirectory {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
        }
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn get_user(&self, id: &str) -> Result<Option<ChatUser>, StoreError> {
        Ok(self.users.get(id).cloned())
    }
}

/// Stores `instance` and indexes it as known. The current pointer is left alone.
pub async fn register_instance(
    instances: &dyn InstanceStore,
    instance: &Instance,
) -> Result<(), StoreError> {
    instances.store_instance(instance).await?;

    let mut known = instances.load_known_instances().await?;
    known.insert(instance.key().to_string(), instance.instance_type());
    instances.store_known_instances(&known).await
}

/// Stores `instance`, indexes it as known and makes it the current one.
pub async fn install_instance(
    instances: &dyn InstanceStore,
    current: &dyn CurrentInstanceStore,
    instance: &Instance,
) -> Result<(), StoreError> {
    register_instance(instances, instance).await?;
    current.store_current_instance(instance).await?;
    tracing::info!(instance = instance.key(), r#type = %instance.instance_type(), "installed instance");
    Ok(())
}

/// Replaces a stored instance. The current pointer follows only if it
/// already referred to it.
pub async fn reinstall_instance(
    instances: &dyn InstanceStore,
    current: &dyn CurrentInstanceStore,
    instance: &Instance,
) -> Result<(), StoreError> {
    register_instance(instances, instance).await?;
    if current
        .load_current_instance()
        .await?
        .is_some_and(|existing| existing.key() == instance.key())
    {
        current.store_current_instance(instance).await?;
    }
    tracing::info!(instance = instance.key(), "reinstalled instance");
    Ok(())
}

/// Removes the instance stored under `key` and, if it was current, clears
/// the current pointer. Returns the removed instance.
pub async fn uninstall_instance(
    instances: &dyn InstanceStore,
    current: &dyn CurrentInstanceStore,
    key: &str,
) -> Result<Option<Instance>, StoreError> {
    let removed = instances.load_instance(key).await?;
    instances.delete_instance(key).await?;

    let mut known = instances.load_known_instances().await?;
    if known.shift_remove(key).is_some() {
        instances.store_known_instances(&known).await?;
    }

    if current
        .load_current_instance()
        .await?
        .is_some_and(|instance| instance.key() == key)
    {
        current.clear_current_instance().await?;
    }

    tracing::info!(instance = key, "uninstalled instance");
    Ok(removed)
}
