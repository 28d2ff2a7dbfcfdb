pub mod action;
pub mod client;
pub mod config;
pub mod errors;
pub mod instance;
pub mod metrics_defs;
pub mod requirements;
pub mod routes;
pub mod service;
pub mod store;
pub mod templates;

#[cfg(test)]
mod testutils;

use crate::action::PluginDeps;
use crate::service::PluginService;
use crate::store::{
    CurrentInstanceStore, MemoryKvStore, PluginStore, SecretSettings, StaticUserDirectory,
};
use crate::templates::Templates;
use async_trait::async_trait;
use shared::admin_service::{AdminService, ReadinessProbe};
use shared::http::run_http_service;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum PluginError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] config::ValidationError),

    #[error("failed to load templates: {0}")]
    Templates(#[from] minijinja::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Ready once the store answers.
struct StoreProbe {
    store: Arc<dyn CurrentInstanceStore>,
}

#[async_trait]
impl ReadinessProbe for StoreProbe {
    async fn check(&self) -> Result<(), String> {
        self.store
            .load_current_instance()
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Wires the collaborators for `config`, backed by an in-process store.
pub fn build_deps(config: config::Config) -> Result<Arc<PluginDeps>, PluginError> {
    let store = Arc::new(PluginStore::new(
        MemoryKvStore::new(),
        SecretSettings::from_config(&config),
    ));
    let users = Arc::new(StaticUserDirectory::new(config.directory.clone()));
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()?;

    Ok(Arc::new(PluginDeps {
        config,
        current_instance_store: store.clone(),
        instance_store: store.clone(),
        user_store: store.clone(),
        secret_store: store,
        users,
        templates: Templates::new()?,
        http,
    }))
}

pub async fn run(config: config::Config) -> Result<(), PluginError> {
    config.validate()?;

    let listener = config.listener.clone();
    let admin_listener = config.admin_listener.clone();
    let deps = build_deps(config)?;

    let probe = Arc::new(StoreProbe {
        store: deps.current_instance_store.clone(),
    });
    let plugin_service = PluginService::new(deps, routes::build_router());
    let admin_service = AdminService::new(probe);

    let plugin_task = run_http_service(&listener.host, listener.port, plugin_service);
    let admin_task = run_http_service(&admin_listener.host, admin_listener.port, admin_service);
    tokio::try_join!(plugin_task, admin_task)?;
    Ok(())
}
