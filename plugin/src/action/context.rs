use crate::client::JiraClient;
use crate::config::Config;
use crate::errors::ActionError;
use crate::instance::{Instance, JiraUser};
use crate::store::{
    ChatUser, CurrentInstanceStore, InstanceStore, SecretStore, UserDirectory, UserStore,
};
use crate::templates::Templates;
use std::sync::Arc;

/// Process-wide collaborators injected into every request context.
pub struct PluginDeps {
    pub config: Config,
    pub current_instance_store: Arc<dyn CurrentInstanceStore>,
    pub instance_store: Arc<dyn InstanceStore>,
    pub user_store: Arc<dyn UserStore>,
    pub secret_store: Arc<dyn SecretStore>,
    pub users: Arc<dyn UserDirectory>,
    pub templates: Templates,
    pub http: reqwest::Client,
}

/// Request-scoped state, populated lazily by requirements.
///
/// A context is created per inbound request and owned by it. It is neither
/// `Clone` nor shared; values needed elsewhere must be copied out.
pub struct ActionContext {
    deps: Arc<PluginDeps>,
    caller_id: String,
    pub(crate) caller: Option<ChatUser>,
    pub(crate) instance: Option<Instance>,
    pub(crate) jira_user: Option<JiraUser>,
    pub(crate) client: Option<JiraClient>,
    error: Option<ActionError>,
}

impl ActionContext {
    /// `caller_id` is empty when the transport could not identify the caller.
    pub fn new(deps: Arc<PluginDeps>, caller_id: impl Into<String>) -> Self {
        ActionContext {
            deps,
            caller_id: caller_id.into(),
            caller: None,
            instance: None,
            jira_user: None,
            client: None,
            error: None,
        }
    }

    /// Clone the handle to keep collaborators across an `.await`.
    pub fn deps(&self) -> &Arc<PluginDeps> {
        &self.deps
    }

    pub fn config(&self) -> &Config {
        &self.deps.config
    }

    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    pub fn caller(&self) -> Option<&ChatUser> {
        self.caller.as_ref()
    }

    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    pub fn jira_user(&self) -> Option<&JiraUser> {
        self.jira_user.as_ref()
    }

    pub fn client(&self) -> Option<&JiraClient> {
        self.client.as_ref()
    }

    /// First error recorded by a script run, if any.
    pub fn error(&self) -> Option<&ActionError> {
        self.error.as_ref()
    }

    /// Records `err` unless an earlier error is already recorded.
    pub(crate) fn record_error(&mut self, err: &ActionError) {
        if self.error.is_none() {
            self.error = Some(err.clone());
        }
    }
}
