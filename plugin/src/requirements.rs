//! Requirements populate one piece of the [`ActionContext`] each.
//!
//! Every requirement returns immediately when its state is already present,
//! runs the requirements it depends on before its own work, and on failure
//! responds before returning the error. The canonical order is
//! caller id, caller, instance, Jira user, Jira client.
//!
//! [`ActionContext`]: crate::action::ActionContext

use crate::action::{Action, ActionFuture};
use crate::errors::ActionError;
use crate::instance::InstanceType;
use http::{Method, StatusCode};

pub fn require_caller_id(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        if action.context().caller_id().is_empty() {
            return Err(action.respond_error(
                StatusCode::UNAUTHORIZED,
                ActionError::Unauthorized("caller is not authenticated".into()),
            ));
        }
        Ok(())
    })
}

/// Loads the caller from the user directory.
pub fn require_caller(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        if action.context().caller().is_some() {
            return Ok(());
        }
        require_caller_id(action).await?;

        let deps = action.context().deps().clone();
        let caller_id = action.context().caller_id().to_string();
        match deps.users.get_user(&caller_id).await {
            Ok(Some(caller)) => {
                action.context_mut().caller = Some(caller);
                Ok(())
            }
            Ok(None) => Err(action.respond_error(
                StatusCode::UNAUTHORIZED,
                ActionError::Unauthorized(format!("unknown user {caller_id}")),
            )),
            Err(err) => Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream(format!("failed to load user {caller_id}"), err),
            )),
        }
    })
}

/// Requires a caller holding the system administrator role.
pub fn require_admin(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        require_caller(action).await?;

        let is_admin = action
            .context()
            .caller()
            .is_some_and(|caller| caller.is_system_admin());
        if !is_admin {
            return Err(action.respond_error(
                StatusCode::UNAUTHORIZED,
                ActionError::Unauthorized("requires a system administrator".into()),
            ));
        }
        Ok(())
    })
}

/// Loads the current instance.
pub fn require_instance(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        if action.context().instance().is_some() {
            return Ok(());
        }

        let deps = action.context().deps().clone();
        match deps.current_instance_store.load_current_instance().await {
            Ok(Some(instance)) => {
                action.log_debug(&format!("loaded current instance {}", instance.key()));
                action.context_mut().instance = Some(instance);
                Ok(())
            }
            Ok(None) => Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::Misconfigured("no Jira instance has been installed".into()),
            )),
            Err(err) => Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream("failed to load current Jira instance", err),
            )),
        }
    })
}

async fn require_instance_type(
    action: &mut dyn Action,
    expected: InstanceType,
) -> Result<(), ActionError> {
    require_instance(action).await?;

    let actual = action.context().instance().map(|i| i.instance_type());
    if actual != Some(expected) {
        let actual = actual.map(|t| t.to_string()).unwrap_or_default();
        return Err(action.respond_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ActionError::Misconfigured(format!(
                "requires a {expected} Jira instance, the current one is {actual}"
            )),
        ));
    }
    Ok(())
}

pub fn require_server_instance(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(require_instance_type(action, InstanceType::Server))
}

pub fn require_cloud_instance(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(require_instance_type(action, InstanceType::Cloud))
}

/// Loads the caller's identity on the current instance.
pub fn require_jira_user(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        if action.context().jira_user().is_some() {
            return Ok(());
        }
        require_caller_id(action).await?;
        require_instance(action).await?;

        let deps = action.context().deps().clone();
        let caller_id = action.context().caller_id().to_string();
        let Some(instance) = action.context().instance().cloned() else {
            return Err(ActionError::Misconfigured("instance vanished".into()));
        };

        match deps.user_store.load_user(&instance, &caller_id).await {
            Ok(Some(jira_user)) => {
                action.context_mut().jira_user = Some(jira_user);
                Ok(())
            }
            Ok(None) => Err(action.respond_error(
                StatusCode::UNAUTHORIZED,
                ActionError::NotConnected(format!(
                    "user {caller_id} must connect to {} first",
                    instance.key()
                )),
            )),
            Err(err) => Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream(
                    format!("failed to load Jira user for {caller_id} on {}", instance.key()),
                    err,
                ),
            )),
        }
    })
}

/// Builds a client authenticated as the caller's Jira user.
pub fn require_jira_client(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        if action.context().client().is_some() {
            return Ok(());
        }
        require_jira_user(action).await?;

        let deps = action.context().deps().clone();
        let (Some(instance), Some(jira_user)) = (
            action.context().instance().cloned(),
            action.context().jira_user().cloned(),
        ) else {
            return Err(ActionError::Misconfigured("Jira user vanished".into()));
        };

        match instance
            .client(
                &deps.config,
                deps.secret_store.as_ref(),
                &deps.http,
                &jira_user,
            )
            .await
        {
            Ok(client) => {
                action.context_mut().client = Some(client);
                Ok(())
            }
            Err(err) => {
                let err = ActionError::from(err);
                Err(action.respond_error(err.status_code(), err))
            }
        }
    })
}

fn require_method(action: &mut dyn Action, expected: Method) -> Result<(), ActionError> {
    match action.http_method() {
        Some(method) if *method != expected => {
            let method = method.to_string();
            Err(action.respond_error(
                StatusCode::METHOD_NOT_ALLOWED,
                ActionError::MethodNotAllowed(method),
            ))
        }
        _ => Ok(()),
    }
}

pub fn require_http_post(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move { require_method(action, Method::POST) })
}

pub fn require_http_get(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move { require_method(action, Method::GET) })
}
