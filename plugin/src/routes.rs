//! The route table and its handlers.

use crate::action::{Action, ActionFuture, ActionRouter};
use crate::action_script;
use crate::errors::{ActionError, InstanceError};
use crate::instance::{AtlassianSecurityContext, CloudInstance, Instance, ServerInstance};
use crate::metrics_defs::ACTION_FAILURES;
use crate::requirements::{
    require_admin, require_caller, require_caller_id, require_cloud_instance, require_http_post,
    require_instance, require_jira_client, require_jira_user, require_server_instance,
};
use crate::store::{install_instance, register_instance, reinstall_instance, uninstall_instance};
use http::StatusCode;
use serde_json::json;
use shared::counter;

pub const WEBHOOK: &str = "/webhook";
pub const OAUTH1_CONNECT: &str = "/oauth1/connect";
pub const CONNECT: &str = "/connect";
pub const OAUTH1_COMPLETE: &str = crate::instance::OAUTH1_CALLBACK_PATH;
pub const OAUTH1_PUBLIC_KEY: &str = "/oauth1/public_key.html";
pub const AC_INSTALLED: &str = "/ac/installed";
pub const AC_UNINSTALLED: &str = "/ac/uninstalled";
pub const AC_USER_CONNECTED: &str = "/ac/user-connected";
pub const INSTANCES: &str = "/api/v2/instances";
pub const INSTALL_SERVER: &str = "/api/v2/instances/server";
pub const INSTALL_CLOUD: &str = "/api/v2/instances/cloud";
pub const USER_INFO: &str = "/api/v2/user/*";
pub const DISCONNECT: &str = "/disconnect";

const JWT_AUTHORIZATION_PREFIX: &str = "JWT ";

pub fn build_router() -> ActionRouter {
    ActionRouter::new(action_script![handle_not_found])
        .route(WEBHOOK, action_script![handle_webhook])
        .route(
            OAUTH1_CONNECT,
            action_script![require_caller, require_instance, handle_connect],
        )
        .route(
            CONNECT,
            action_script![require_caller, require_instance, handle_connect],
        )
        .route(
            OAUTH1_COMPLETE,
            action_script![require_caller, require_server_instance, handle_oauth1_complete],
        )
        .route(
            OAUTH1_PUBLIC_KEY,
            action_script![require_admin, handle_public_key],
        )
        .route(
            AC_INSTALLED,
            action_script![require_http_post, handle_installed],
        )
        .route(
            AC_UNINSTALLED,
            action_script![require_http_post, handle_uninstalled],
        )
        .route(
            AC_USER_CONNECTED,
            action_script![require_cloud_instance, handle_user_connected],
        )
        .route(
            INSTALL_SERVER,
            action_script![require_admin, require_http_post, handle_install_server],
        )
        .route(
            INSTALL_CLOUD,
            action_script![require_admin, require_http_post, handle_install_cloud],
        )
        .route(INSTANCES, action_script![require_admin, handle_list_instances])
        .route(
            USER_INFO,
            action_script![
                require_caller_id,
                require_instance,
                require_jira_user,
                require_jira_client,
                handle_user_info
            ],
        )
        .route(
            DISCONNECT,
            action_script![require_caller_id, require_instance, require_jira_user, handle_disconnect],
        )
        .with_log_filter(action_script![log_action])
}

/// Records the outcome of every request.
fn log_action(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let context = action.context();
        match context.error() {
            Some(err) => {
                counter!(ACTION_FAILURES, "kind" => err.kind()).increment(1);
                tracing::warn!(
                    caller_id = context.caller_id(),
                    path = action.path(),
                    error = %err,
                    "request failed"
                );
            }
            None => {
                tracing::info!(
                    caller_id = context.caller_id(),
                    path = action.path(),
                    "request served"
                );
            }
        }
        Ok(())
    })
}

fn handle_not_found(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let path = action.path().to_string();
        Err(action.respond_error(StatusCode::NOT_FOUND, ActionError::NotFound(path)))
    })
}

fn responded(action: &mut dyn Action, err: InstanceError) -> ActionError {
    let err = ActionError::from(err);
    action.respond_error(err.status_code(), err)
}

fn required_form_value(action: &mut dyn Action, name: &str) -> Result<String, ActionError> {
    match action.form_value(name).filter(|v| !v.is_empty()) {
        Some(value) => Ok(value.to_string()),
        None => Err(action.respond_error(
            StatusCode::BAD_REQUEST,
            ActionError::BadRequest(format!("missing {name}")),
        )),
    }
}

fn handle_webhook(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let expected = action.context().config().webhook_secret.clone();
        if expected.is_empty() {
            return Err(action.respond_error(
                StatusCode::FORBIDDEN,
                ActionError::Misconfigured("webhook secret is not configured".into()),
            ));
        }
        if action.form_value("secret") != Some(expected.as_str()) {
            return Err(action.respond_error(
                StatusCode::FORBIDDEN,
                ActionError::Forbidden("request URL: secret did not match".into()),
            ));
        }
        require_http_post(action).await?;

        action.log_debug(&format!(
            "received webhook payload of {} bytes",
            action.body().len()
        ));
        action.respond_text(StatusCode::OK, String::new())
    })
}

fn handle_connect(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let deps = action.context().deps().clone();
        let caller_id = action.context().caller_id().to_string();
        let Some(instance) = action.context().instance().cloned() else {
            return Err(ActionError::Misconfigured("instance vanished".into()));
        };

        match deps.user_store.load_user(&instance, &caller_id).await {
            Ok(Some(jira_user)) => {
                return action.respond_template(
                    "message.html",
                    "text/html",
                    json!({
                        "title": "Already connected",
                        "message": format!(
                            "Your account is already connected to {} on {}.",
                            jira_user.username(),
                            instance.url()
                        ),
                    }),
                );
            }
            Ok(None) => {}
            Err(err) => {
                return Err(action.respond_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ActionError::upstream(format!("failed to load Jira user for {caller_id}"), err),
                ));
            }
        }

        let url = match instance
            .user_connect_url(
                &deps.config,
                deps.secret_store.as_ref(),
                &deps.http,
                &caller_id,
            )
            .await
        {
            Ok(url) => url,
            Err(err) => return Err(responded(action, err)),
        };
        action.respond_redirect(&url)
    })
}

fn handle_oauth1_complete(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let oauth_token = required_form_value(action, "oauth_token")?;
        let verifier = required_form_value(action, "oauth_verifier")?;

        let deps = action.context().deps().clone();
        let caller_id = action.context().caller_id().to_string();
        let chat_username = action
            .context()
            .caller()
            .map(|c| c.username.clone())
            .unwrap_or_default();
        let Some(instance) = action.context().instance().cloned() else {
            return Err(ActionError::Misconfigured("instance vanished".into()));
        };
        let Instance::Server(server) = &instance else {
            return Err(ActionError::Misconfigured("not a server instance".into()));
        };

        let jira_user = match server
            .complete_oauth1(
                &deps.config,
                deps.secret_store.as_ref(),
                &deps.http,
                &caller_id,
                &oauth_token,
                &verifier,
            )
            .await
        {
            Ok(jira_user) => jira_user,
            Err(err) => return Err(responded(action, err)),
        };

        if let Err(err) = deps
            .user_store
            .store_user(&instance, &caller_id, &jira_user)
            .await
        {
            return Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream(format!("failed to store Jira user for {caller_id}"), err),
            ));
        }

        action.log_info(&format!(
            "connected to {} as {}",
            instance.key(),
            jira_user.username()
        ));
        action.respond_template(
            "oauth1-complete.html",
            "text/html",
            json!({
                "chat_username": chat_username,
                "jira_username": jira_user.username(),
                "instance_url": instance.url(),
            }),
        )
    })
}

fn handle_public_key(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let deps = action.context().deps().clone();
        match crate::instance::public_key_pem(deps.secret_store.as_ref()).await {
            Ok(pem) => action.respond_text(StatusCode::OK, pem),
            Err(err) => Err(responded(action, err)),
        }
    })
}

/// Verifies the `Authorization: JWT ...` header of a lifecycle request.
fn verify_lifecycle_jwt(action: &mut dyn Action, cloud: &CloudInstance) -> Result<(), ActionError> {
    let token = action
        .header(http::header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix(JWT_AUTHORIZATION_PREFIX))
        .unwrap_or_default()
        .to_string();
    match cloud.verify_jwt(&token) {
        Ok(_) => Ok(()),
        Err(err) => Err(responded(action, err)),
    }
}

fn parse_security_context(
    action: &mut dyn Action,
) -> Result<AtlassianSecurityContext, ActionError> {
    match serde_json::from_slice::<AtlassianSecurityContext>(action.body()) {
        Ok(context) if !context.base_url.is_empty() => Ok(context),
        Ok(_) => Err(action.respond_error(
            StatusCode::BAD_REQUEST,
            ActionError::BadRequest("installation has no baseUrl".into()),
        )),
        Err(err) => Err(action.respond_error(
            StatusCode::BAD_REQUEST,
            ActionError::BadRequest(format!("invalid installation payload: {err}")),
        )),
    }
}

fn handle_installed(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let security_context = parse_security_context(action)?;
        if security_context.shared_secret.is_empty() {
            return Err(action.respond_error(
                StatusCode::BAD_REQUEST,
                ActionError::BadRequest("installation has no sharedSecret".into()),
            ));
        }
        let deps = action.context().deps().clone();
        let instance = Instance::Cloud(CloudInstance::new(security_context));
        let key = instance.key().to_string();

        // Only a cloud instance an administrator registered can be installed
        let reinstall = match deps.instance_store.load_instance(&key).await {
            Ok(Some(Instance::Cloud(existing))) => {
                if existing.installed {
                    // Signed with the secret of the installation it replaces
                    verify_lifecycle_jwt(action, &existing)?;
                }
                existing.installed
            }
            Ok(_) => {
                return Err(action.respond_error(
                    StatusCode::FORBIDDEN,
                    ActionError::Forbidden(format!("{key} is not a registered cloud instance")),
                ));
            }
            Err(err) => {
                return Err(action.respond_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ActionError::upstream(format!("failed to load instance {key}"), err),
                ));
            }
        };

        let stored = if reinstall {
            reinstall_instance(
                deps.instance_store.as_ref(),
                deps.current_instance_store.as_ref(),
                &instance,
            )
            .await
        } else {
            install_instance(
                deps.instance_store.as_ref(),
                deps.current_instance_store.as_ref(),
                &instance,
            )
            .await
        };
        if let Err(err) = stored {
            return Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream(format!("failed to install {key}"), err),
            ));
        }
        action.respond_json(json!({ "status": "installed", "key": key }))
    })
}

fn handle_uninstalled(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let security_context = parse_security_context(action)?;
        let deps = action.context().deps().clone();
        let key = CloudInstance::new(security_context).key;

        match deps.instance_store.load_instance(&key).await {
            Ok(Some(Instance::Cloud(existing))) => verify_lifecycle_jwt(action, &existing)?,
            Ok(Some(_)) => {
                return Err(action.respond_error(
                    StatusCode::FORBIDDEN,
                    ActionError::Forbidden(format!("{key} is not a cloud instance")),
                ));
            }
            Ok(None) => {
                return Err(action.respond_error(
                    StatusCode::NOT_FOUND,
                    ActionError::NotFound(format!("no instance installed at {key}")),
                ));
            }
            Err(err) => {
                return Err(action.respond_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ActionError::upstream(format!("failed to load instance {key}"), err),
                ));
            }
        }

        if let Err(err) = uninstall_instance(
            deps.instance_store.as_ref(),
            deps.current_instance_store.as_ref(),
            &key,
        )
        .await
        {
            return Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream(format!("failed to uninstall {key}"), err),
            ));
        }
        action.respond_json(json!({ "status": "uninstalled", "key": key }))
    })
}

fn handle_user_connected(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let mm_token = required_form_value(action, "mm_token")?;
        let jwt = required_form_value(action, "jwt")?;

        let deps = action.context().deps().clone();
        let Some(instance) = action.context().instance().cloned() else {
            return Err(ActionError::Misconfigured("instance vanished".into()));
        };
        let Instance::Cloud(cloud) = &instance else {
            return Err(ActionError::Misconfigured("not a cloud instance".into()));
        };

        let (caller_id, jira_user) = match cloud
            .complete_user_connect(deps.secret_store.as_ref(), &mm_token, &jwt)
            .await
        {
            Ok(connected) => connected,
            Err(err) => return Err(responded(action, err)),
        };

        if let Err(err) = deps
            .user_store
            .store_user(&instance, &caller_id, &jira_user)
            .await
        {
            return Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream(format!("failed to store Jira user for {caller_id}"), err),
            ));
        }

        action.log_info(&format!("{caller_id} connected to {}", instance.key()));
        action.respond_template(
            "user-connected.html",
            "text/html",
            json!({
                "jira_username": jira_user.username(),
                "instance_url": instance.url(),
            }),
        )
    })
}

fn required_jira_url(action: &mut dyn Action) -> Result<url::Url, ActionError> {
    let raw_url = required_form_value(action, "url")?;
    match url::Url::parse(&raw_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
        _ => Err(action.respond_error(
            StatusCode::BAD_REQUEST,
            ActionError::BadRequest(format!("invalid Jira URL {raw_url}")),
        )),
    }
}

fn handle_install_server(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let url = required_jira_url(action)?;
        let deps = action.context().deps().clone();
        let instance = Instance::Server(ServerInstance::new(url.as_str(), &deps.config.app_key));

        if let Err(err) = install_instance(
            deps.instance_store.as_ref(),
            deps.current_instance_store.as_ref(),
            &instance,
        )
        .await
        {
            return Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream(format!("failed to install {}", instance.key()), err),
            ));
        }
        action.respond_json(json!(instance.display_details()))
    })
}

/// Registers a cloud instance that the tracker's `installed` callback may
/// then complete. It becomes current only once installed.
fn handle_install_cloud(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let url = required_jira_url(action)?;
        let deps = action.context().deps().clone();
        let instance = Instance::Cloud(CloudInstance::pending(url.as_str()));
        let key = instance.key().to_string();

        match deps.instance_store.load_instance(&key).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                return Err(action.respond_error(
                    StatusCode::BAD_REQUEST,
                    ActionError::BadRequest(format!("{key} is already registered")),
                ));
            }
            Err(err) => {
                return Err(action.respond_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ActionError::upstream(format!("failed to load instance {key}"), err),
                ));
            }
        }

        if let Err(err) = register_instance(deps.instance_store.as_ref(), &instance).await {
            return Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream(format!("failed to register {key}"), err),
            ));
        }
        action.respond_json(json!(instance.display_details()))
    })
}

fn handle_list_instances(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let deps = action.context().deps().clone();
        let known = match deps.instance_store.load_known_instances().await {
            Ok(known) => known,
            Err(err) => {
                return Err(action.respond_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ActionError::upstream("failed to load known instances", err),
                ));
            }
        };
        let current = match deps.current_instance_store.load_current_instance().await {
            Ok(current) => current.map(|i| i.key().to_string()),
            Err(err) => {
                return Err(action.respond_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ActionError::upstream("failed to load current instance", err),
                ));
            }
        };

        let instances: Vec<_> = known
            .iter()
            .map(|(key, instance_type)| {
                json!({
                    "key": key,
                    "type": instance_type,
                    "current": current.as_deref() == Some(key.as_str()),
                })
            })
            .collect();
        action.respond_json(json!({ "instances": instances, "current": current }))
    })
}

fn handle_user_info(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let context = action.context();
        let (Some(instance), Some(jira_user), Some(client)) =
            (context.instance(), context.jira_user(), context.client())
        else {
            return Err(ActionError::Misconfigured("Jira client vanished".into()));
        };

        let body = json!({
            "connected": true,
            "instance": instance.key(),
            "protocol": client.protocol(),
            "jira_user": {
                "key": jira_user.key,
                "name": jira_user.name,
                "account_id": jira_user.account_id,
                "display_name": jira_user.display_name,
            },
        });
        action.respond_json(body)
    })
}

fn handle_disconnect(action: &mut dyn Action) -> ActionFuture<'_> {
    Box::pin(async move {
        let deps = action.context().deps().clone();
        let caller_id = action.context().caller_id().to_string();
        let Some(instance) = action.context().instance().cloned() else {
            return Err(ActionError::Misconfigured("instance vanished".into()));
        };

        if let Err(err) = deps.user_store.delete_user(&instance, &caller_id).await {
            return Err(action.respond_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ActionError::upstream(format!("failed to delete Jira user for {caller_id}"), err),
            ));
        }

        action.log_info(&format!("disconnected from {}", instance.key()));
        action.respond_template(
            "message.html",
            "text/html",
            json!({
                "title": "Disconnected",
                "message": format!("Your account is no longer connected to {}.", instance.url()),
            }),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{CALLER_ID_HEADER, PluginDeps};
    use crate::instance::jwt::{self, JwtClaims};
    use crate::instance::{InstanceType, unix_now};
    use crate::service::PluginService;
    use crate::store::{CurrentInstanceStore, InstanceStore, UserStore, temporary_credentials_key};
    use crate::testutils::{TestHandles, response_text, start_fake_jira, test_config, test_deps};
    use http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
    use http::{Request, Response};
    use http_body_util::Full;
    use hyper::body::Bytes;
    use shared::http::HttpBody;
    use std::sync::Arc;

    const ADMIN: &str = "u1";
    const USER: &str = "u2";

    async fn serve(deps: &Arc<PluginDeps>, request: Request<Full<Bytes>>) -> Response<HttpBody> {
        PluginService::new(deps.clone(), build_router())
            .handle_request(request)
            .await
    }

    fn get(path: &str, caller_id: &str) -> Request<Full<Bytes>> {
        Request::get(path)
            .header(CALLER_ID_HEADER, caller_id)
            .body(Full::default())
            .unwrap()
    }

    fn post_form(path: &str, caller_id: &str, form: &str) -> Request<Full<Bytes>> {
        Request::post(path)
            .header(CALLER_ID_HEADER, caller_id)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(form.to_string())))
            .unwrap()
    }

    fn post_json(
        path: &str,
        body: serde_json::Value,
        authorization: Option<String>,
    ) -> Request<Full<Bytes>> {
        let mut builder = Request::post(path).header(CONTENT_TYPE, "application/json");
        if let Some(authorization) = authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        builder
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    fn installation() -> serde_json::Value {
        json!({
            "key": "mattermost-jira",
            "clientKey": "client-1",
            "sharedSecret": "shared",
            "baseUrl": "https://acme.atlassian.net",
            "eventType": "installed",
        })
    }

    fn tracker_jwt(sub: Option<&str>) -> String {
        let now = unix_now();
        jwt::encode(
            &JwtClaims {
                iss: "client-1".into(),
                iat: now,
                exp: now + 60,
                sub: sub.map(str::to_string),
                qsh: None,
            },
            b"shared",
        )
        .unwrap()
    }

    async fn install_server(deps: &Arc<PluginDeps>, url: &str) {
        let form = format!("url={}", crate::instance::oauth1::percent_encode(url));
        let response = serve(deps, post_form(INSTALL_SERVER, ADMIN, &form)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    async fn register_cloud(deps: &Arc<PluginDeps>) {
        let form = "url=https%3A%2F%2Facme.atlassian.net";
        let response = serve(deps, post_form(INSTALL_CLOUD, ADMIN, form)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_webhook_without_secret_is_forbidden() {
        let mut config = test_config();
        config.webhook_secret = String::new();
        let (deps, _) = test_deps(config);

        let response = serve(&deps, post_form("/webhook?secret=", "", "")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_webhook() {
        let (deps, _) = test_deps(test_config());

        let response = serve(&deps, post_form("/webhook?secret=wrong", "", "{}")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = serve(&deps, get("/webhook?secret=s3cret", "")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = serve(&deps, post_form("/webhook/?secret=s3cret", "", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_connect_redirects_and_stores_temporary_credentials() {
        let jira = start_fake_jira().await;
        let (deps, handles) = test_deps(test_config());
        install_server(&deps, &jira).await;

        let response = serve(&deps, get(CONNECT, USER)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[LOCATION],
            format!("{jira}/plugins/servlet/oauth/authorize?oauth_token=request-token").as_str()
        );
        assert!(
            handles
                .kv
                .expires_in(&temporary_credentials_key(USER))
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_oauth1_connect_flow() {
        let jira = start_fake_jira().await;
        let (deps, handles) = test_deps(test_config());
        install_server(&deps, &jira).await;

        // Not connected yet
        let response = serve(&deps, get("/api/v2/user", USER)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = serve(&deps, get(OAUTH1_CONNECT, USER)).await;
        assert_eq!(response.status(), StatusCode::FOUND);

        let response = serve(
            &deps,
            get(
                "/oauth1/complete.html?oauth_token=request-token&oauth_verifier=verifier",
                USER,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response_text(response).await.contains("bob is now connected to alice"));

        let response = serve(&deps, get("/api/v2/user/", USER)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let info: serde_json::Value =
            serde_json::from_str(&response_text(response).await).unwrap();
        assert_eq!(info["connected"], true);
        assert_eq!(info["protocol"], "server");
        assert_eq!(info["jira_user"]["name"], "alice");
        assert!(info["jira_user"].get("OAuth1AccessToken").is_none());

        // Connecting again does not start another flow
        let response = serve(&deps, get(CONNECT, USER)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let instance = handles.store.load_current_instance().await.unwrap().unwrap();
        assert_eq!(
            handles
                .store
                .load_user_id_by_username(&instance, "alice")
                .await
                .unwrap()
                .as_deref(),
            Some(USER)
        );

        let response = serve(&deps, get(DISCONNECT, USER)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = serve(&deps, get("/api/v2/user", USER)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_oauth1_complete_requires_token() {
        let (deps, _) = test_deps(test_config());
        install_server(&deps, "https://jira.example.com").await;

        let response = serve(&deps, get(OAUTH1_COMPLETE, USER)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oauth1_complete_with_unissued_token() {
        let jira = start_fake_jira().await;
        let (deps, handles) = test_deps(test_config());
        install_server(&deps, &jira).await;
        let complete = |token: &str| {
            get(
                &format!("{OAUTH1_COMPLETE}?oauth_token={token}&oauth_verifier=verifier"),
                USER,
            )
        };

        // No flow was started
        let response = serve(&deps, complete("request-token")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = serve(&deps, get(CONNECT, USER)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let response = serve(&deps, complete("forged")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let instance = current(&handles).await.unwrap();
        assert_eq!(handles.store.load_user(&instance, USER).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_admin_routes() {
        let (deps, handles) = test_deps(test_config());

        let response = serve(&deps, get(INSTANCES, USER)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = serve(&deps, post_form(INSTALL_SERVER, USER, "url=https://x.com")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(handles.store.load_known_instances().await.unwrap().is_empty());

        let response = serve(&deps, post_form(INSTALL_SERVER, ADMIN, "url=not-a-url")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = serve(&deps, get(INSTALL_SERVER, ADMIN)).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        install_server(&deps, "https://one.example.com/").await;
        install_server(&deps, "https://two.example.com").await;

        let response = serve(&deps, get(INSTANCES, ADMIN)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let listed: serde_json::Value =
            serde_json::from_str(&response_text(response).await).unwrap();
        assert_eq!(listed["current"], "https://two.example.com");
        assert_eq!(listed["instances"][0]["key"], "https://one.example.com");
        assert_eq!(listed["instances"][0]["type"], "server");
        assert_eq!(listed["instances"][0]["current"], false);
        assert_eq!(listed["instances"][1]["current"], true);

        let response = serve(&deps, get(OAUTH1_PUBLIC_KEY, ADMIN)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response_text(response)
                .await
                .starts_with("-----BEGIN PUBLIC KEY-----")
        );
    }

    async fn current(handles: &TestHandles) -> Option<Instance> {
        handles.store.load_current_instance().await.unwrap()
    }

    #[tokio::test]
    async fn test_cloud_lifecycle() {
        let (deps, handles) = test_deps(test_config());

        let response = serve(&deps, get(AC_INSTALLED, "")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = serve(&deps, post_json(AC_INSTALLED, json!({"key": 1}), None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        register_cloud(&deps).await;
        assert_eq!(current(&handles).await, None);

        let response = serve(&deps, post_json(AC_INSTALLED, installation(), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let installed = current(&handles).await.unwrap();
        assert_eq!(installed.key(), "https://acme.atlassian.net");
        assert_eq!(installed.instance_type(), InstanceType::Cloud);

        // Reinstalling needs a JWT signed with the existing shared secret
        let response = serve(&deps, post_json(AC_INSTALLED, installation(), None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let authorization = Some(format!("JWT {}", tracker_jwt(None)));
        let response = serve(
            &deps,
            post_json(AC_INSTALLED, installation(), authorization.clone()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = serve(&deps, post_json(AC_UNINSTALLED, installation(), None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(current(&handles).await.is_some());

        let response = serve(
            &deps,
            post_json(AC_UNINSTALLED, installation(), authorization),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(current(&handles).await, None);
        assert!(handles.store.load_known_instances().await.unwrap().is_empty());
        assert_eq!(
            handles
                .store
                .load_instance("https://acme.atlassian.net")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_unregistered_installations_are_refused() {
        let (deps, handles) = test_deps(test_config());
        install_server(&deps, "https://jira.corp.example.com").await;
        let admin_installed = current(&handles).await;

        // Nobody registered this URL
        let mut unknown = installation();
        unknown["baseUrl"] = json!("https://attacker.example.net");
        let response = serve(&deps, post_json(AC_INSTALLED, unknown, None)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // A server instance is not replaced by a cloud installation
        let mut over_server = installation();
        over_server["baseUrl"] = json!("https://jira.corp.example.com");
        let response = serve(&deps, post_json(AC_INSTALLED, over_server, None)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        assert_eq!(current(&handles).await, admin_installed);
        assert_eq!(
            handles
                .store
                .load_instance("https://jira.corp.example.com")
                .await
                .unwrap()
                .map(|instance| instance.instance_type()),
            Some(InstanceType::Server)
        );
        assert_eq!(
            handles
                .store
                .load_instance("https://attacker.example.net")
                .await
                .unwrap(),
            None
        );

        // Registration is admin only and happens once
        let form = "url=https%3A%2F%2Facme.atlassian.net";
        let response = serve(&deps, post_form(INSTALL_CLOUD, USER, form)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        register_cloud(&deps).await;
        let response = serve(&deps, post_form(INSTALL_CLOUD, ADMIN, form)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // A registered but not yet installed record cannot be uninstalled
        let forged = jwt::encode(
            &JwtClaims {
                exp: unix_now() + 60,
                ..Default::default()
            },
            b"",
        )
        .unwrap();
        let response = serve(
            &deps,
            post_json(AC_UNINSTALLED, installation(), Some(format!("JWT {forged}"))),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // An installation without a shared secret is malformed
        let mut no_secret = installation();
        no_secret["sharedSecret"] = json!("");
        let response = serve(&deps, post_json(AC_INSTALLED, no_secret, None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // The admin's instance is still current until the registered one installs
        assert_eq!(current(&handles).await, admin_installed);
        let response = serve(&deps, post_json(AC_INSTALLED, installation(), None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            current(&handles).await.map(|instance| instance.instance_type()),
            Some(InstanceType::Cloud)
        );
    }

    #[tokio::test]
    async fn test_cloud_user_connect() {
        let (deps, handles) = test_deps(test_config());
        register_cloud(&deps).await;
        let response = serve(&deps, post_json(AC_INSTALLED, installation(), None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = serve(&deps, get(CONNECT, ADMIN)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = url::Url::parse(response.headers()[LOCATION].to_str().unwrap()).unwrap();
        let mm_token = location
            .query_pairs()
            .find(|(k, _)| k == "mm_token")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let path = format!(
            "{AC_USER_CONNECTED}?mm_token={mm_token}&jwt={}",
            tracker_jwt(Some("account-1"))
        );
        let response = serve(&deps, get(&path, "")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let instance = current(&handles).await.unwrap();
        let jira_user = handles.store.load_user(&instance, ADMIN).await.unwrap().unwrap();
        assert_eq!(jira_user.account_id, "account-1");

        // The one-time secret is gone, so the link cannot be replayed
        let response = serve(&deps, get(&path, "")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = serve(&deps, get("/api/v2/user", ADMIN)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let info: serde_json::Value =
            serde_json::from_str(&response_text(response).await).unwrap();
        assert_eq!(info["protocol"], "cloud");
    }
}
