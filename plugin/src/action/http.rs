use super::{Action, ActionContext, PluginDeps};
use crate::errors::ActionError;
use ::http::header::{CONTENT_TYPE, HeaderValue, LOCATION};
use ::http::request::Parts;
use ::http::{HeaderMap, Method, Response, StatusCode};
use hyper::body::Bytes;
use shared::http::{HttpBody, full_body, make_boxed_error_response};
use std::collections::HashMap;
use std::sync::Arc;

/// Header the chat platform sets to the authenticated user's id.
pub const CALLER_ID_HEADER: &str = "Mattermost-User-Id";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// [`Action`] bound to one HTTP request.
///
/// Holds the request context rather than sharing fields with it. At most one
/// response is written; later attempts fail and leave the first in place.
pub struct HttpAction {
    context: ActionContext,
    method: Method,
    path: String,
    headers: HeaderMap,
    form: HashMap<String, String>,
    body: Bytes,
    response: Option<Response<HttpBody>>,
}

impl HttpAction {
    pub fn new(deps: Arc<PluginDeps>, parts: Parts, body: Bytes) -> Self {
        let caller_id = parts
            .headers
            .get(CALLER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut form: HashMap<String, String> = parts
            .uri
            .query()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        let is_form = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(FORM_CONTENT_TYPE));
        if is_form {
            form.extend(url::form_urlencoded::parse(&body).into_owned());
        }

        HttpAction {
            context: ActionContext::new(deps, caller_id),
            method: parts.method,
            path: parts.uri.path().to_string(),
            headers: parts.headers,
            form,
            body,
            response: None,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn has_responded(&self) -> bool {
        self.response.is_some()
    }

    /// The written response, or a 500 if the script never responded.
    pub fn into_response(self) -> Response<HttpBody> {
        match self.response {
            Some(response) => response,
            None => {
                tracing::error!(path = %self.path, "script finished without a response");
                make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    fn respond(
        &mut self,
        status: StatusCode,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<(), ActionError> {
        let content_type = HeaderValue::from_str(content_type)
            .map_err(|e| ActionError::Response(format!("content type {content_type}: {e}")))?;

        let mut response = Response::new(full_body(body));
        *response.status_mut() = status;
        response.headers_mut().insert(CONTENT_TYPE, content_type);
        self.set_response(response)
    }

    fn set_response(&mut self, response: Response<HttpBody>) -> Result<(), ActionError> {
        if self.response.is_some() {
            return Err(ActionError::Response(format!(
                "a response for {} was already written",
                self.path
            )));
        }
        self.response = Some(response);
        Ok(())
    }
}

impl Action for HttpAction {
    fn context(&self) -> &ActionContext {
        &self.context
    }

    fn context_mut(&mut self) -> &mut ActionContext {
        &mut self.context
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn http_method(&self) -> Option<&Method> {
        Some(&self.method)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn form_value(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    fn respond_template(
        &mut self,
        name: &str,
        content_type: &str,
        values: serde_json::Value,
    ) -> Result<(), ActionError> {
        let rendered = self
            .context
            .deps()
            .templates
            .render(name, &values)
            .map_err(|e| ActionError::Misconfigured(format!("template {name}: {e}")))?;
        self.respond(StatusCode::OK, content_type, rendered)
    }

    fn respond_json(&mut self, value: serde_json::Value) -> Result<(), ActionError> {
        let body = serde_json::to_vec(&value).map_err(|e| ActionError::Response(e.to_string()))?;
        self.respond(StatusCode::OK, "application/json", body)
    }

    fn respond_redirect(&mut self, url: &str) -> Result<(), ActionError> {
        let location = HeaderValue::from_str(url)
            .map_err(|e| ActionError::Response(format!("redirect location {url}: {e}")))?;

        let mut response = Response::new(full_body(Bytes::new()));
        *response.status_mut() = StatusCode::FOUND;
        response.headers_mut().insert(LOCATION, location);
        self.set_response(response)
    }

    fn respond_text(&mut self, status: StatusCode, text: String) -> Result<(), ActionError> {
        self.respond(status, "text/plain; charset=utf-8", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{response_text, test_config, test_deps};
    use ::http::Request;

    fn action(request: Request<&'static str>) -> HttpAction {
        let (deps, _) = test_deps(test_config());
        let (parts, body) = request.into_parts();
        HttpAction::new(deps, parts, Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn test_request_parameters() {
        let action = action(
            Request::post("/webhook/?secret=from-query&team=a")
                .header(CALLER_ID_HEADER, "caller-1")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body("secret=from%20body")
                .unwrap(),
        );

        assert_eq!(action.context().caller_id(), "caller-1");
        assert_eq!(action.header("mattermost-user-id"), Some("caller-1"));
        assert_eq!(action.path(), "/webhook/");
        assert_eq!(action.http_method(), Some(&Method::POST));
        assert_eq!(action.form_value("secret"), Some("from body"));
        assert_eq!(action.form_value("team"), Some("a"));
        assert_eq!(action.form_value("missing"), None);
    }

    #[test]
    fn test_json_body_is_not_parsed_as_form() {
        let action = action(
            Request::post("/ac/installed")
                .header(CONTENT_TYPE, "application/json")
                .body(r#"{"key":"value"}"#)
                .unwrap(),
        );
        assert_eq!(action.context().caller_id(), "");
        assert_eq!(action.form_value("key"), None);
        assert_eq!(action.body(), br#"{"key":"value"}"#);
    }

    #[tokio::test]
    async fn test_first_response_stands() {
        let mut action = action(Request::get("/").body("").unwrap());
        action.respond_redirect("https://jira.example.com/authorize").unwrap();
        assert!(action.has_responded());

        let err = action.respond_json(serde_json::json!({"ok": true})).unwrap_err();
        assert!(matches!(err, ActionError::Response(_)));

        let response = action.into_response();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[LOCATION],
            "https://jira.example.com/authorize"
        );
    }

    #[tokio::test]
    async fn test_respond_error() {
        let mut action = action(Request::get("/").body("").unwrap());
        let err = action.respond_error(
            StatusCode::UNAUTHORIZED,
            ActionError::Unauthorized("not authorized".into()),
        );
        assert_eq!(err, ActionError::Unauthorized("not authorized".into()));

        let response = action.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response_text(response).await,
            "not authorized: not authorized"
        );
    }

    #[tokio::test]
    async fn test_missing_response_is_500() {
        let action = action(Request::get("/").body("").unwrap());
        let response = action.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_respond_template() {
        let mut action = action(Request::get("/").body("").unwrap());
        action
            .respond_template(
                "message.html",
                "text/html",
                serde_json::json!({"title": "Done", "message": "<b>hi</b>"}),
            )
            .unwrap();

        let response = action.into_response();
        assert_eq!(response.headers()[CONTENT_TYPE], "text/html");
        let body = response_text(response).await;
        assert!(body.contains("Done"));
        assert!(body.contains("&lt;b&gt;hi"));
        assert!(!body.contains("<b>"));
    }
}
