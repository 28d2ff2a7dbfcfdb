use http::StatusCode;
use std::fmt::Display;
use thiserror::Error;

/// Failures reported by the persistence collaborators.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error for {key}: {message}")]
    Backend { key: String, message: String },

    #[error("failed to encode value for {key}: {message}")]
    Encode { key: String, message: String },

    #[error("failed to decode value for {key}: {message}")]
    Decode { key: String, message: String },

    #[error("failed to generate key material: {0}")]
    KeyGeneration(String),

    #[error("value for {0} is missing after a concurrent create")]
    Vanished(String),
}

/// Failures raised by an `Instance` while running its authentication protocol.
#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("{0}")]
    NotConnected(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} responded with status {status}: {body}")]
    UpstreamStatus {
        url: String,
        status: StatusCode,
        body: String,
    },

    /// The tracker answered the OAuth1 exchange with something unusable.
    #[error("invalid OAuth1 exchange: {0}")]
    OAuth1(String),

    /// The caller presented an authorization that was never issued to them,
    /// or that was already used.
    #[error("no matching authorization: {0}")]
    PendingAuthorization(String),

    #[error("invalid JWT: {0}")]
    Jwt(String),

    #[error("invalid connect token: {0}")]
    ConnectToken(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("key material error: {0}")]
    Key(String),
}

/// Error taxonomy of the request-authorization pipeline.
///
/// Payloads are rendered strings so the first failure of a chain can be
/// cloned onto the `ActionContext` for audit logging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("{0}")]
    Upstream(String),

    #[error("misconfigured: {0}")]
    Misconfigured(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("method {0} is not allowed")]
    MethodNotAllowed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to write response: {0}")]
    Response(String),
}

impl ActionError {
    /// Wraps a collaborator failure with the operation and the key it concerned.
    pub fn upstream(operation: impl Display, err: impl Display) -> Self {
        ActionError::Upstream(format!("{operation}: {err}"))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::Unauthorized(_) => "unauthorized",
            ActionError::Forbidden(_) => "forbidden",
            ActionError::NotConnected(_) => "not_connected",
            ActionError::Upstream(_) => "upstream",
            ActionError::Misconfigured(_) => "misconfigured",
            ActionError::BadRequest(_) => "bad_request",
            ActionError::MethodNotAllowed(_) => "method_not_allowed",
            ActionError::NotFound(_) => "not_found",
            ActionError::Response(_) => "response",
        }
    }

    /// Status a requirement uses when it has no reason to pick another one.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ActionError::Unauthorized(_) | ActionError::NotConnected(_) => {
                StatusCode::UNAUTHORIZED
            }
            ActionError::Forbidden(_) => StatusCode::FORBIDDEN,
            ActionError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ActionError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ActionError::NotFound(_) => StatusCode::NOT_FOUND,
            ActionError::Upstream(_) | ActionError::Misconfigured(_) | ActionError::Response(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<InstanceError> for ActionError {
    fn from(err: InstanceError) -> Self {
        match err {
            InstanceError::NotConnected(message) => ActionError::NotConnected(message),
            InstanceError::Jwt(_)
            | InstanceError::ConnectToken(_)
            | InstanceError::PendingAuthorization(_) => {
                ActionError::Unauthorized(err.to_string())
            }
            other => ActionError::Upstream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_error_classification() {
        let err: ActionError = InstanceError::NotConnected("connect first".into()).into();
        assert_eq!(err, ActionError::NotConnected("connect first".into()));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let err: ActionError = InstanceError::Store(StoreError::Backend {
            key: "rsa_key".into(),
            message: "timeout".into(),
        })
        .into();
        assert_eq!(
            err,
            ActionError::Upstream("store backend error for rsa_key: timeout".into())
        );
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_caller_errors_are_not_upstream_failures() {
        let err: ActionError =
            InstanceError::PendingAuthorization("request token mismatch".into()).into();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.kind(), "unauthorized");

        let err: ActionError = InstanceError::OAuth1("no oauth_token in response".into()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_upstream_wraps_context() {
        let err = ActionError::upstream("load user alice", "connection reset");
        assert_eq!(err.to_string(), "load user alice: connection reset");
    }
}
