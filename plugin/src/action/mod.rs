//! The request-authorization pipeline.
//!
//! A request is represented by an [`Action`]: the transport binding owns an
//! [`ActionContext`] and offers parameter access, response methods and
//! logging. The [`ActionRouter`] picks an [`ActionScript`] for the request
//! path and runs it. Scripts are lists of requirements, see
//! [`crate::requirements`], ending with a handler.

mod context;
mod http;
mod router;
mod script;

pub use self::http::{CALLER_ID_HEADER, HttpAction};
pub use context::{ActionContext, PluginDeps};
pub use router::ActionRouter;
pub use script::ActionScript;

use crate::errors::ActionError;
use ::http::{Method, StatusCode};
use std::future::Future;
use std::pin::Pin;

pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>>;

/// A requirement or handler. Requirements return early when their state is
/// already on the context; on failure they respond before returning the error.
pub type ActionFunc = for<'a> fn(&'a mut dyn Action) -> ActionFuture<'a>;

/// What requirements and handlers are given to work with.
pub trait Action: Send {
    fn context(&self) -> &ActionContext;

    fn context_mut(&mut self) -> &mut ActionContext;

    /// Request path, used for routing.
    fn path(&self) -> &str;

    /// `None` for transports without request methods.
    fn http_method(&self) -> Option<&Method> {
        None
    }

    fn header(&self, _name: &str) -> Option<&str> {
        None
    }

    /// Raw request body.
    fn body(&self) -> &[u8] {
        &[]
    }

    fn form_value(&self, name: &str) -> Option<&str>;

    /// Renders the named template with `values`.
    fn respond_template(
        &mut self,
        name: &str,
        content_type: &str,
        values: serde_json::Value,
    ) -> Result<(), ActionError>;

    fn respond_json(&mut self, value: serde_json::Value) -> Result<(), ActionError>;

    fn respond_redirect(&mut self, url: &str) -> Result<(), ActionError>;

    fn respond_text(&mut self, status: StatusCode, text: String) -> Result<(), ActionError>;

    /// Responds with `status` and the error message, and hands `err` back so
    /// a requirement can `return Err(action.respond_error(..))`.
    fn respond_error(&mut self, status: StatusCode, err: ActionError) -> ActionError {
        let message = err.to_string();
        if let Err(response_err) = self.respond_text(status, message) {
            self.log_error(&response_err.to_string());
        }
        err
    }

    fn log_debug(&self, message: &str) {
        tracing::debug!(caller_id = self.context().caller_id(), path = self.path(), "{message}");
    }

    fn log_info(&self, message: &str) {
        tracing::info!(caller_id = self.context().caller_id(), path = self.path(), "{message}");
    }

    fn log_error(&self, message: &str) {
        tracing::error!(caller_id = self.context().caller_id(), path = self.path(), "{message}");
    }
}
