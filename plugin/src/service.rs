use crate::action::{ActionRouter, HttpAction, PluginDeps};
use crate::metrics_defs::{REQUEST_DURATION, REQUEST_TIMEOUTS, REQUESTS_INFLIGHT};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use shared::http::{HttpBody, make_boxed_error_response};
use shared::{counter, gauge, histogram};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

/// Holds one slot of the in-flight gauge until dropped, so requests whose
/// future is abandoned mid-flight are released too.
struct InflightGuard;

impl InflightGuard {
    fn acquire() -> Self {
        gauge!(REQUESTS_INFLIGHT).increment(1.0);
        InflightGuard
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
    }
}

/// Serves the plugin routes over HTTP. Every request gets a fresh
/// [`HttpAction`] and with it a fresh context.
#[derive(Clone)]
pub struct PluginService {
    deps: Arc<PluginDeps>,
    router: Arc<ActionRouter>,
}

impl PluginService {
    pub fn new(deps: Arc<PluginDeps>, router: ActionRouter) -> Self {
        PluginService {
            deps,
            router: Arc::new(router),
        }
    }

    /// Runs the routed script for `request`, bounded by the request timeout.
    /// On timeout the script is dropped, cancelling any outbound call in flight.
    pub async fn handle_request<B>(&self, request: Request<B>) -> Response<HttpBody>
    where
        B: Body + Send,
        B::Error: std::fmt::Display,
    {
        let start = Instant::now();
        let inflight = InflightGuard::acquire();

        let (parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();

        let response = match timeout(self.deps.config.request_timeout(), async {
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(err) => {
                    tracing::debug!(path, error = %err, "failed to read request body");
                    return make_boxed_error_response(StatusCode::BAD_REQUEST);
                }
            };

            let mut action = HttpAction::new(self.deps.clone(), parts, body);
            let _ = self.router.run_route(&mut action).await;
            action.into_response()
        })
        .await
        {
            Ok(response) => response,
            Err(_) => {
                counter!(REQUEST_TIMEOUTS).increment(1);
                tracing::warn!(path, "request timed out");
                make_boxed_error_response(StatusCode::GATEWAY_TIMEOUT)
            }
        };

        drop(inflight);
        histogram!(REQUEST_DURATION, "status" => response.status().as_str().to_string())
            .record(start.elapsed().as_secs_f64());
        response
    }
}

impl<B> Service<Request<B>> for PluginService
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    type Response = Response<HttpBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle_request(req).await) })
    }
}
