use crate::http::{HttpBody, full_body, make_boxed_error_response};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Decides whether the process can take traffic. Returns the reason when it cannot.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

/// Serves `/health` (liveness) and `/ready` (readiness) on the admin listener.
pub struct AdminService {
    probe: Arc<dyn ReadinessProbe>,
}

impl AdminService {
    pub fn new(probe: Arc<dyn ReadinessProbe>) -> Self {
        Self { probe }
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<HttpBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let probe = self.probe.clone();
        let path = req.uri().path().to_string();

        Box::pin(async move { Ok(admin_response(probe.as_ref(), &path).await) })
    }
}

async fn admin_response(probe: &dyn ReadinessProbe, path: &str) -> Response<HttpBody> {
    match path {
        "/health" => Response::new(full_body("ok\n")),
        "/ready" => match probe.check().await {
            Ok(()) => Response::new(full_body("ok\n")),
            Err(reason) => {
                tracing::debug!(%reason, "readiness check failed");
                let mut response = Response::new(full_body(format!("not ready: {reason}\n")));
                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                response
            }
        },
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}
