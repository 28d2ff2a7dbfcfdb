use crate::action::{Action, ActionContext, PluginDeps};
use crate::config::{Config, Listener};
use crate::errors::{ActionError, StoreError};
use crate::store::{
    ChatUser, KvStore, MemoryKvStore, PluginStore, SecretSettings, StaticUserDirectory,
    UserDirectory,
};
use crate::templates::Templates;
use async_trait::async_trait;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use parking_lot::Mutex;
use shared::http::HttpBody;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use url::Url;

pub type TestStore = PluginStore<Arc<CountingKvStore>>;

pub fn test_config() -> Config {
    Config {
        listener: Listener {
            host: "127.0.0.1".into(),
            port: 8065,
        },
        admin_listener: Listener {
            host: "127.0.0.1".into(),
            port: 8066,
        },
        plugin_url: Url::parse("https://chat.example.com/plugins/jira").unwrap(),
        app_key: "mattermost-jira".into(),
        webhook_secret: "s3cret".into(),
        request_timeout_secs: 30,
        temporary_credentials_ttl_secs: 900,
        one_time_secret_ttl_secs: 900,
        rsa_key_bits: 1024,
        directory: vec![
            ChatUser {
                id: "u1".into(),
                username: "alice".into(),
                roles: vec!["system_user".into(), "system_admin".into()],
            },
            ChatUser {
                id: "u2".into(),
                username: "bob".into(),
                roles: vec!["system_user".into()],
            },
        ],
    }
}

/// [`KvStore`] that counts every call it serves.
#[derive(Default)]
pub struct CountingKvStore {
    inner: MemoryKvStore,
    calls: AtomicUsize,
}

impl CountingKvStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn expires_in(&self, key: &str) -> Option<Duration> {
        self.inner.expires_in(key)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStore for CountingKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.count();
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.count();
        self.inner.set(key, value).await
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.count();
        self.inner.set_with_expiry(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        self.count();
        self.inner.set_if_absent(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.count();
        self.inner.delete(key).await
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.count();
        self.inner.take(key).await
    }
}

/// User directory that counts lookups.
pub struct FakeUserDirectory {
    inner: StaticUserDirectory,
    calls: AtomicUsize,
}

impl FakeUserDirectory {
    pub fn new(users: Vec<ChatUser>) -> Self {
        FakeUserDirectory {
            inner: StaticUserDirectory::new(users),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserDirectory for FakeUserDirectory {
    async fn get_user(&self, id: &str) -> Result<Option<ChatUser>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_user(id).await
    }
}

pub fn test_store(config: &Config) -> TestStore {
    PluginStore::new(
        Arc::new(CountingKvStore::default()),
        SecretSettings::from_config(config),
    )
}

/// The collaborators behind a set of test deps.
#[derive(Clone)]
pub struct TestHandles {
    pub store: Arc<TestStore>,
    pub kv: Arc<CountingKvStore>,
    pub users: Arc<FakeUserDirectory>,
}

impl TestHandles {
    pub fn reset_calls(&self) {
        self.kv.calls.store(0, Ordering::SeqCst);
        self.users.calls.store(0, Ordering::SeqCst);
    }
}

pub fn test_deps(config: Config) -> (Arc<PluginDeps>, TestHandles) {
    let store = Arc::new(test_store(&config));
    let kv = store.kv().clone();
    let users = Arc::new(FakeUserDirectory::new(config.directory.clone()));

    let deps = Arc::new(PluginDeps {
        config,
        current_instance_store: store.clone(),
        instance_store: store.clone(),
        user_store: store.clone(),
        secret_store: store.clone(),
        users: users.clone(),
        templates: Templates::new().unwrap(),
        http: reqwest::Client::new(),
    });
    (deps, TestHandles { store, kv, users })
}

/// In-memory [`Action`] that records its responses and log lines.
pub struct TestAction {
    context: ActionContext,
    handles: TestHandles,
    path: String,
    method: Option<Method>,
    form: HashMap<String, String>,
    logs: Mutex<Vec<String>>,
    responses: Vec<(StatusCode, String)>,
}

impl TestAction {
    pub fn new(caller_id: &str, path: &str) -> Self {
        let (deps, handles) = test_deps(test_config());
        Self::with_deps(deps, handles, caller_id, path)
    }

    pub fn with_deps(
        deps: Arc<PluginDeps>,
        handles: TestHandles,
        caller_id: &str,
        path: &str,
    ) -> Self {
        TestAction {
            context: ActionContext::new(deps, caller_id),
            handles,
            path: path.to_string(),
            method: None,
            form: HashMap::new(),
            logs: Mutex::new(Vec::new()),
            responses: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_form(mut self, name: &str, value: &str) -> Self {
        self.form.insert(name.to_string(), value.to_string());
        self
    }

    pub fn handles(&self) -> &TestHandles {
        &self.handles
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().clone()
    }

    /// Status of the first response.
    pub fn status(&self) -> Option<StatusCode> {
        self.responses.first().map(|(status, _)| *status)
    }

    pub fn response_body(&self) -> Option<String> {
        self.responses.first().map(|(_, body)| body.clone())
    }

    fn record(&mut self, status: StatusCode, body: String) -> Result<(), ActionError> {
        self.responses.push((status, body));
        Ok(())
    }
}

impl Action for TestAction {
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
        self.method.as_ref()
    }

    fn form_value(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    fn respond_template(
        &mut self,
        name: &str,
        _content_type: &str,
        values: serde_json::Value,
    ) -> Result<(), ActionError> {
        let rendered = self
            .context
            .deps()
            .templates
            .render(name, &values)
            .map_err(|e| ActionError::Misconfigured(e.to_string()))?;
        self.record(StatusCode::OK, rendered)
    }

    fn respond_json(&mut self, value: serde_json::Value) -> Result<(), ActionError> {
        self.record(StatusCode::OK, value.to_string())
    }

    fn respond_redirect(&mut self, url: &str) -> Result<(), ActionError> {
        self.record(StatusCode::FOUND, url.to_string())
    }

    fn respond_text(&mut self, status: StatusCode, text: String) -> Result<(), ActionError> {
        self.record(status, text)
    }

    fn log_debug(&self, message: &str) {
        self.logs.lock().push(message.to_string());
    }

    fn log_info(&self, message: &str) {
        self.logs.lock().push(message.to_string());
    }

    fn log_error(&self, message: &str) {
        self.logs.lock().push(message.to_string());
    }
}

pub async fn response_text(response: Response<HttpBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn fake_jira_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = match (req.method(), req.uri().path()) {
        (&Method::POST, "/plugins/servlet/oauth/request-token") => {
            "oauth_token=request-token&oauth_token_secret=request-secret"
        }
        (&Method::POST, "/plugins/servlet/oauth/access-token") => {
            "oauth_token=access-token&oauth_token_secret=access-secret"
        }
        (&Method::GET, "/rest/api/2/myself") => {
            r#"{"key":"alice","name":"alice","displayName":"Alice"}"#
        }
        _ => {
            let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            return Ok(response);
        }
    };
    Ok(Response::new(Full::new(Bytes::from_static(body.as_bytes()))))
}

/// Starts a minimal Jira Server on an ephemeral port and returns its base URL.
pub async fn start_fake_jira() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service_fn(fake_jira_handler))
                    .await;
            });
        }
    });

    format!("http://{addr}")
}
