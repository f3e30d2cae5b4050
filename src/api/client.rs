//! Authenticated HTTP client for the campus API
//!
//! Wraps reqwest::Client with automatic token injection and refresh.
//! A 401 on a request that has not been retried starts one refresh cycle;
//! requests that hit a 401 while that cycle runs wait in a queue and are
//! replayed with the token it produces.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use url::Url;

use super::error::ApiError;
use crate::auth::tokens::EXPIRY_BUFFER;
use crate::auth::{MemoryTokenStore, Refresher, TokenStore};
use crate::config::Config;

pub const LOGIN_PATH: &str = "/auth/login";
pub const REFRESH_PATH: &str = "/auth/refresh";

const DEFAULT_API_BASE: &str = "/api";
const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = concat!("campus-cli/", env!("CARGO_PKG_VERSION"));

/// A request as the client replays it.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Self {
            method,
            path,
            query: Vec::new(),
            body: None,
            retried: false,
        }
    }

    pub fn query(mut self, pairs: &[(&str, &str)]) -> Self {
        self.query
            .extend(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body).map_err(|e| ApiError::RequestSetup {
            url: self.path.clone(),
            reason: format!("Failed to serialize body: {}", e),
        })?;
        self.body = Some(value);
        Ok(self)
    }

    /// Mark the request as already replayed once after a refresh.
    pub fn mark_retried(mut self) -> Self {
        self.retried = true;
        self
    }

    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// Login and refresh calls never carry a bearer token or trigger a refresh.
    fn is_auth_endpoint(&self) -> bool {
        self.path == LOGIN_PATH || self.path == REFRESH_PATH
    }
}

/// Refresh-cycle bookkeeping, owned by one client.
#[derive(Default)]
struct RefreshQueue {
    in_progress: bool,
    waiters: Vec<oneshot::Sender<Option<String>>>,
}

/// Ends a refresh cycle on every path out of the leading request,
/// including the leader being dropped mid-refresh.
struct RefreshCycle<'a> {
    queue: &'a Mutex<RefreshQueue>,
    settled: bool,
}

impl RefreshCycle<'_> {
    fn settle(&mut self, token: Option<&str>) {
        self.settled = true;
        let waiters = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.in_progress = false;
            std::mem::take(&mut queue.waiters)
        };
        if !waiters.is_empty() {
            tracing::debug!("Releasing {} queued request(s)", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.send(token.map(str::to_string));
        }
    }
}

impl Drop for RefreshCycle<'_> {
    fn drop(&mut self) {
        if !self.settled {
            // Dropped senders tell the waiters to fetch a token themselves.
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.in_progress = false;
            queue.waiters.clear();
        }
    }
}

/// Campus API client. Cheap to clone; clones share credentials and the
/// refresh queue.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    refresher: Refresher,
    queue: Mutex<RefreshQueue>,
}

impl ApiClient {
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::default()
    }

    /// Build a client from the on-disk config and the given credential store.
    pub fn from_config(config: &Config, store: Arc<dyn TokenStore>) -> Result<Self, ApiError> {
        Self::builder()
            .server(&config.server)
            .api_base(&config.api_base)
            .store(store)
            .refresh_buffer(Duration::from_secs(config.refresh_buffer_secs))
            .request_timeout(Duration::from_secs(config.request_timeout_secs))
            .refresh_timeout(Duration::from_secs(config.refresh_timeout_secs))
            .build()
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn refresher(&self) -> &Refresher {
        &self.inner.refresher
    }

    /// GET `path` and decode the JSON body.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.call(Method::GET, path, Ok).await
    }

    /// GET `path` with query parameters and decode the JSON body.
    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        self.call(Method::GET, path, |r| Ok(r.query(query))).await
    }

    /// POST a JSON body to `path` and decode the JSON reply.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.call(Method::POST, path, |r| r.json(body)).await
    }

    /// PUT a JSON body to `path` and decode the JSON reply.
    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.call(Method::PUT, path, |r| r.json(body)).await
    }

    /// DELETE `path` and decode the JSON reply (`null` if empty).
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.call(Method::DELETE, path, Ok).await
    }

    /// Send a prepared request and return the raw successful response.
    pub async fn send(&self, request: ApiRequest) -> Result<reqwest::Response, ApiError> {
        let method = request.method.clone();
        let path = request.path.clone();
        let result = self.execute(request).await;
        if let Err(e) = &result {
            report_failure(&method, &path, e);
        }
        result
    }

    async fn call<T, F>(&self, method: Method, path: &str, prepare: F) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: FnOnce(ApiRequest) -> Result<ApiRequest, ApiError>,
    {
        let result = async {
            let request = prepare(ApiRequest::new(method.clone(), path))?;
            let resp = self.execute(request).await?;
            decode_json(resp).await
        }
        .await;

        if let Err(e) = &result {
            report_failure(&method, path, e);
        }
        result
    }

    async fn execute(&self, request: ApiRequest) -> Result<reqwest::Response, ApiError> {
        let token = if request.is_auth_endpoint() {
            None
        } else {
            self.inner.refresher.get_valid_access_token().await
        };

        let resp = self.send_once(&request, token.as_deref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED || request.is_auth_endpoint() {
            return check_response(resp).await;
        }
        let rejected = status_error(resp).await;

        if request.is_retried() {
            tracing::debug!(
                "{} {} rejected after retry, giving up",
                request.method,
                request.path
            );
            return Err(rejected);
        }

        self.recover(request.mark_retried(), token, rejected).await
    }

    /// Refresh once for everyone who hit a 401, then replay.
    async fn recover(
        &self,
        request: ApiRequest,
        sent_token: Option<String>,
        rejected: ApiError,
    ) -> Result<reqwest::Response, ApiError> {
        let waiter = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.in_progress {
                let (tx, rx) = oneshot::channel();
                queue.waiters.push(tx);
                Some(rx)
            } else {
                queue.in_progress = true;
                None
            }
        };

        if let Some(rx) = waiter {
            tracing::debug!(
                "Refresh in progress, queueing {} {}",
                request.method,
                request.path
            );
            let token = match rx.await {
                Ok(token) => token,
                Err(_) => self.token_after_rejection(sent_token.as_deref()).await,
            };
            return match token {
                Some(token) => self.replay(&request, &token).await,
                None => Err(ApiError::SessionExpired),
            };
        }

        let mut cycle = RefreshCycle {
            queue: &self.inner.queue,
            settled: false,
        };
        tracing::info!("Access token rejected, refreshing...");

        match self.token_after_rejection(sent_token.as_deref()).await {
            Some(token) => {
                cycle.settle(Some(&token));
                self.replay(&request, &token).await
            }
            None => {
                cycle.settle(None);
                self.inner.refresher.clear_tokens();
                Err(rejected)
            }
        }
    }

    async fn token_after_rejection(&self, sent_token: Option<&str>) -> Option<String> {
        match sent_token {
            Some(sent) => self.inner.refresher.replace_rejected_token(sent).await,
            None => self.inner.refresher.get_valid_access_token().await,
        }
    }

    async fn replay(
        &self,
        request: &ApiRequest,
        token: &str,
    ) -> Result<reqwest::Response, ApiError> {
        tracing::debug!("Replaying {} {}", request.method, request.path);
        let resp = self.send_once(request, Some(token)).await?;
        check_response(resp).await
    }

    async fn send_once(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.inner.base_url, request.path);
        tracing::debug!("{} {}", request.method, url);

        let mut builder = self.inner.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        builder
            .send()
            .await
            .map_err(|e| ApiError::from_transport(&url, e))
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    if !resp.status().is_success() {
        return Err(status_error(resp).await);
    }
    Ok(resp)
}

async fn status_error(resp: reqwest::Response) -> ApiError {
    let status = resp.status().as_u16();
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    ApiError::Status { status, url, body }
}

async fn decode_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let url = resp.url().to_string();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ApiError::from_transport(&url, e))?;
    let bytes: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        &bytes
    };
    serde_json::from_slice(bytes).map_err(|source| ApiError::Decode { url, source })
}

/// Single diagnostic path for every failed call.
fn report_failure(method: &Method, path: &str, err: &ApiError) {
    match err {
        ApiError::Status { status, body, .. } => {
            tracing::warn!("{} {} failed with HTTP {}: {}", method, path, status, body);
        }
        ApiError::Network { source, .. } => {
            tracing::error!("{} {}: no response from server: {}", method, path, source);
        }
        ApiError::RequestSetup { reason, .. } => {
            tracing::error!("{} {}: request could not be sent: {}", method, path, reason);
        }
        other => {
            tracing::warn!("{} {} failed: {}", method, path, other);
        }
    }
}

/// Builder for [`ApiClient`]
pub struct ApiClientBuilder {
    server: Option<String>,
    api_base: String,
    store: Option<Arc<dyn TokenStore>>,
    refresh_buffer: Duration,
    request_timeout: Option<Duration>,
    refresh_timeout: Duration,
    user_agent: Option<String>,
}

impl Default for ApiClientBuilder {
    fn default() -> Self {
        Self {
            server: None,
            api_base: DEFAULT_API_BASE.to_string(),
            store: None,
            refresh_buffer: EXPIRY_BUFFER,
            request_timeout: None,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            user_agent: None,
        }
    }
}

impl ApiClientBuilder {
    /// Server origin, e.g. `http://localhost:3000`
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Path prefix of every endpoint (default `/api`)
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Credential store (default: in-memory)
    pub fn store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn refresh_buffer(mut self, buffer: Duration) -> Self {
        self.refresh_buffer = buffer;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn build(self) -> Result<ApiClient, ApiError> {
        let server = self
            .server
            .ok_or_else(|| ApiError::Configuration("server is required".into()))?;

        let api_base = self.api_base.trim_matches('/');
        let base_url = if api_base.is_empty() {
            server.trim_end_matches('/').to_string()
        } else {
            format!("{}/{}", server.trim_end_matches('/'), api_base)
        };

        let refresh_url = Url::parse(&format!("{}{}", base_url, REFRESH_PATH))
            .map_err(|e| ApiError::Configuration(format!("invalid server URL {:?}: {}", server, e)))?;
        if !matches!(refresh_url.scheme(), "http" | "https") {
            return Err(ApiError::Configuration(format!(
                "server URL must be http or https: {:?}",
                server
            )));
        }

        let mut http = reqwest::Client::builder()
            .user_agent(self.user_agent.unwrap_or_else(|| USER_AGENT.to_string()));
        if let Some(timeout) = self.request_timeout {
            http = http.timeout(timeout);
        }
        let http = http
            .build()
            .map_err(|e| ApiError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryTokenStore::new()));
        let refresher = Refresher::new(
            http.clone(),
            refresh_url,
            store,
            self.refresh_buffer,
            self.refresh_timeout,
        );

        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                refresher,
                queue: Mutex::new(RefreshQueue::default()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::test_token;
    use crate::auth::TokenPair;
    use serde_json::{json, Value};
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn client(server: &MockServer, store: Arc<MemoryTokenStore>) -> ApiClient {
        ApiClient::builder()
            .server(server.uri())
            .store(store)
            .build()
            .unwrap()
    }

    fn fresh_store() -> Arc<MemoryTokenStore> {
        Arc::new(MemoryTokenStore::with_tokens(&TokenPair::new(
            test_token("u", 3600),
            test_token("u", 7200),
        )))
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    #[test]
    fn test_builder_requires_server() {
        let result = ApiClient::builder().build();
        assert!(matches!(result, Err(ApiError::Configuration(_))));
    }

    #[test]
    fn test_builder_rejects_bad_server() {
        let result = ApiClient::builder().server("not a url").build();
        assert!(matches!(result, Err(ApiError::Configuration(_))));

        let result = ApiClient::builder().server("ftp://example.com").build();
        assert!(matches!(result, Err(ApiError::Configuration(_))));
    }

    #[test]
    fn test_builder_base_url() {
        let client = ApiClient::builder()
            .server("http://localhost:3000/")
            .build()
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000/api");
        assert_eq!(
            client.refresher().refresh_url().as_str(),
            "http://localhost:3000/api/auth/refresh"
        );

        let client = ApiClient::builder()
            .server("http://localhost:3000")
            .api_base("/v2/")
            .build()
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000/v2");

        let client = ApiClient::builder()
            .server("http://localhost:3000")
            .api_base("")
            .build()
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000");
    }

    #[test]
    fn test_request_path_normalized() {
        let request = ApiRequest::new(Method::GET, "students");
        assert_eq!(request.path, "/students");
        assert!(!request.is_retried());
        assert!(request.mark_retried().is_retried());
        assert!(ApiRequest::new(Method::POST, "/auth/login").is_auth_endpoint());
        assert!(ApiRequest::new(Method::POST, "auth/refresh").is_auth_endpoint());
        assert!(!ApiRequest::new(Method::GET, "/auth/me").is_auth_endpoint());
    }

    #[tokio::test]
    async fn test_refresh_cycle_releases_waiters_in_order() {
        let queue = Mutex::new(RefreshQueue {
            in_progress: true,
            waiters: Vec::new(),
        });
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let (tx, rx) = oneshot::channel();
                queue.lock().unwrap().waiters.push(tx);
                rx
            })
            .collect();

        let mut cycle = RefreshCycle {
            queue: &queue,
            settled: false,
        };
        cycle.settle(Some("fresh"));
        drop(cycle);

        for rx in receivers {
            assert_eq!(rx.await.unwrap().as_deref(), Some("fresh"));
        }
        let queue = queue.lock().unwrap();
        assert!(!queue.in_progress);
        assert!(queue.waiters.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_refresh_cycle_resets_queue() {
        let queue = Mutex::new(RefreshQueue {
            in_progress: true,
            waiters: Vec::new(),
        });
        let (tx, rx) = oneshot::channel();
        queue.lock().unwrap().waiters.push(tx);

        drop(RefreshCycle {
            queue: &queue,
            settled: false,
        });

        assert!(rx.await.is_err());
        let queue = queue.lock().unwrap();
        assert!(!queue.in_progress);
        assert!(queue.waiters.is_empty());
    }

    #[tokio::test]
    async fn test_get_attaches_bearer_token() {
        let server = MockServer::start().await;
        let store = fresh_store();
        let access = store.access_token().unwrap();

        Mock::given(method("GET"))
            .and(path("/api/students"))
            .and(header("authorization", bearer(&access).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
            .expect(1)
            .mount(&server)
            .await;

        let students: Value = client(&server, store).get("/students").await.unwrap();
        assert_eq!(students[0]["id"], 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_request_has_no_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/announcements"))
            .respond_with(|req: &Request| {
                if req.headers.contains_key("authorization") {
                    ResponseTemplate::new(400)
                } else {
                    ResponseTemplate::new(200).set_body_json(json!([]))
                }
            })
            .mount(&server)
            .await;

        let client = client(&server, Arc::new(MemoryTokenStore::new()));
        let result: Result<Value, _> = client.get("/announcements").await;
        assert_eq!(assert_ok!(result), json!([]));
    }

    #[tokio::test]
    async fn test_query_post_put_delete() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/grades"))
            .and(query_param("studentId", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "score": 91 }])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/terms"))
            .and(body_json(json!({ "name": "Fall" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 3 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/terms/3"))
            .and(body_json(json!({ "name": "Autumn" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 3 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/terms/3"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, fresh_store());
        let grades: Value = client
            .get_with_query("/grades", &[("studentId", "7")])
            .await
            .unwrap();
        assert_eq!(grades[0]["score"], 91);

        let created: Value = client.post("/terms", &json!({ "name": "Fall" })).await.unwrap();
        assert_eq!(created["id"], 3);

        let updated: Value = client.put("/terms/3", &json!({ "name": "Autumn" })).await.unwrap();
        assert_eq!(updated["id"], 3);

        let deleted: Value = client.delete("/terms/3").await.unwrap();
        assert_eq!(deleted, Value::Null);
    }

    #[tokio::test]
    async fn test_error_status_passes_through_without_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/invoices/99"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server, fresh_store());
        let err = client.get::<Value>("/invoices/99").await.unwrap_err();
        match err {
            ApiError::Status { status, body, .. } => {
                assert_eq!(status, 404);
                assert_eq!(body, "not found");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = client(&server, fresh_store());
        let err = client.get::<Value>("/fees").await.unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_network_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let client = ApiClient::builder()
            .server(format!("http://127.0.0.1:{}", port))
            .store(fresh_store())
            .build()
            .unwrap();
        let err = client.get::<Value>("/students").await.unwrap_err();
        assert!(matches!(err, ApiError::Network { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_unserializable_body_is_not_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let mut body = std::collections::BTreeMap::new();
        body.insert((2024, 1), "spring");
        let client = client(&server, fresh_store());
        let err = client.post::<_, Value>("/terms", &body).await.unwrap_err();
        match err {
            ApiError::RequestSetup { url, reason } => {
                assert_eq!(url, "/terms");
                assert!(reason.contains("serialize"), "{}", reason);
            }
            other => panic!("expected setup error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_401_refreshes_and_replays() {
        let server = MockServer::start().await;
        let store = fresh_store();
        let old_access = store.access_token().unwrap();
        let new_access = test_token("u", 1800);

        // Server revoked the old token before its exp.
        Mock::given(method("GET"))
            .and(path("/api/classes"))
            .and(header("authorization", bearer(&old_access).as_str()))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/classes"))
            .and(header("authorization", bearer(&new_access).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "c1" }])))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "accessToken": new_access })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, store.clone());
        let classes: Value = client.get("/classes").await.unwrap();
        assert_eq!(classes[0]["id"], "c1");
        assert_eq!(store.access_token(), Some(new_access));

        // Follow-up calls use the stored replacement directly.
        let _: Value = client.get("/classes").await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_rejected_again_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/students/5"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "accessToken": test_token("u", 1800) })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, fresh_store());
        let err = client
            .put::<_, Value>("/students/5", &json!({ "firstName": "Ada" }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_401s_share_one_refresh() {
        const CALLERS: usize = 6;

        let server = MockServer::start().await;
        let store = fresh_store();
        let old_access = store.access_token().unwrap();
        let new_access = test_token("u", 1800);

        Mock::given(method("GET"))
            .and(path("/api/teachers"))
            .and(header("authorization", bearer(&old_access).as_str()))
            .respond_with(ResponseTemplate::new(401))
            .expect(CALLERS as u64)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/teachers"))
            .and(header("authorization", bearer(&new_access).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["t1"])))
            .expect(CALLERS as u64)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "accessToken": new_access }))
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, store);
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.get::<Value>("/teachers").await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!(["t1"]));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_401s_fail_together() {
        const CALLERS: usize = 5;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/payments"))
            .respond_with(ResponseTemplate::new(401))
            .expect(CALLERS as u64)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
            .expect(1)
            .mount(&server)
            .await;

        let store = fresh_store();
        let client = client(&server, store.clone());
        let results = futures::future::join_all(
            (0..CALLERS).map(|_| client.get::<Value>("/payments")),
        )
        .await;

        for result in results {
            let err = result.unwrap_err();
            assert!(err.is_auth_rejected(), "got {:?}", err);
        }
        assert_eq!(store.tokens(), None);
        assert_eq!(client.refresher().get_valid_access_token().await, None);

        let queue = client.inner.queue.lock().unwrap();
        assert!(!queue.in_progress);
        assert!(queue.waiters.is_empty());
    }

    #[tokio::test]
    async fn test_401_with_failed_refresh_clears_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        // Access token rejected and refresh token already expired.
        let store = Arc::new(MemoryTokenStore::with_tokens(&TokenPair::new(
            test_token("u", 3600),
            test_token("u", -5),
        )));
        let client = client(&server, store.clone());

        let err = assert_err!(client.get::<Value>("/messages").await);
        assert_eq!(err.status(), Some(401));
        assert_eq!(store.tokens(), None);
    }

    #[tokio::test]
    async fn test_retried_request_does_not_refresh_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/attendance"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = fresh_store();
        let client = client(&server, store.clone());
        let request = ApiRequest::new(Method::GET, "/attendance").mark_retried();

        let err = assert_err!(client.send(request).await);
        assert_eq!(err.status(), Some(401));
        // A pass-through does not end the session.
        assert!(store.tokens().is_some());
    }

    #[tokio::test]
    async fn test_login_endpoint_skips_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = fresh_store();
        let client = client(&server, store.clone());
        let request = ApiRequest::new(Method::POST, LOGIN_PATH)
            .json(&json!({ "email": "a@b.c", "password": "nope" }))
            .unwrap();

        let err = assert_err!(client.send(request).await);
        assert_eq!(err.status(), Some(401));
        assert!(store.tokens().is_some());
    }
}
