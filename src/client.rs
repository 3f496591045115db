//! Calling side: transports and the clients built on them.
//!
//! - [`Transport`] delivers a [`Request`] and returns the raw [`CallResult`].
//!   [`RestTransport`] does this over HTTP with `reqwest`.
//! - [`Client`] resolves a method by name through the frozen registry,
//!   re-validates the arguments against the signature and builds the request.
//! - [`SessionClient`] adds the session id to every call.
//! - [`SyncClient`] blocks the calling thread with a bounded wait.
//! - [`TypedClient`] decodes payloads into Rust types.

use crate::codec::{self, CONTENT_TYPE, JSON_CONTENT};
use crate::config::ClientConfig;
use crate::contract::{MethodContract, TENANT_HEADER, Verb};
use crate::decorators::Registry;
use crate::error::{ClientError, ValidationError, FieldError};
use crate::message::{CallResult, Request};
use crate::metrics;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Status used for calls that never got a response from the server.
pub const TRANSPORT_FAILURE: u16 = 599;

/// Delivers requests. Implemented by [`RestTransport`] and by test doubles.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and wait at most `timeout` for the response.
    ///
    /// Timeouts are reported as [`ClientError::Timeout`]; other delivery
    /// failures come back as a result with code [`TRANSPORT_FAILURE`].
    async fn call(&self, request: Request, timeout: Option<Duration>) -> Result<CallResult, ClientError>;
}

// ── REST transport ──────────────────────────────────────────────────────────

pub struct RestTransport {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl RestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connection_timeout())
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url(),
            token: config.token.clone(),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn reqwest_method(verb: Verb) -> reqwest::Method {
    match verb {
        Verb::Get => reqwest::Method::GET,
        Verb::Post => reqwest::Method::POST,
        Verb::Put => reqwest::Method::PUT,
        Verb::Patch => reqwest::Method::PATCH,
        Verb::Delete => reqwest::Method::DELETE,
        Verb::Head => reqwest::Method::HEAD,
        Verb::Options => reqwest::Method::OPTIONS,
    }
}

fn transport_failure(err: &reqwest::Error) -> CallResult {
    CallResult::new(TRANSPORT_FAILURE, Some(json!({ "message": err.to_string() })))
}

#[async_trait]
impl Transport for RestTransport {
    async fn call(&self, request: Request, timeout: Option<Duration>) -> Result<CallResult, ClientError> {
        let timeout = timeout.unwrap_or(self.request_timeout);
        let url = format!("{}{}", self.base_url, request.url);
        let mut builder = self
            .http
            .request(reqwest_method(request.method), &url)
            .timeout(timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            let (zipped, bytes) =
                codec::gzipped_json(body).map_err(|e| ClientError::Transport(e.to_string()))?;
            builder = builder.header(CONTENT_TYPE, JSON_CONTENT).body(bytes);
            if zipped {
                builder = builder.header("Content-Encoding", "gzip");
            }
        }

        debug!(method = %request.method, url = %url, "Sending request");
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(ClientError::Timeout(timeout)),
            Err(e) => return Ok(transport_failure(&e)),
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) if e.is_timeout() => return Err(ClientError::Timeout(timeout)),
            Err(e) => return Ok(transport_failure(&e)),
        };
        let body = codec::decode_by_content_type(content_type.as_deref(), &bytes)?;
        Ok(CallResult::new(status, body))
    }
}

// ── Dynamic client ──────────────────────────────────────────────────────────

/// How a client picks among the api versions of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionMatch {
    #[default]
    Lowest,
    Highest,
    Exact(u32),
}

/// Turn a JSON object into keyword arguments.
pub fn kwargs(value: Value) -> Result<Map<String, Value>, ValidationError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ValidationError::new(
            "kwargs",
            vec![FieldError::new("__kwargs__", format!("expected an object, got {other}"))],
        )),
    }
}

/// Calls methods by name.
#[derive(Clone)]
pub struct Client {
    name: String,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    version_match: VersionMatch,
    timeout: Option<Duration>,
}

impl Client {
    pub fn new(name: &str, registry: Arc<Registry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.to_string(),
            registry,
            transport,
            version_match: VersionMatch::default(),
            timeout: None,
        }
    }

    /// Client talking REST to the server described by `config`.
    pub fn from_config(name: &str, registry: Arc<Registry>, config: &ClientConfig) -> Result<Self, ClientError> {
        let transport = RestTransport::new(config)?;
        Ok(Self::new(name, registry, Arc::new(transport)).with_timeout(config.request_timeout()))
    }

    pub fn with_version_match(mut self, version_match: VersionMatch) -> Self {
        self.version_match = version_match;
        self
    }

    /// Default timeout for contracts that do not set one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn timeout_for(&self, contract: &MethodContract) -> Option<Duration> {
        contract.timeout.or(self.timeout)
    }

    pub fn resolve(&self, method: &str) -> Result<Arc<MethodContract>, ClientError> {
        self.registry.resolve(method, self.version_match)
    }

    /// Call `method` with positional and keyword arguments.
    pub async fn call(&self, method: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<CallResult, ClientError> {
        let contract = self.resolve(method)?;
        self.call_contract(contract, args, kwargs).await
    }

    /// Call `method` with keyword arguments given as a JSON object.
    pub async fn call_kw(&self, method: &str, arguments: Value) -> Result<CallResult, ClientError> {
        self.call(method, Vec::new(), kwargs(arguments)?).await
    }

    #[instrument(
        skip(self, contract, args, kwargs),
        fields(client = %self.name, method = %contract.function_name, version = contract.api_version)
    )]
    pub async fn call_contract(
        &self,
        contract: Arc<MethodContract>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<CallResult, ClientError> {
        // argument errors surface here, before any round trip
        let bound = contract.signature.bind(args, kwargs)?;
        let request = contract.build_call(Vec::new(), bound)?;
        let environment = request.headers.get(TENANT_HEADER).cloned();

        let _timer = metrics::CallTimer::new(&contract.function_name);
        let result = self
            .transport
            .call(request, self.timeout_for(&contract))
            .await;
        metrics::record_call(
            &contract.function_name,
            result.as_ref().ok().map(|r| r.code),
        );

        let result = result?;
        debug!(code = result.code, "Call completed");
        Ok(result
            .with_contract(contract)
            .with_environment(environment))
    }
}

// ── Session client ──────────────────────────────────────────────────────────

/// Client bound to a session. Every call carries `sid` unless the caller set
/// it explicitly.
#[derive(Clone)]
pub struct SessionClient {
    client: Client,
    sid: Uuid,
}

impl SessionClient {
    pub fn new(client: Client, sid: Uuid) -> Self {
        Self { client, sid }
    }

    pub fn sid(&self) -> Uuid {
        self.sid
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub async fn call(&self, method: &str, args: Vec<Value>, mut kwargs: Map<String, Value>) -> Result<CallResult, ClientError> {
        let contract = self.client.resolve(method)?;
        let accepts_sid = contract.signature.get("sid").is_some() || contract.signature.varkw.is_some();
        let positional_sid = contract
            .signature
            .param_names()
            .position(|p| p == "sid")
            .is_some_and(|idx| idx < args.len());
        if accepts_sid && !positional_sid && !kwargs.contains_key("sid") {
            kwargs.insert("sid".into(), Value::String(self.sid.to_string()));
        }
        self.client.call_contract(contract, args, kwargs).await
    }

    pub async fn call_kw(&self, method: &str, arguments: Value) -> Result<CallResult, ClientError> {
        self.call(method, Vec::new(), kwargs(arguments)?).await
    }
}

// ── Synchronous client ──────────────────────────────────────────────────────

/// Blocking wrapper around [`Client`].
///
/// The call is driven to completion on a private runtime. From inside a
/// runtime (where blocking on it would panic) that happens on a scoped helper
/// thread. Running out of time drops the call and is reported as
/// [`ClientError::ConnectionRefused`].
pub struct SyncClient {
    client: Client,
    timeout: Duration,
    runtime: Option<tokio::runtime::Runtime>,
}

impl SyncClient {
    pub fn new(client: Client, timeout: Duration) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("orchestra-rpc-sync")
            .enable_all()
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            timeout,
            runtime: Some(runtime),
        })
    }

    pub fn call(&self, method: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<CallResult, ClientError> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| ClientError::Transport("client is shut down".into()))?;
        // the timer must be created inside the private runtime
        let run = move || {
            runtime.block_on(async move {
                tokio::time::timeout(self.timeout, self.client.call(method, args, kwargs)).await
            })
        };

        let outcome = if tokio::runtime::Handle::try_current().is_ok() {
            std::thread::scope(|scope| scope.spawn(run).join())
                .map_err(|_| ClientError::Transport("blocking call panicked".into()))?
        } else {
            run()
        };

        match outcome {
            Err(_) | Ok(Err(ClientError::Timeout(_))) => Err(ClientError::ConnectionRefused),
            Ok(other) => other,
        }
    }

    pub fn call_kw(&self, method: &str, arguments: Value) -> Result<CallResult, ClientError> {
        self.call(method, Vec::new(), kwargs(arguments)?)
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        // dropping a runtime from async context panics
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ── Typed client ────────────────────────────────────────────────────────────

/// Client for typed methods that decodes payloads into Rust types.
///
/// Non-200 responses are turned into [`ClientError::Http`] using the status
/// table.
#[derive(Clone)]
pub struct TypedClient {
    client: Client,
}

impl TypedClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<T, ClientError> {
        let contract = self.client.resolve(method)?;
        if !contract.typed {
            return Err(ClientError::NotTyped(method.to_string()));
        }
        let result = self.client.call_contract(contract, args, kwargs).await?;
        result.value()
    }

    pub async fn call_kw<T: DeserializeOwned>(&self, method: &str, arguments: Value) -> Result<T, ClientError> {
        self.call(method, Vec::new(), kwargs(arguments)?).await
    }

    /// Every item of a paged listing, following `links.next`.
    pub async fn all<T>(&self, method: &str, arguments: Value) -> Result<BoxStream<'static, Result<T, ClientError>>, ClientError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let result = self.client.call_kw(method, arguments).await?;
        Ok(result.all(self.client.transport()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MethodOptions;
    use crate::decorators::{RegistryBuilder, method, typedmethod};
    use crate::error::HttpErrorKind;
    use crate::typing::{Signature, TypeSpec};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records requests and answers with a fixed result.
    struct Recorder {
        requests: Mutex<Vec<Request>>,
        reply: CallResult,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn call(&self, request: Request, _timeout: Option<Duration>) -> Result<CallResult, ClientError> {
            self.requests.lock().unwrap().push(request);
            Ok(self.reply.clone())
        }
    }

    /// Never answers. Counts the calls that were dropped unfinished.
    #[derive(Default)]
    struct Hanging {
        abandoned: Arc<AtomicUsize>,
    }

    struct CountOnDrop(Arc<AtomicUsize>);

    impl Drop for CountOnDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for Hanging {
        async fn call(&self, _request: Request, timeout: Option<Duration>) -> Result<CallResult, ClientError> {
            let _guard = CountOnDrop(self.abandoned.clone());
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ClientError::Timeout(timeout.unwrap_or_default()))
        }
    }

    fn registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder
            .decorate(
                Signature::new("get_status").returns(TypeSpec::dict(TypeSpec::Str)),
                [typedmethod(MethodOptions::new("/serverstatus").operation(crate::contract::Verb::Get))],
            )
            .unwrap();
        builder
            .decorate(
                Signature::new("get_state")
                    .param("sid", TypeSpec::Uuid)
                    .param_default("limit", TypeSpec::Int, json!(10)),
                [method(MethodOptions::new("/state").operation(crate::contract::Verb::Get))],
            )
            .unwrap();
        builder.freeze()
    }

    fn recorder(reply: CallResult) -> Arc<Recorder> {
        Arc::new(Recorder {
            requests: Mutex::new(Vec::new()),
            reply,
        })
    }

    #[tokio::test]
    async fn test_signature_errors_before_round_trip() {
        let transport = recorder(CallResult::new(200, None));
        let client = Client::new("api", registry(), transport.clone());
        let err = client
            .call("get_status", vec![json!(1)], Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let client = Client::new("api", registry(), recorder(CallResult::new(200, None)));
        assert!(matches!(
            client.call("nope", vec![], Map::new()).await,
            Err(ClientError::UnknownMethod(_))
        ));
    }

    #[tokio::test]
    async fn test_session_client_adds_sid() {
        let transport = recorder(CallResult::new(200, Some(json!({}))));
        let sid = Uuid::new_v4();
        let client = SessionClient::new(Client::new("agent", registry(), transport.clone()), sid);
        client.call_kw("get_state", json!({"limit": 5})).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert!(requests[0].url.contains(&format!("sid={sid}")));
        assert!(requests[0].url.contains("limit=5"));
    }

    #[tokio::test]
    async fn test_typed_client_maps_status() {
        let transport = recorder(CallResult::new(404, Some(json!({"message": "gone"}))));
        let client = TypedClient::new(Client::new("api", registry(), transport));
        let err = client
            .call_kw::<Value>("get_status", Value::Null)
            .await
            .unwrap_err();
        match err {
            ClientError::Http(e) => {
                assert_eq!(e.kind, HttpErrorKind::NotFound);
                assert_eq!(e.message, "gone");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_typed_client_rejects_untyped_method() {
        let client = TypedClient::new(Client::new("api", registry(), recorder(CallResult::new(200, None))));
        assert!(matches!(
            client.call_kw::<Value>("get_state", json!({"sid": Uuid::new_v4().to_string()})).await,
            Err(ClientError::NotTyped(_))
        ));
    }

    #[test]
    fn test_sync_client_without_runtime() {
        let transport = recorder(CallResult::new(200, Some(json!({"data": {"state": "up"}}))));
        let client = SyncClient::new(Client::new("api", registry(), transport), Duration::from_secs(5)).unwrap();
        let result = client.call_kw("get_status", Value::Null).unwrap();
        assert_eq!(result.value::<Value>().unwrap(), json!({"state": "up"}));
    }

    #[test]
    fn test_sync_client_timeout_is_connection_refused() {
        let hanging = Arc::new(Hanging::default());
        let client = SyncClient::new(
            Client::new("api", registry(), hanging.clone()),
            Duration::from_millis(50),
        )
        .unwrap();
        assert!(matches!(
            client.call_kw("get_status", Value::Null),
            Err(ClientError::ConnectionRefused)
        ));
        assert_eq!(hanging.abandoned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_client_timeout_inside_runtime_drops_the_call() {
        let hanging = Arc::new(Hanging::default());
        let client = SyncClient::new(
            Client::new("api", registry(), hanging.clone()),
            Duration::from_millis(50),
        )
        .unwrap();
        let outcome = tokio::task::block_in_place(|| client.call_kw("get_status", Value::Null));
        assert!(matches!(outcome, Err(ClientError::ConnectionRefused)));
        assert_eq!(hanging.abandoned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_client_inside_runtime() {
        let transport = recorder(CallResult::new(200, Some(json!({"data": {}}))));
        let client = SyncClient::new(Client::new("api", registry(), transport), Duration::from_secs(5)).unwrap();
        let result = tokio::task::block_in_place(|| client.call_kw("get_status", Value::Null)).unwrap();
        assert_eq!(result.code, 200);
    }

    #[test]
    fn test_kwargs_requires_object() {
        assert!(kwargs(json!([1])).is_err());
        assert!(kwargs(Value::Null).unwrap().is_empty());
    }
}
