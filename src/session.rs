//! Session reverse channel.
//!
//! An agent has no listening port. Instead a [`SessionEndpoint`] keeps a
//! heartbeat long poll open against the server; calls the server queued for
//! the session come back in the heartbeat response, are dispatched locally
//! through the regular [`CallTarget`] pipeline and answered with a
//! `heartbeat_reply` call carrying the original `reply_id`.
//!
//! Heartbeats and everything else use separate transports so a slow
//! foreground call never delays a heartbeat.

use crate::client::{Client, RestTransport, SessionClient, Transport};
use crate::config::{RpcConfig, SessionConfig};
use crate::error::{ClientError, HttpError};
use crate::message::{Request, Response};
use crate::methods::{HEARTBEAT, HEARTBEAT_REPLY, METHOD_CALLS};
use crate::metrics;
use crate::server::CallTarget;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Liveness of the session as seen by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle callbacks of a session endpoint.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// After the transports exist, before the first heartbeat.
    async fn start_connected(&self) {}

    /// First successful heartbeat after start or after a disconnect.
    async fn on_reconnect(&self) {}

    /// The connection was lost (not called on shutdown).
    async fn on_disconnect(&self) {}
}

/// Hooks that do nothing.
pub struct NoHooks;

impl SessionHooks for NoHooks {}

/// The two transports of a session.
#[derive(Clone)]
pub struct SessionTransports {
    /// Used for heartbeats only.
    pub heartbeat: Arc<dyn Transport>,
    /// Used for replies and foreground calls.
    pub calls: Arc<dyn Transport>,
}

impl SessionTransports {
    /// Two independent REST transports for the configured server.
    pub fn rest(config: &RpcConfig) -> Result<Self, ClientError> {
        Ok(Self {
            heartbeat: Arc::new(RestTransport::new(&config.client)?),
            calls: Arc::new(RestTransport::new(&config.client)?),
        })
    }
}

/// State shared between the endpoint and its background tasks.
struct Shared {
    name: String,
    sid: Uuid,
    environment: Uuid,
    config: SessionConfig,
    target: Arc<CallTarget>,
    hooks: Arc<dyn SessionHooks>,
    endpoint_names: Arc<RwLock<BTreeSet<String>>>,
    state: Arc<watch::Sender<SessionState>>,
    heartbeat_client: SessionClient,
    client: SessionClient,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

pub struct SessionEndpoint {
    name: String,
    environment: Uuid,
    config: SessionConfig,
    target: Arc<CallTarget>,
    transports: SessionTransports,
    hooks: Arc<dyn SessionHooks>,
    endpoint_names: Arc<RwLock<BTreeSet<String>>>,
    state: Arc<watch::Sender<SessionState>>,
    running: Option<Arc<Shared>>,
}

impl SessionEndpoint {
    /// `target` holds the handlers that answer reverse-channel calls; its
    /// registry must contain the session methods.
    pub fn new(
        name: &str,
        environment: Uuid,
        target: Arc<CallTarget>,
        transports: SessionTransports,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            name: name.to_string(),
            environment,
            config,
            target,
            transports,
            hooks: Arc::new(NoHooks),
            endpoint_names: Arc::new(RwLock::new(BTreeSet::new())),
            state: Arc::new(state),
            running: None,
        }
    }

    /// Endpoint talking REST to the configured server.
    pub fn from_config(
        name: &str,
        environment: Uuid,
        target: Arc<CallTarget>,
        config: &RpcConfig,
    ) -> Result<Self, ClientError> {
        Ok(Self::new(
            name,
            environment,
            target,
            SessionTransports::rest(config)?,
            config.session.clone(),
        ))
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> Uuid {
        self.environment
    }

    /// The session id, once started.
    pub fn sid(&self) -> Option<Uuid> {
        self.running.as_ref().map(|s| s.sid)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Client for foreground calls in this session. Uses the non-heartbeat
    /// transport.
    pub fn client(&self) -> Option<&SessionClient> {
        self.running.as_ref().map(|s| &s.client)
    }

    /// Answer for `name` too. Takes effect on the next heartbeat.
    pub async fn add_endpoint_name(&self, name: &str) {
        self.endpoint_names.write().await.insert(name.to_string());
    }

    pub async fn remove_endpoint_name(&self, name: &str) {
        self.endpoint_names.write().await.remove(name);
    }

    pub async fn endpoint_names(&self) -> Vec<String> {
        self.endpoint_names.read().await.iter().cloned().collect()
    }

    /// Generate the session id, run the `start_connected` hook and start the
    /// heartbeat loop.
    pub async fn start(&mut self) -> Result<Uuid, ClientError> {
        if let Some(running) = &self.running {
            return Ok(running.sid);
        }

        let sid = Uuid::new_v4();
        let registry = self.target.registry().clone();
        let heartbeat_client = SessionClient::new(
            Client::new(&self.name, registry.clone(), self.transports.heartbeat.clone())
                .with_timeout(self.config.server_timeout()),
            sid,
        );
        let client = SessionClient::new(
            Client::new(&self.name, registry, self.transports.calls.clone()),
            sid,
        );

        let shared = Arc::new(Shared {
            name: self.name.clone(),
            sid,
            environment: self.environment,
            config: self.config.clone(),
            target: self.target.clone(),
            hooks: self.hooks.clone(),
            endpoint_names: self.endpoint_names.clone(),
            state: self.state.clone(),
            heartbeat_client,
            client,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        info!(endpoint = %self.name, %sid, "Starting session endpoint");
        shared.set_state(SessionState::Connecting);
        shared.hooks.start_connected().await;

        let runner = shared.clone();
        shared.tracker.spawn(async move { runner.heartbeat_loop().await });
        self.running = Some(shared);
        Ok(sid)
    }

    /// Cancel the heartbeat and every in-flight dispatch and wait for them.
    pub async fn stop(&mut self) {
        let Some(shared) = self.running.take() else {
            return;
        };
        shared.cancel.cancel();
        shared.tracker.close();
        shared.tracker.wait().await;
        shared.set_state(SessionState::Disconnected);
        info!(endpoint = %self.name, sid = %shared.sid, "Session endpoint stopped");
    }
}

impl Drop for SessionEndpoint {
    fn drop(&mut self) {
        if let Some(shared) = &self.running {
            shared.cancel.cancel();
        }
    }
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(endpoint = %self.name, from = %previous, to = %state, "Session state changed");
            if state == SessionState::Connected {
                metrics::record_session_connected(true);
            } else if previous == SessionState::Connected {
                metrics::record_session_connected(false);
            }
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Run a user hook, abandoning it on cancellation.
    async fn run_hook(&self, hook: impl Future<Output = ()>) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = hook => {}
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut connected = false;
        loop {
            if !connected {
                self.set_state(SessionState::Connecting);
            }
            let endpoint_names: Vec<String> = self.endpoint_names.read().await.iter().cloned().collect();
            let arguments = json!({
                "tid": self.environment.to_string(),
                "endpoint_names": endpoint_names,
                "nodename": self.config.node_name,
                "no_hang": !connected,
            });

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.heartbeat_client.call_kw(HEARTBEAT, arguments) => outcome,
            };

            match outcome {
                Ok(result) if result.is_ok() => {
                    metrics::record_heartbeat(true);
                    if !connected {
                        connected = true;
                        self.set_state(SessionState::Connected);
                        let shared = self.clone();
                        self.tracker
                            .spawn(async move { shared.run_hook(shared.hooks.on_reconnect()).await });
                    }

                    let calls = result
                        .result
                        .as_ref()
                        .and_then(|body| body.get(METHOD_CALLS))
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    for call in calls {
                        self.spawn_dispatch(call);
                    }

                    if !self.pause(self.config.heartbeat_min_delay()).await {
                        break;
                    }
                }
                outcome => {
                    metrics::record_heartbeat(false);
                    match &outcome {
                        Ok(result) => warn!(
                            endpoint = %self.name,
                            code = result.code,
                            body = ?result.result,
                            delay = ?self.config.reconnect_delay(),
                            "Heartbeat failed"
                        ),
                        Err(e) => warn!(
                            endpoint = %self.name,
                            error = %e,
                            delay = ?self.config.reconnect_delay(),
                            "Heartbeat failed"
                        ),
                    }
                    self.set_state(SessionState::Disconnected);
                    if connected {
                        connected = false;
                        self.run_hook(self.hooks.on_disconnect()).await;
                    }
                    if !self.pause(self.config.reconnect_delay()).await {
                        break;
                    }
                }
            }
        }
        debug!(endpoint = %self.name, "Heartbeat loop stopped");
    }

    fn spawn_dispatch(self: &Arc<Self>, raw: Value) {
        let shared = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = shared.cancel.cancelled() => {}
                _ = shared.dispatch(raw) => {}
            }
        });
    }

    /// Run one queued call and reply. A reply is sent whatever happens,
    /// unless the call carries no `reply_id` to correlate it with.
    #[instrument(skip(self, raw), fields(endpoint = %self.name))]
    async fn dispatch(&self, raw: Value) {
        let reply_id = raw
            .get("reply_id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok());

        let response = match Request::from_value(raw) {
            Ok(request) => {
                debug!(
                    reply_id = ?request.reply_id,
                    method = %request.method,
                    url = %request.url,
                    "Received call through heartbeat"
                );
                let outcome = AssertUnwindSafe(self.target.execute_call(&request))
                    .catch_unwind()
                    .await;
                outcome.unwrap_or_else(|_| {
                    Response::from_error(&HttpError::server_error("dispatching the call panicked"))
                })
            }
            Err(e) => Response::from_error(&HttpError::bad_request(format!(
                "malformed queued call: {e}"
            ))),
        };

        let result = match response.status_code {
            200..=299 => "success",
            404 => "unmatched",
            _ => "error",
        };
        metrics::record_dispatch(result);
        if response.status_code >= 500 || response.status_code == 404 {
            let reason = response
                .body
                .as_ref()
                .and_then(|b| b.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            error!(
                reply_id = ?reply_id,
                code = response.status_code,
                reason,
                "An error occurred during heartbeat method call"
            );
        }

        let Some(reply_id) = reply_id else {
            warn!("Queued call has no reply_id, not replying");
            return;
        };
        let data = json!({ "result": response.body, "code": response.status_code });
        let reply = self
            .client
            .call_kw(
                HEARTBEAT_REPLY,
                json!({ "reply_id": reply_id.to_string(), "data": data }),
            )
            .await;
        if let Err(e) = reply {
            warn!(%reply_id, error = %e, "Failed to deliver heartbeat reply");
        }
    }
}
