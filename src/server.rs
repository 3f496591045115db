//! Receiving side: binds handlers to contracts and runs the
//! validate → handle → respond pipeline.
//!
//! The same pipeline serves direct inbound calls and calls delivered over the
//! session reverse channel.

use crate::codec::shorten;
use crate::contract::{ArgOption, CallMetadata, MethodContract, Verb, stringify};
use crate::decorators::{Handle, Registry};
use crate::error::{DefinitionError, HandlerError, HttpError};
use crate::message::{Request, Response, ReturnValue};
use crate::metrics;
use crate::typing::{TypeSpec, coerce};
use async_trait::async_trait;
use futures_util::FutureExt;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Business logic bound to a method.
///
/// Receives the validated arguments by (handler) name. Plain methods return
/// a status and optional body through [`ReturnValue::new`]; typed methods
/// return their payload in [`ReturnValue::response`].
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, args: Map<String, Value>) -> Result<ReturnValue, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ReturnValue, HandlerError>> + Send,
{
    async fn call(&self, args: Map<String, Value>) -> Result<ReturnValue, HandlerError> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ReturnValue, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Decides whether a session id presented by a caller is alive.
pub trait SessionValidator: Send + Sync {
    fn validate_sid(&self, sid: Uuid) -> bool;
}

// ── Routing ─────────────────────────────────────────────────────────────────

/// A handler bound to one contract.
#[derive(Clone)]
pub struct UrlMethod {
    pub contract: Arc<MethodContract>,
    pub handler: Arc<dyn Handler>,
    /// Method argument name to handler argument name.
    pub mapping: BTreeMap<String, String>,
    matcher: Regex,
}

impl UrlMethod {
    pub fn method_name(&self) -> &str {
        &self.contract.function_name
    }

    /// Path parameter values if `path` (no query) is routed here.
    fn match_path(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.matcher.captures(path)?;
        let mut values = BTreeMap::new();
        for var in self.contract.url_path.vars() {
            let raw = caps.name(var)?.as_str();
            values.insert(var.clone(), urlencoding::decode(raw).ok()?.into_owned());
        }
        Some(values)
    }
}

/// Set of handlers served by one endpoint.
pub struct CallTarget {
    name: String,
    registry: Arc<Registry>,
    /// (listen url, verb) → bound method
    ops: BTreeMap<(String, Verb), UrlMethod>,
    session_validator: Option<Arc<dyn SessionValidator>>,
}

impl CallTarget {
    pub fn new(name: &str, registry: Arc<Registry>) -> Self {
        Self {
            name: name.to_string(),
            registry,
            ops: BTreeMap::new(),
            session_validator: None,
        }
    }

    pub fn with_session_validator(mut self, validator: Arc<dyn SessionValidator>) -> Self {
        self.session_validator = Some(validator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Bind `handler` to the method named by `binding`.
    pub fn add_handler(&mut self, binding: Handle, handler: Arc<dyn Handler>) -> Result<(), DefinitionError> {
        let contracts: Vec<Arc<MethodContract>> = self
            .registry
            .contracts(&binding.method)
            .iter()
            .filter(|c| binding.api_version.is_none_or(|v| c.api_version == v))
            .cloned()
            .collect();
        if contracts.is_empty() {
            return Err(DefinitionError::UnknownMethod(binding.method));
        }

        for arg in binding.mapping.keys() {
            if contracts[0].signature.get(arg).is_none() {
                return Err(DefinitionError::invalid(
                    &binding.method,
                    format!("handler mapping refers to unknown argument {arg}"),
                ));
            }
        }

        for contract in &contracts {
            let key = (contract.get_listen_url(), contract.operation);
            if self.ops.contains_key(&key) {
                return Err(DefinitionError::DuplicateHandler {
                    verb: contract.operation.to_string(),
                    url: contract.get_full_path(),
                });
            }
        }

        for contract in contracts {
            let listen = contract.get_listen_url();
            let matcher = Regex::new(&format!("^{listen}$"))
                .map_err(|e| DefinitionError::invalid(&binding.method, e.to_string()))?;
            debug!(
                target_name = %self.name,
                method = %binding.method,
                verb = %contract.operation,
                url = %listen,
                "Bound handler"
            );
            self.ops.insert(
                (listen, contract.operation),
                UrlMethod {
                    contract,
                    handler: handler.clone(),
                    mapping: binding.mapping.clone(),
                    matcher,
                },
            );
        }
        Ok(())
    }

    /// Every bound method, keyed by listen url and verb.
    pub fn op_mapping(&self) -> &BTreeMap<(String, Verb), UrlMethod> {
        &self.ops
    }

    /// Find the method for `url` (query string ignored) and `verb`.
    pub fn match_call(&self, url: &str, verb: Verb) -> Option<(&UrlMethod, BTreeMap<String, String>)> {
        let path = url.split('?').next().unwrap_or(url);
        self.ops
            .iter()
            .filter(|((_, op), _)| *op == verb)
            .find_map(|(_, method)| method.match_path(path).map(|values| (method, values)))
    }

    /// Run one request through the pipeline. Never fails: every error
    /// becomes an error-shaped response.
    #[instrument(skip(self, request), fields(target_name = %self.name, method = %request.method, url = %request.url))]
    pub async fn execute_call(&self, request: &Request) -> Response {
        let Some((method, path_values)) = self.match_call(&request.url, request.method) else {
            debug!("No handler matches the request");
            return Response::from_error(&HttpError::not_found("No such method"));
        };

        let response = match self.run(method, request, path_values).await {
            Ok(response) => response,
            Err(err) => {
                debug!(status = err.status(), error = %err, "Call failed");
                Response::from_error(&err)
            }
        };
        metrics::record_inbound(method.method_name(), response.status_code);
        response
    }

    async fn run(
        &self,
        method: &UrlMethod,
        request: &Request,
        path_values: BTreeMap<String, String>,
    ) -> Result<Response, HttpError> {
        let contract = &method.contract;
        let mut message = parse_query(&request.url);
        match &request.body {
            Some(Value::Object(body)) => message.extend(body.clone()),
            Some(Value::Null) | None => {}
            Some(_) => return Err(HttpError::bad_request("the request body must be a JSON object")),
        }
        message.extend(path_values.into_iter().map(|(k, v)| (k, Value::String(v))));

        if contract.validate_sid {
            self.check_sid(&message)?;
        }

        let processed = CallArguments::new(contract, message, &request.headers)
            .process()
            .await?;

        let mut call_args = processed.args;
        for (method_arg, handler_arg) in &method.mapping {
            if let Some(value) = call_args.remove(method_arg) {
                call_args.insert(handler_arg.clone(), value);
            }
        }

        debug!(
            "Calling {}({})",
            contract.function_name,
            call_args
                .iter()
                .map(|(k, v)| format!("{}='{}'", k, shorten(&stringify(v), 10)))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let outcome = AssertUnwindSafe(method.handler.call(call_args))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                if let HandlerError::Other(cause) = &err {
                    error!(method = %contract.function_name, error = %cause, "Handler failed");
                }
                return Err(err.into_http());
            }
            Err(_) => {
                error!(method = %contract.function_name, "Handler panicked");
                return Err(HttpError::generic(crate::error::HttpErrorKind::ServerError));
            }
        };

        let mut response = process_return(contract, result)?;
        for (name, value) in processed.reply_headers {
            response.headers.entry(name).or_insert(value);
        }
        Ok(response)
    }

    fn check_sid(&self, message: &Map<String, Value>) -> Result<(), HttpError> {
        let raw = message.get("sid").and_then(Value::as_str).ok_or_else(|| {
            HttpError::bad_request("this is an agent to server call, it should contain an agent session id")
        })?;
        let valid = Uuid::parse_str(raw).ok().is_some_and(|sid| {
            self.session_validator
                .as_ref()
                .is_some_and(|v| v.validate_sid(sid))
        });
        if valid {
            Ok(())
        } else {
            Err(HttpError::bad_request(format!("the sid {raw} is not valid.")))
        }
    }
}

/// Query string as a message. Repeated keys become lists.
fn parse_query(url: &str) -> Map<String, Value> {
    let mut message = Map::new();
    let Some((_, query)) = url.split_once('?') else {
        return message;
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = Value::String(value.into_owned());
        match message.get_mut(key.as_ref()) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                message.insert(key.into_owned(), value);
            }
        }
    }
    message
}

// ── Argument processing ─────────────────────────────────────────────────────

/// Arguments after header mapping, validation and getters.
#[derive(Debug, Default)]
pub struct ProcessedCall {
    pub args: Map<String, Value>,
    /// Headers to echo back in the response.
    pub reply_headers: BTreeMap<String, String>,
    pub metadata: CallMetadata,
}

/// Turns a received message into handler arguments.
pub struct CallArguments<'a> {
    contract: &'a MethodContract,
    message: Map<String, Value>,
    request_headers: &'a BTreeMap<String, String>,
}

impl<'a> CallArguments<'a> {
    pub fn new(
        contract: &'a MethodContract,
        message: Map<String, Value>,
        request_headers: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            contract,
            message,
            request_headers,
        }
    }

    fn header_value(&self, option: &ArgOption) -> Option<&str> {
        let name = option.header.as_deref()?;
        self.request_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub async fn process(mut self) -> Result<ProcessedCall, HttpError> {
        let contract = self.contract;
        let is_get = contract.operation == Verb::Get;
        let mut remaining: Vec<String> = self.message.keys().cloned().collect();

        let mut out = ProcessedCall::default();
        let mut args = Map::new();

        for param in &contract.signature.params {
            let name = param.name.as_str();
            let option = contract.arg_options.get(name);
            let header = option.and_then(|o| self.header_value(o).map(str::to_string));

            if let (Some(value), Some(header)) = (self.message.get(name), header.as_ref()) {
                if stringify(value) != *header {
                    return Err(HttpError::bad_request(format!(
                        "Value for argument {name} was provided via a header and a non-header argument, \
                         but both values don't match (header={header}; non-header={})",
                        stringify(value)
                    )));
                }
            }

            if let Some(value) = self.message.remove(name) {
                take(&mut remaining, name);
                let value = if is_get { ensure_list(&param.ty, value) } else { value };
                args.insert(name.to_string(), value);
            } else if is_get && matches!(param.ty.unwrap_optional(), TypeSpec::Dict(_)) {
                let prefix = format!("{name}.");
                let keys: Vec<String> = self
                    .message
                    .keys()
                    .filter(|k| k.starts_with(&prefix) && k.len() > prefix.len())
                    .cloned()
                    .collect();
                if !keys.is_empty() {
                    let list_values = matches!(
                        param.ty.unwrap_optional(),
                        TypeSpec::Dict(inner) if matches!(inner.unwrap_optional(), TypeSpec::List(_))
                    );
                    let mut dict = Map::new();
                    for key in keys {
                        take(&mut remaining, &key);
                        if let Some(value) = self.message.remove(&key) {
                            let value = match value {
                                Value::Array(_) => value,
                                other if list_values => Value::Array(vec![other]),
                                other => other,
                            };
                            dict.insert(key[prefix.len()..].to_string(), value);
                        }
                    }
                    args.insert(name.to_string(), Value::Object(dict));
                }
            } else if let Some(header) = header {
                args.insert(name.to_string(), Value::String(header));
            }

            if let (Some(option), Some(header_name)) = (option, option.and_then(|o| o.header.as_ref())) {
                if option.reply_header {
                    if let Some(value) = self.header_value(option) {
                        out.reply_headers.insert(header_name.clone(), value.to_string());
                    }
                }
            }
        }

        let mut validated = contract.validate_arguments(&args)?;

        for (name, value) in validated.iter_mut() {
            if let Some(getter) = contract.arg_options.get(name).and_then(|o| o.getter.as_ref()) {
                let resolved = getter.resolve(value.take(), &mut out.metadata).await.map_err(|e| {
                    warn!(argument = %name, error = %e, "Argument getter failed");
                    e
                })?;
                *value = resolved;
            }
        }

        if contract.agent_server {
            take(&mut remaining, "sid");
        }
        if !remaining.is_empty() {
            if contract.varkw {
                for key in &remaining {
                    if let Some(value) = self.message.remove(key) {
                        validated.insert(key.clone(), value);
                    }
                }
            } else {
                return Err(HttpError::bad_request(format!(
                    "request contains fields {} that are not declared in method and no kwargs argument is provided.",
                    remaining.join(", ")
                )));
            }
        }

        out.args = validated;
        Ok(out)
    }
}

fn take(remaining: &mut Vec<String>, key: &str) {
    remaining.retain(|k| k != key);
}

/// A single value for a list parameter arrives unwrapped in a query string.
fn ensure_list(ty: &TypeSpec, value: Value) -> Value {
    match (ty.unwrap_optional(), value) {
        (TypeSpec::List(_), Value::Null) => Value::Null,
        (TypeSpec::List(_), value @ Value::Array(_)) => value,
        (TypeSpec::List(_), value) => Value::Array(vec![value]),
        (_, value) => value,
    }
}

// ── Return processing ───────────────────────────────────────────────────────

/// Convert a handler result into the response for `contract`.
pub fn process_return(contract: &MethodContract, mut result: ReturnValue) -> Result<Response, HttpError> {
    if !contract.typed {
        if result.response.is_some() && !contract.reply {
            warn!(method = %contract.function_name, "Method returned a result although it has no reply");
            result.response = None;
        }
        if result.response.is_none() {
            return Ok(Response::create(result, false, &contract.envelope_key));
        }
        return Ok(Response::create(result, contract.envelope, &contract.envelope_key));
    }

    match &contract.return_type {
        None | Some(TypeSpec::None) => {
            if result.response.as_ref().is_some_and(|v| !v.is_null()) {
                return Err(HttpError::server_error(format!(
                    "Method {} returned a result but is defined as -> None",
                    contract.function_name
                )));
            }
            result.response = None;
            Ok(Response::create(result, false, &contract.envelope_key))
        }
        Some(return_type) => {
            if result.status == 200 {
                let value = result.response.take().unwrap_or(Value::Null);
                let mut errors = Vec::new();
                match coerce(return_type, &value, "", &mut errors) {
                    Some(adapted) if errors.is_empty() => result.response = Some(adapted),
                    _ => {
                        let details: Vec<String> =
                            errors.iter().map(|e| format!("{}: {}", e.loc, e.msg)).collect();
                        return Err(HttpError::server_error(format!(
                            "Method {} returned an invalid result for {}: {}",
                            contract.function_name,
                            return_type,
                            details.join(", ")
                        )));
                    }
                }
            }
            Ok(Response::create(result, true, &contract.envelope_key))
        }
    }
}
