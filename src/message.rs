//! Wire-level value objects: [`Request`], [`Response`], [`ReturnValue`] and
//! the client-side [`CallResult`].

use crate::client::Transport;
use crate::contract::{MethodContract, TENANT_HEADER, Verb};
use crate::error::{ClientError, HttpError, ValidationError};
use crate::typing::coerce;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// One call on the wire.
///
/// `reply_id` is only set for calls delivered over the reverse channel; it is
/// the correlation id the reply must carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    pub method: Verb,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<Uuid>,
}

impl Request {
    pub fn new(url: String, method: Verb, headers: BTreeMap<String, String>, body: Option<Value>) -> Self {
        Self {
            url,
            method,
            headers,
            body,
            reply_id: None,
        }
    }

    pub fn with_reply_id(mut self, reply_id: Uuid) -> Self {
        self.reply_id = Some(reply_id);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// What a typed handler returns: a payload plus response decorations.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValue {
    pub status: u16,
    pub response: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub warnings: Vec<String>,
    pub links: BTreeMap<String, String>,
}

impl Default for ReturnValue {
    fn default() -> Self {
        Self {
            status: 200,
            response: None,
            headers: BTreeMap::new(),
            warnings: Vec::new(),
            links: BTreeMap::new(),
        }
    }
}

impl ReturnValue {
    pub fn new(status: u16, response: Option<Value>) -> Self {
        Self {
            status,
            response,
            ..Default::default()
        }
    }

    pub fn ok(response: Value) -> Self {
        Self::new(200, Some(response))
    }

    /// A 200 with no payload.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_serializable<T: Serialize>(status: u16, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(status, Some(serde_json::to_value(value)?)))
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_link(mut self, rel: &str, url: &str) -> Self {
        self.links.insert(rel.to_string(), url.to_string());
        self
    }

    /// The wire body. With an envelope the payload is nested under `key`
    /// next to `metadata.warnings` and `links`.
    pub fn to_body(&self, envelope: bool, key: &str) -> Option<Value> {
        if !envelope {
            return match &self.response {
                Some(value) if !self.warnings.is_empty() => {
                    Some(attach_warnings(200, value.clone(), &self.warnings).1)
                }
                other => other.clone(),
            };
        }

        let mut body = Map::new();
        body.insert(key.to_string(), self.response.clone().unwrap_or(Value::Null));
        if !self.links.is_empty() {
            body.insert("links".into(), json!(self.links));
        }
        let (_, body) = attach_warnings(self.status, Value::Object(body), &self.warnings);
        Some(body)
    }
}

/// Merge `warnings` into `value["metadata"]["warnings"]`.
pub fn attach_warnings(code: u16, mut value: Value, warnings: &[String]) -> (u16, Value) {
    if warnings.is_empty() {
        return (code, value);
    }
    if let Value::Object(obj) = &mut value {
        let meta = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = meta {
            let warns = meta
                .entry("warnings")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(warns) = warns {
                warns.extend(warnings.iter().cloned().map(Value::String));
            }
        }
    }
    (code, value)
}

/// A response as produced by the server pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl Response {
    pub fn new(status_code: u16, headers: BTreeMap<String, String>, body: Option<Value>) -> Self {
        Self {
            status_code,
            headers,
            body,
        }
    }

    pub fn create(result: ReturnValue, envelope: bool, envelope_key: &str) -> Self {
        let body = result.to_body(envelope, envelope_key);
        Self::new(result.status, result.headers, body)
    }

    pub fn from_error(err: &HttpError) -> Self {
        Self::new(err.status(), BTreeMap::new(), Some(err.to_body()))
    }
}

/// Outcome of a call as seen by the caller.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub code: u16,
    pub result: Option<Value>,
    /// The contract the call was made against, if known.
    pub contract: Option<Arc<MethodContract>>,
    /// Tenant the call was made for; reused when following pagination links.
    pub environment: Option<String>,
}

impl CallResult {
    pub fn new(code: u16, result: Option<Value>) -> Self {
        Self {
            code,
            result,
            contract: None,
            environment: None,
        }
    }

    pub fn with_contract(mut self, contract: Arc<MethodContract>) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn with_environment(mut self, environment: Option<String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == 200
    }

    /// Warnings the server attached to the response.
    pub fn warnings(&self) -> Vec<String> {
        self.result
            .as_ref()
            .and_then(|r| r.pointer("/metadata/warnings"))
            .and_then(Value::as_array)
            .map(|w| w.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    /// `links.next`, if present.
    pub fn next_link(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(|r| r.pointer("/links/next"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// The error a non-200 result stands for.
    pub fn error(&self) -> Option<HttpError> {
        (!self.is_ok()).then(|| HttpError::from_status(self.code, self.result.as_ref()))
    }

    /// The payload, unwrapped from the envelope and adapted to the declared
    /// return type.
    pub fn payload(&self) -> Result<Value, ClientError> {
        let contract = self
            .contract
            .as_ref()
            .ok_or_else(|| ClientError::InvalidResponse("result is not bound to a method".into()))?;
        if let Some(err) = self.error() {
            return Err(err.into());
        }

        let payload = if contract.envelope {
            self.result
                .as_ref()
                .and_then(|body| body.get(&contract.envelope_key))
                .cloned()
                .ok_or_else(|| {
                    ClientError::InvalidResponse(format!(
                        "response does not contain the envelope key {}",
                        contract.envelope_key
                    ))
                })?
        } else {
            self.result.clone().unwrap_or(Value::Null)
        };

        let Some(return_type) = &contract.return_type else {
            return Ok(payload);
        };
        if !contract.typed {
            return Err(ClientError::NotTyped(contract.function_name.clone()));
        }

        let mut errors = Vec::new();
        match coerce(return_type, &payload, "", &mut errors) {
            Some(value) if errors.is_empty() => Ok(value),
            _ => Err(ValidationError::new(return_type.to_string(), errors).into()),
        }
    }

    /// Decode the payload into `T`.
    pub fn value<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_value(self.payload()?)?)
    }

    /// Request for the page `links.next` points at, carrying the same tenant.
    fn follow(&self, url: String) -> Request {
        let mut headers = BTreeMap::new();
        if let Some(env) = &self.environment {
            headers.insert(TENANT_HEADER.to_string(), env.clone());
        }
        Request::new(url, Verb::Get, headers, None)
    }

    /// Every item across all pages, following `links.next` lazily.
    ///
    /// Stops when a page has no next link or a follow-up page is not a 200.
    pub fn all<T>(self, transport: Arc<dyn Transport>) -> BoxStream<'static, Result<T, ClientError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let pages = stream::unfold(Some(self), move |state| {
            let transport = transport.clone();
            async move {
                let page = state?;
                let items = page.value::<Vec<T>>();
                // no borrow of `items` may live across the await
                let next_url = if items.is_ok() { page.next_link() } else { None };
                let next = match next_url {
                    Some(url) => {
                        let timeout = page.contract.as_ref().and_then(|c| c.timeout);
                        match transport.call(page.follow(url), timeout).await {
                            Ok(next) if next.is_ok() => Some(CallResult {
                                contract: page.contract.clone(),
                                environment: page.environment.clone(),
                                ..next
                            }),
                            _ => None,
                        }
                    }
                    None => None,
                };
                Some((items, next))
            }
        });

        pages
            .flat_map(|items| match items {
                Ok(items) => stream::iter(items.into_iter().map(Ok).collect::<Vec<_>>()),
                Err(err) => stream::iter(vec![Err(err)]),
            })
            .boxed()
    }
}
