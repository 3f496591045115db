//! Error types for the protocol layer.
//!
//! Four families, matching when they can happen:
//!
//! - [`DefinitionError`] is raised while contracts are registered and is
//!   always fatal (the process should refuse to start).
//! - [`ValidationError`] is raised per call when arguments do not match the
//!   declared types. It carries every failing field, not just the first.
//! - [`HttpError`] is the error kind a server returns, rebuilt client side
//!   from the status code alone.
//! - [`ClientError`] covers everything that can go wrong on the calling side.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum::Display;
use thiserror::Error;

/// Registration-time failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error(
        "method {function} already has a contract for path {path} with api version {api_version}"
    )]
    DuplicateContract {
        function: String,
        path: String,
        api_version: u32,
    },

    #[error("type {type_name} of argument {argument} in method {function} is not allowed: {reason}")]
    InvalidType {
        function: String,
        argument: String,
        type_name: String,
        reason: String,
    },

    #[error("method {function}: path placeholder <{placeholder}> has no matching parameter")]
    UnboundPlaceholder {
        function: String,
        placeholder: String,
    },

    #[error("method {function}: a method annotation cannot be added after the access policy annotation")]
    MisorderedAccessPolicy { function: String },

    #[error("method {function}: only one access policy annotation is allowed")]
    DuplicateAccessPolicy { function: String },

    #[error("method {function}: varkw requires a catch-all parameter typed as a generic object")]
    MissingCatchAll { function: String },

    #[error("method {function}: {message}")]
    Invalid { function: String, message: String },

    #[error("no method named {0} is registered")]
    UnknownMethod(String),

    #[error("a handler is already registered for {verb} {url}")]
    DuplicateHandler { verb: String, url: String },
}

impl DefinitionError {
    pub(crate) fn invalid(function: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            function: function.to_string(),
            message: message.into(),
        }
    }
}

/// A single failing field inside a [`ValidationError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path to the field (`filter.status`, `items.2`).
    pub loc: String,
    pub msg: String,
}

impl FieldError {
    pub fn new(loc: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            loc: loc.into(),
            msg: msg.into(),
        }
    }
}

/// Aggregated argument validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} validation error(s) for {model}: {}", .errors.len(), summarize(.errors))]
pub struct ValidationError {
    /// Name of the method or model being validated.
    pub model: String,
    pub errors: Vec<FieldError>,
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{} ({})", e.loc, e.msg))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ValidationError {
    pub fn new(model: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self {
            model: model.into(),
            errors,
        }
    }
}

/// Server-declared error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum HttpErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    ServerError,
    ShutdownInProgress,
}

impl HttpErrorKind {
    pub fn status(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::ServerError => 500,
            Self::ShutdownInProgress => 503,
        }
    }

    /// The fixed status table. Unlisted codes map to [`HttpErrorKind::ServerError`].
    pub fn from_status(code: u16) -> Self {
        match code {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            503 => Self::ShutdownInProgress,
            _ => Self::ServerError,
        }
    }

    fn default_message(self) -> &'static str {
        match self {
            Self::BadRequest => "Invalid request",
            Self::Unauthorized => "Access to this resource is unauthorized.",
            Self::Forbidden => "Access to this resource is forbidden.",
            Self::NotFound => "Request or referenced resource does not exist",
            Self::Conflict => "Request conflicts with the current state of the resource.",
            Self::ServerError => "An unexpected error occurred in the server while processing the request",
            Self::ShutdownInProgress => "Shutdown in progress",
        }
    }
}

/// An error with an HTTP status, produced by handlers and rebuilt by clients.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} ({}): {message}", .kind.status())]
pub struct HttpError {
    pub kind: HttpErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl HttpError {
    pub fn new(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// An error of `kind` carrying its stock message.
    pub fn generic(kind: HttpErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Conflict, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::ServerError, message)
    }

    pub fn shutdown_in_progress() -> Self {
        Self::generic(HttpErrorKind::ShutdownInProgress)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    /// Rebuild the error a server reported with `code`.
    ///
    /// `message` and `error_details` are taken from the body when present,
    /// otherwise the kind's stock message is used.
    pub fn from_status(code: u16, body: Option<&Value>) -> Self {
        let kind = HttpErrorKind::from_status(code);
        let message = body
            .and_then(|b| b.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let details = body.and_then(|b| b.get("error_details")).cloned();

        match message {
            Some(message) => Self {
                kind,
                message,
                details,
            },
            None => {
                let mut err = Self::generic(kind);
                err.details = details;
                err
            }
        }
    }

    /// Wire body for this error.
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("message".into(), Value::String(self.message.clone()));
        if let Some(details) = &self.details {
            body.insert("error_details".into(), details.clone());
        }
        Value::Object(body)
    }
}

impl From<ValidationError> for HttpError {
    fn from(err: ValidationError) -> Self {
        let message = format!("Failed to validate argument\n{}", err);
        HttpError::bad_request(message)
            .with_details(json!({ "validation_errors": err.errors }))
    }
}

/// Failure reported by a bound handler.
///
/// HTTP errors keep their status; anything else becomes a 500.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn into_http(self) -> HttpError {
        match self {
            Self::Http(err) => err,
            Self::Other(err) => HttpError::server_error(err.to_string()),
        }
    }
}

/// Failure on the calling side.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("method {0} is not defined for this client")]
    UnknownMethod(String),

    #[error("method {name} has no contract with api version {version}")]
    VersionNotFound { name: String, version: u32 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Http(#[from] HttpError),

    /// A synchronous caller ran out of time.
    #[error("connection refused")]
    ConnectionRefused,

    /// An async caller ran out of time.
    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("method {0} was not declared as a typed method")]
    NotTyped(String),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        let table = [
            (400, HttpErrorKind::BadRequest),
            (401, HttpErrorKind::Unauthorized),
            (403, HttpErrorKind::Forbidden),
            (404, HttpErrorKind::NotFound),
            (409, HttpErrorKind::Conflict),
            (500, HttpErrorKind::ServerError),
            (503, HttpErrorKind::ShutdownInProgress),
        ];
        for (code, kind) in table {
            assert_eq!(HttpErrorKind::from_status(code), kind);
            assert_eq!(kind.status(), code);
        }
        assert_eq!(HttpErrorKind::from_status(418), HttpErrorKind::ServerError);
    }

    #[test]
    fn test_from_status_uses_body_fields() {
        let body = json!({"message": "no such env", "error_details": {"id": 3}});
        let err = HttpError::from_status(404, Some(&body));
        assert_eq!(err.kind, HttpErrorKind::NotFound);
        assert_eq!(err.message, "no such env");
        assert_eq!(err.details, Some(json!({"id": 3})));
    }

    #[test]
    fn test_from_status_generic_without_body() {
        let err = HttpError::from_status(409, None);
        assert_eq!(err.kind, HttpErrorKind::Conflict);
        assert!(err.details.is_none());
        assert!(!err.message.is_empty());
    }

    #[test]
    fn test_validation_error_lists_all_fields() {
        let err = ValidationError::new(
            "create_project",
            vec![
                FieldError::new("name", "field required"),
                FieldError::new("project_id", "not a valid uuid"),
            ],
        );
        let text = err.to_string();
        assert!(text.starts_with("2 validation error(s)"));
        assert!(text.contains("name"));
        assert!(text.contains("project_id"));

        let http: HttpError = err.into();
        assert_eq!(http.status(), 400);
        let body = http.to_body();
        assert_eq!(body["error_details"]["validation_errors"].as_array().map(Vec::len), Some(2));
    }
}
