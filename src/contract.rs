//! Method contracts: the validated wire description of one callable.
//!
//! A [`MethodContract`] is created once when a signature is decorated (see
//! [`crate::decorators`]) and is immutable afterwards. It knows how to turn
//! call arguments into a [`Request`] and how to validate arguments received
//! on the other side.

use crate::error::{DefinitionError, FieldError, HttpError, ValidationError};
use crate::message::Request;
use crate::typing::{ArgumentValidator, Signature, TypeSpec, TypeUse, check_declared};
use crate::url_path::{PathError, UrlPath};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};

/// Header carrying the tenant (environment) id.
pub const TENANT_HEADER: &str = "X-Tenant-Id";

/// Envelope key when neither the method nor the registry names one.
pub const DEFAULT_ENVELOPE_KEY: &str = "data";

/// HTTP verb of a contract.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl Verb {
    /// Verbs whose arguments travel in a JSON body instead of the query string.
    pub fn has_body(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

/// Kind of caller allowed to use a contract.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Api,
    Agent,
    Compiler,
}

/// Machine-to-machine client types. Contracts limited to these are internal.
pub const MACHINE_CLIENT_TYPES: [ClientType; 2] = [ClientType::Agent, ClientType::Compiler];

/// Per-call metadata that getters may read and extend (e.g. the resolved
/// environment).
pub type CallMetadata = BTreeMap<String, Value>;

/// Resolves an argument after structural validation.
///
/// The returned value replaces the argument. Returning an error fails the
/// call with that status (e.g. a 404 for an unknown environment).
#[async_trait]
pub trait ArgGetter: Send + Sync {
    async fn resolve(&self, value: Value, metadata: &mut CallMetadata) -> Result<Value, HttpError>;
}

/// Wire placement and resolution options for one argument.
#[derive(Clone)]
pub struct ArgOption {
    /// Send this argument in a header with this name instead of the body/query.
    pub header: Option<String>,
    /// Echo the header back in the response.
    pub reply_header: bool,
    pub getter: Option<Arc<dyn ArgGetter>>,
}

impl Default for ArgOption {
    fn default() -> Self {
        Self {
            header: None,
            reply_header: true,
            getter: None,
        }
    }
}

impl fmt::Debug for ArgOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgOption")
            .field("header", &self.header)
            .field("reply_header", &self.reply_header)
            .field("getter", &self.getter.is_some())
            .finish()
    }
}

impl ArgOption {
    pub fn header(name: &str) -> Self {
        Self {
            header: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn getter(getter: Arc<dyn ArgGetter>) -> Self {
        Self {
            getter: Some(getter),
            ..Default::default()
        }
    }

    pub fn without_reply_header(mut self) -> Self {
        self.reply_header = false;
        self
    }

    pub fn with_getter(mut self, getter: Arc<dyn ArgGetter>) -> Self {
        self.getter = Some(getter);
        self
    }
}

/// Where an argument goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Path,
    Query,
    Body,
    Header,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    pub name: String,
    pub ty: TypeSpec,
    pub default: Option<Value>,
    pub location: ArgLocation,
}

/// Access policy annotation. Only its placement is checked here; enforcing it
/// is up to the authorization layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    pub auth_label: String,
    pub read_only: bool,
    pub environment_param: Option<String>,
}

/// Options accepted by the `method` / `typedmethod` decorators.
#[derive(Debug, Clone)]
pub struct MethodOptions {
    pub path: String,
    pub operation: Verb,
    pub reply: bool,
    pub arg_options: BTreeMap<String, ArgOption>,
    pub timeout: Option<Duration>,
    pub server_agent: bool,
    pub api: Option<bool>,
    pub agent_server: bool,
    pub validate_sid: Option<bool>,
    pub client_types: Vec<ClientType>,
    pub api_version: u32,
    pub api_prefix: String,
    pub envelope: bool,
    /// `None` takes the registry's envelope key.
    pub envelope_key: Option<String>,
    pub strict_typing: bool,
    pub varkw: bool,
}

impl MethodOptions {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            operation: Verb::Post,
            reply: true,
            arg_options: BTreeMap::new(),
            timeout: None,
            server_agent: false,
            api: None,
            agent_server: false,
            validate_sid: None,
            client_types: vec![ClientType::Api],
            api_version: 1,
            api_prefix: "api".to_string(),
            envelope: false,
            envelope_key: None,
            strict_typing: true,
            varkw: false,
        }
    }

    pub fn operation(mut self, verb: Verb) -> Self {
        self.operation = verb;
        self
    }

    pub fn api_version(mut self, version: u32) -> Self {
        self.api_version = version;
        self
    }

    pub fn api_prefix(mut self, prefix: &str) -> Self {
        self.api_prefix = prefix.to_string();
        self
    }

    pub fn reply(mut self, reply: bool) -> Self {
        self.reply = reply;
        self
    }

    pub fn arg_option(mut self, arg: &str, option: ArgOption) -> Self {
        self.arg_options.insert(arg.to_string(), option);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Server to agent call, delivered over the reverse channel.
    pub fn server_agent(mut self) -> Self {
        self.server_agent = true;
        self
    }

    /// Agent to server call.
    pub fn agent_server(mut self) -> Self {
        self.agent_server = true;
        self
    }

    pub fn api(mut self, api: bool) -> Self {
        self.api = Some(api);
        self
    }

    pub fn validate_sid(mut self, validate: bool) -> Self {
        self.validate_sid = Some(validate);
        self
    }

    pub fn client_types(mut self, types: impl IntoIterator<Item = ClientType>) -> Self {
        self.client_types = types.into_iter().collect();
        self
    }

    pub fn envelope(mut self, envelope: bool) -> Self {
        self.envelope = envelope;
        self
    }

    pub fn envelope_key(mut self, key: &str) -> Self {
        self.envelope_key = Some(key.to_string());
        self
    }

    pub fn strict_typing(mut self, strict: bool) -> Self {
        self.strict_typing = strict;
        self
    }

    pub fn varkw(mut self, varkw: bool) -> Self {
        self.varkw = varkw;
        self
    }
}

/// Validated metadata of one callable at one api version.
#[derive(Debug, Clone)]
pub struct MethodContract {
    pub function_name: String,
    pub signature: Arc<Signature>,
    pub operation: Verb,
    pub url_path: UrlPath,
    pub api_version: u32,
    pub api_prefix: String,
    pub client_types: Vec<ClientType>,
    pub args: Vec<ArgSpec>,
    pub arg_options: BTreeMap<String, ArgOption>,
    pub return_type: Option<TypeSpec>,
    pub reply: bool,
    pub envelope: bool,
    pub envelope_key: String,
    pub validate_sid: bool,
    pub varkw: bool,
    pub strict_typing: bool,
    pub timeout: Option<Duration>,
    pub server_agent: bool,
    pub agent_server: bool,
    pub api: bool,
    pub typed: bool,
    pub access_policy: Option<AccessPolicy>,
    validator: ArgumentValidator,
}

impl MethodContract {
    /// Validate `options` against `signature` and build the contract.
    pub fn new(signature: Arc<Signature>, options: MethodOptions, typed: bool) -> Result<Self, DefinitionError> {
        let name = signature.name.clone();
        let api = options
            .api
            .unwrap_or(!options.server_agent && !options.agent_server);
        let validate_sid = options.validate_sid.unwrap_or(options.agent_server && !api);
        let url_path = UrlPath::new(&options.path);

        if options.client_types.is_empty() {
            return Err(DefinitionError::invalid(&name, "at least one client type is required"));
        }

        for var in url_path.vars() {
            if signature.get(var).is_none() {
                return Err(DefinitionError::UnboundPlaceholder {
                    function: name,
                    placeholder: var.clone(),
                });
            }
        }

        for arg in options.arg_options.keys() {
            if signature.get(arg).is_none() {
                return Err(DefinitionError::invalid(
                    &name,
                    format!("arg_options refers to unknown argument {arg}"),
                ));
            }
        }

        if options.varkw && !matches!(signature.varkw, Some((_, TypeSpec::Object))) {
            return Err(DefinitionError::MissingCatchAll { function: name });
        }

        let args: Vec<ArgSpec> = signature
            .params
            .iter()
            .map(|p| {
                let header = options
                    .arg_options
                    .get(&p.name)
                    .is_some_and(|o| o.header.is_some());
                let location = if url_path.has_var(&p.name) {
                    ArgLocation::Path
                } else if header {
                    ArgLocation::Header
                } else if options.operation.has_body() {
                    ArgLocation::Body
                } else {
                    ArgLocation::Query
                };
                ArgSpec {
                    name: p.name.clone(),
                    ty: p.ty.clone(),
                    default: p.default.clone(),
                    location,
                }
            })
            .collect();

        if typed {
            for arg in &args {
                let usage = match arg.location {
                    ArgLocation::Path => TypeUse::Path,
                    ArgLocation::Query => TypeUse::Query,
                    ArgLocation::Body | ArgLocation::Header => TypeUse::Body,
                };
                check_declared(&arg.ty, usage, options.strict_typing).map_err(|reason| {
                    DefinitionError::InvalidType {
                        function: name.clone(),
                        argument: arg.name.clone(),
                        type_name: arg.ty.to_string(),
                        reason,
                    }
                })?;
            }
            let returns = signature.returns.as_ref().ok_or_else(|| {
                DefinitionError::invalid(&name, "typed methods must declare a return type")
            })?;
            check_declared(returns, TypeUse::Return, options.strict_typing).map_err(|reason| {
                DefinitionError::InvalidType {
                    function: name.clone(),
                    argument: "return".to_string(),
                    type_name: returns.to_string(),
                    reason,
                }
            })?;
        }

        let validator = ArgumentValidator::from_signature(&signature);
        Ok(Self {
            function_name: name,
            return_type: signature.returns.clone(),
            operation: options.operation,
            url_path,
            api_version: options.api_version,
            api_prefix: options.api_prefix,
            client_types: options.client_types,
            args,
            arg_options: options.arg_options,
            reply: options.reply,
            envelope: typed || options.envelope,
            envelope_key: options
                .envelope_key
                .unwrap_or_else(|| DEFAULT_ENVELOPE_KEY.to_string()),
            validate_sid,
            varkw: options.varkw,
            strict_typing: options.strict_typing,
            timeout: options.timeout,
            server_agent: options.server_agent,
            agent_server: options.agent_server,
            api,
            typed,
            access_policy: None,
            signature,
            validator,
        })
    }

    /// `/<prefix>/v<version><path>`
    pub fn get_full_path(&self) -> String {
        format!("/{}/v{}{}", self.api_prefix, self.api_version, self.url_path.path())
    }

    /// Routing regex for the server side.
    pub fn get_listen_url(&self) -> String {
        format!(
            "/{}/v{}{}",
            self.api_prefix,
            self.api_version,
            self.url_path.generate_regex_path()
        )
    }

    /// Concrete url for the given path parameter values.
    pub fn get_call_url(&self, values: &BTreeMap<String, String>) -> Result<String, PathError> {
        Ok(format!(
            "/{}/v{}{}",
            self.api_prefix,
            self.api_version,
            self.url_path.generate_path(values)?
        ))
    }

    /// True when this contract is reachable by callers other than agents and
    /// compilers.
    pub fn is_external_interface(&self) -> bool {
        let public = self
            .client_types
            .iter()
            .any(|ct| !MACHINE_CLIENT_TYPES.contains(ct));
        public && !self.agent_server
    }

    /// Headers a caller may need to set for this contract.
    pub fn get_call_headers(&self) -> BTreeSet<String> {
        let mut headers = BTreeSet::new();
        headers.insert("Authorization".to_string());
        for opt in self.arg_options.values() {
            if let Some(header) = &opt.header {
                headers.insert(header.clone());
            }
        }
        headers
    }

    pub fn arg(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|a| a.name == name)
    }

    /// Structural validation of incoming arguments.
    pub fn validate_arguments(&self, args: &Map<String, Value>) -> Result<Map<String, Value>, ValidationError> {
        self.validator.validate(args)
    }

    /// Build the request for a call. No I/O happens here.
    pub fn build_call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Request, ValidationError> {
        let mut msg = Map::new();
        for (param, value) in self.signature.params.iter().zip(args) {
            msg.insert(param.name.clone(), value);
        }
        msg.extend(kwargs);

        for (name, value) in msg.iter_mut() {
            if let Some(symbolic) = self.enum_member_name(name, value) {
                *value = Value::String(symbolic);
            }
        }

        let mut headers = BTreeMap::new();
        for (name, option) in &self.arg_options {
            if let Some(header) = &option.header {
                if let Some(value) = msg.remove(name) {
                    headers.insert(header.clone(), stringify(&value));
                }
            }
        }

        let mut path_values = BTreeMap::new();
        for var in self.url_path.vars() {
            if let Some(value) = msg.remove(var) {
                path_values.insert(var.clone(), stringify(&value));
            }
        }
        let mut url = self.get_call_url(&path_values).map_err(|PathError::Unbound(var)| {
            ValidationError::new(
                &self.function_name,
                vec![FieldError::new(var, "missing path parameter")],
            )
        })?;

        if self.operation.has_body() {
            return Ok(Request::new(url, self.operation, headers, Some(Value::Object(msg))));
        }

        let query = encode_query(&msg);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        Ok(Request::new(url, self.operation, headers, None))
    }

    /// If `name` is an enum argument and `value` one of its wire values,
    /// return the member's symbolic name.
    fn enum_member_name(&self, name: &str, value: &Value) -> Option<String> {
        let arg = self.arg(name)?;
        let TypeSpec::Enum(spec) = arg.ty.unwrap_optional() else {
            return None;
        };
        spec.variants
            .iter()
            .find(|(symbolic, wire)| wire == value || value.as_str() == Some(symbolic.as_str()))
            .map(|(symbolic, _)| symbolic.clone())
    }
}

/// Text form of a value for headers, paths and query strings.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Query-encode arguments. Mappings are flattened one level (`name.key`),
/// lists repeat their key, nulls are left out.
pub fn encode_query(msg: &Map<String, Value>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    fn push(serializer: &mut url::form_urlencoded::Serializer<'_, String>, key: &str, value: &Value) {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    serializer.append_pair(key, &stringify(item));
                }
            }
            other => {
                serializer.append_pair(key, &stringify(other));
            }
        }
    }

    for (name, value) in msg {
        match value {
            Value::Object(map) => {
                for (key, inner) in map {
                    push(&mut serializer, &format!("{name}.{key}"), inner);
                }
            }
            other => push(&mut serializer, name, other),
        }
    }
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typing::FieldSpec;
    use serde_json::json;

    fn project_model() -> TypeSpec {
        TypeSpec::model(
            "Project",
            vec![
                FieldSpec::new("id", TypeSpec::Uuid),
                FieldSpec::new("name", TypeSpec::Str),
            ],
        )
    }

    fn create_project() -> Arc<Signature> {
        Arc::new(
            Signature::new("create_project")
                .param("name", TypeSpec::Str)
                .param_default("project_id", TypeSpec::optional(TypeSpec::Uuid), Value::Null)
                .returns(project_model()),
        )
    }

    #[test]
    fn test_full_path_is_deterministic() {
        let contract = MethodContract::new(
            create_project(),
            MethodOptions::new("/project").operation(Verb::Put).api_version(2),
            true,
        )
        .unwrap();
        assert_eq!(contract.get_full_path(), "/api/v2/project");
        assert_eq!(contract.get_full_path(), contract.get_full_path());
        assert!(contract.envelope);
    }

    #[test]
    fn test_put_builds_json_body() {
        let contract = MethodContract::new(
            create_project(),
            MethodOptions::new("/project").operation(Verb::Put).api_version(2),
            true,
        )
        .unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("name".into(), json!("demo"));
        let request = contract.build_call(vec![], kwargs).unwrap();
        assert_eq!(request.method, Verb::Put);
        assert_eq!(request.url, "/api/v2/project");
        assert_eq!(request.body, Some(json!({"name": "demo"})));
    }

    #[test]
    fn test_get_flattens_mapping_into_query() {
        let sig = Arc::new(
            Signature::new("list_resources")
                .param("tid", TypeSpec::Uuid)
                .param_default(
                    "filter",
                    TypeSpec::optional(TypeSpec::dict(TypeSpec::list(TypeSpec::Str))),
                    Value::Null,
                )
                .returns(TypeSpec::list(TypeSpec::Str)),
        );
        let contract = MethodContract::new(
            sig,
            MethodOptions::new("/resource")
                .operation(Verb::Get)
                .arg_option("tid", ArgOption::header(TENANT_HEADER)),
            true,
        )
        .unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("tid".into(), json!("6ba7b810-9dad-11d1-80b4-00c04fd430c8"));
        kwargs.insert("filter".into(), json!({"status": ["a", "b"]}));
        let request = contract.build_call(vec![], kwargs).unwrap();
        assert_eq!(request.url, "/api/v1/resource?filter.status=a&filter.status=b");
        assert!(request.body.is_none());
        assert_eq!(
            request.headers.get(TENANT_HEADER).map(String::as_str),
            Some("6ba7b810-9dad-11d1-80b4-00c04fd430c8")
        );
    }

    #[test]
    fn test_path_parameters_round_trip() {
        let sig = Arc::new(
            Signature::new("get_resource")
                .param("rid", TypeSpec::Str)
                .param_default("logs", TypeSpec::Bool, json!(false))
                .returns(TypeSpec::Str),
        );
        let contract =
            MethodContract::new(sig, MethodOptions::new("/resource/<rid>").operation(Verb::Get), true)
                .unwrap();
        let rid = "std::File[host,path=/tmp/x y]";
        let request = contract
            .build_call(vec![json!(rid), json!(true)], Map::new())
            .unwrap();
        assert!(request.url.ends_with("?logs=true"));

        let path = request.url.trim_start_matches("/api/v1");
        let recovered = contract.url_path.match_path(path).unwrap();
        assert_eq!(recovered.get("rid").map(String::as_str), Some(rid));
    }

    #[test]
    fn test_enum_arguments_use_symbolic_name() {
        let sig = Arc::new(
            Signature::new("set_state")
                .param(
                    "state",
                    TypeSpec::Enum(crate::typing::EnumSpec {
                        name: "State".into(),
                        variants: vec![("deployed".into(), json!(1)), ("failed".into(), json!(2))],
                    }),
                )
                .returns(TypeSpec::None),
        );
        let contract = MethodContract::new(sig, MethodOptions::new("/state"), true).unwrap();
        let request = contract.build_call(vec![json!(2)], Map::new()).unwrap();
        assert_eq!(request.body, Some(json!({"state": "failed"})));
    }

    #[test]
    fn test_unbound_placeholder_is_rejected() {
        let sig = Arc::new(Signature::new("get").returns(TypeSpec::Str));
        let err = MethodContract::new(sig, MethodOptions::new("/thing/<id>"), true).unwrap_err();
        assert!(matches!(err, DefinitionError::UnboundPlaceholder { .. }));
    }

    #[test]
    fn test_nested_collection_is_rejected_at_definition() {
        let sig = Arc::new(
            Signature::new("bad")
                .param("data", TypeSpec::dict(TypeSpec::dict(TypeSpec::Str)))
                .returns(TypeSpec::None),
        );
        let err = MethodContract::new(sig, MethodOptions::new("/bad"), true).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidType { .. }));
    }

    #[test]
    fn test_varkw_requires_catch_all() {
        let sig = Arc::new(Signature::new("f").returns(TypeSpec::None));
        let err = MethodContract::new(sig, MethodOptions::new("/f").varkw(true), false).unwrap_err();
        assert!(matches!(err, DefinitionError::MissingCatchAll { .. }));

        let sig = Arc::new(Signature::new("f").catch_all("kwargs", TypeSpec::Object));
        assert!(MethodContract::new(sig, MethodOptions::new("/f").varkw(true), false).is_ok());
    }

    #[test]
    fn test_external_interface_is_derived() {
        let sig = Arc::new(Signature::new("f"));
        let internal = MethodContract::new(
            sig.clone(),
            MethodOptions::new("/f").client_types([ClientType::Agent, ClientType::Compiler]),
            false,
        )
        .unwrap();
        assert!(!internal.is_external_interface());

        let public = MethodContract::new(sig.clone(), MethodOptions::new("/f"), false).unwrap();
        assert!(public.is_external_interface());

        let agent_call = MethodContract::new(
            sig,
            MethodOptions::new("/f")
                .agent_server()
                .client_types([ClientType::Api, ClientType::Agent]),
            false,
        )
        .unwrap();
        assert!(!agent_call.is_external_interface());
        assert!(agent_call.validate_sid);
    }

    #[test]
    fn test_call_headers() {
        let sig = Arc::new(Signature::new("f").param("tid", TypeSpec::Uuid));
        let contract = MethodContract::new(
            sig,
            MethodOptions::new("/f").arg_option("tid", ArgOption::header(TENANT_HEADER)),
            false,
        )
        .unwrap();
        let headers = contract.get_call_headers();
        assert!(headers.contains("Authorization"));
        assert!(headers.contains(TENANT_HEADER));
    }
}
