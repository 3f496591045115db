//! Declared types, function signatures and the structural validator.
//!
//! Rust has no runtime reflection over function signatures, so every callable
//! that becomes a contract is described by a [`Signature`]: its parameters,
//! their declared [`TypeSpec`] and defaults, and the return type. Contracts are
//! validated against the allow-list in [`check_declared`] when they are
//! registered, and incoming arguments are coerced by [`ArgumentValidator`].

use crate::codec;
use crate::error::{FieldError, ValidationError};
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Number, Value};
use std::fmt;

/// Declared type of a parameter, model field or return value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Str,
    Int,
    Float,
    Bool,
    Uuid,
    DateTime,
    /// Byte string, base64 on the wire.
    Bytes,
    Enum(EnumSpec),
    Model(ModelSpec),
    List(Box<TypeSpec>),
    /// Mapping with string keys.
    Dict(Box<TypeSpec>),
    Union(Vec<TypeSpec>),
    Optional(Box<TypeSpec>),
    Any,
    /// Untyped JSON object. The only legal type for a catch-all parameter.
    Object,
    /// Only meaningful as a return type.
    None,
}

/// An enumeration: symbolic member names and their wire values.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumSpec {
    pub name: String,
    pub variants: Vec<(String, Value)>,
}

/// A structured model with named fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: TypeSpec,
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn new(name: &str, ty: TypeSpec) -> Self {
        Self {
            name: name.to_string(),
            ty,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

impl TypeSpec {
    pub fn list(inner: TypeSpec) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn dict(inner: TypeSpec) -> Self {
        Self::Dict(Box::new(inner))
    }

    pub fn optional(inner: TypeSpec) -> Self {
        Self::Optional(Box::new(inner))
    }

    pub fn union(members: Vec<TypeSpec>) -> Self {
        Self::Union(members)
    }

    /// Enum whose wire values equal the lowercase member names.
    pub fn enumeration(name: &str, members: &[&str]) -> Self {
        Self::Enum(EnumSpec {
            name: name.to_string(),
            variants: members
                .iter()
                .map(|m| (m.to_string(), Value::String(m.to_lowercase())))
                .collect(),
        })
    }

    pub fn model(name: &str, fields: Vec<FieldSpec>) -> Self {
        Self::Model(ModelSpec {
            name: name.to_string(),
            fields,
        })
    }

    /// Strip one level of `Optional`.
    pub fn unwrap_optional(&self) -> &TypeSpec {
        match self {
            Self::Optional(inner) => inner,
            other => other,
        }
    }

    pub fn is_optional(&self) -> bool {
        match self {
            Self::Optional(_) | Self::Any | Self::None => true,
            Self::Union(members) => members.iter().any(|m| matches!(m, Self::None)),
            _ => false,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.unwrap_optional(), Self::List(_) | Self::Dict(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self.unwrap_optional(),
            Self::Str
                | Self::Int
                | Self::Float
                | Self::Bool
                | Self::Uuid
                | Self::DateTime
                | Self::Bytes
                | Self::Enum(_)
        )
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str => write!(f, "str"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Bool => write!(f, "bool"),
            Self::Uuid => write!(f, "UUID"),
            Self::DateTime => write!(f, "datetime"),
            Self::Bytes => write!(f, "bytes"),
            Self::Enum(e) => write!(f, "{}", e.name),
            Self::Model(m) => write!(f, "{}", m.name),
            Self::List(t) => write!(f, "List[{}]", t),
            Self::Dict(t) => write!(f, "Dict[str, {}]", t),
            Self::Union(ts) => {
                let names: Vec<String> = ts.iter().map(ToString::to_string).collect();
                write!(f, "Union[{}]", names.join(", "))
            }
            Self::Optional(t) => write!(f, "Optional[{}]", t),
            Self::Any => write!(f, "Any"),
            Self::Object => write!(f, "dict"),
            Self::None => write!(f, "None"),
        }
    }
}

// ── Signatures ──────────────────────────────────────────────────────────────

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeSpec,
    pub default: Option<Value>,
}

impl Param {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Description of a callable that can be turned into a contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub name: String,
    pub params: Vec<Param>,
    /// Name and type of the catch-all keyword parameter, if any.
    pub varkw: Option<(String, TypeSpec)>,
    pub returns: Option<TypeSpec>,
}

impl Signature {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            varkw: None,
            returns: None,
        }
    }

    /// Add a required parameter.
    pub fn param(mut self, name: &str, ty: TypeSpec) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            ty,
            default: None,
        });
        self
    }

    /// Add a parameter with a default value.
    pub fn param_default(mut self, name: &str, ty: TypeSpec, default: Value) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            ty,
            default: Some(default),
        });
        self
    }

    /// Declare a catch-all keyword parameter.
    pub fn catch_all(mut self, name: &str, ty: TypeSpec) -> Self {
        self.varkw = Some((name.to_string(), ty));
        self
    }

    pub fn returns(mut self, ty: TypeSpec) -> Self {
        self.returns = Some(ty);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }

    /// Map positional and keyword arguments onto parameter names.
    ///
    /// Only the arguments actually supplied end up in the result; defaults are
    /// left to the receiving side. Fails with every problem found at once.
    pub fn bind(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Map<String, Value>, ValidationError> {
        let mut errors = Vec::new();
        let mut bound = Map::new();

        if args.len() > self.params.len() {
            errors.push(FieldError::new(
                "__args__",
                format!(
                    "takes {} positional arguments but {} were given",
                    self.params.len(),
                    args.len()
                ),
            ));
        }
        for (param, value) in self.params.iter().zip(args) {
            bound.insert(param.name.clone(), value);
        }

        for (key, value) in kwargs {
            if bound.contains_key(&key) {
                errors.push(FieldError::new(&key, "got multiple values for argument"));
            } else if self.get(&key).is_some() || self.varkw.is_some() {
                bound.insert(key, value);
            } else {
                errors.push(FieldError::new(&key, "got an unexpected keyword argument"));
            }
        }

        for param in &self.params {
            if param.is_required() && !bound.contains_key(&param.name) {
                errors.push(FieldError::new(&param.name, "missing required argument"));
            }
        }

        if errors.is_empty() {
            Ok(bound)
        } else {
            Err(ValidationError::new(&self.name, errors))
        }
    }
}

// ── Registration-time allow-list ────────────────────────────────────────────

/// Where a declared type is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeUse {
    /// Substituted into the url path.
    Path,
    /// Encoded in the query string.
    Query,
    /// Sent in the JSON body or a header.
    Body,
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    List,
    Dict,
}

/// Check `ty` against the allow-list. Returns the reason it is rejected.
pub fn check_declared(ty: &TypeSpec, usage: TypeUse, strict: bool) -> Result<(), String> {
    if usage == TypeUse::Path && !ty.is_scalar() {
        return Err("path parameters must be simple values".to_string());
    }
    check_inner(ty, usage, strict, None, false)
}

fn check_inner(
    ty: &TypeSpec,
    usage: TypeUse,
    strict: bool,
    container: Option<Container>,
    in_model: bool,
) -> Result<(), String> {
    match ty {
        TypeSpec::Str
        | TypeSpec::Int
        | TypeSpec::Float
        | TypeSpec::Bool
        | TypeSpec::Uuid
        | TypeSpec::DateTime
        | TypeSpec::Bytes
        | TypeSpec::Enum(_) => Ok(()),
        TypeSpec::Any => {
            if strict {
                Err("Any is not allowed with strict typing".to_string())
            } else {
                Ok(())
            }
        }
        TypeSpec::Object => {
            if strict {
                Err("untyped dicts are not allowed with strict typing".to_string())
            } else {
                Ok(())
            }
        }
        TypeSpec::None => {
            if usage == TypeUse::Return && container.is_none() {
                Ok(())
            } else {
                Err("None is only allowed as a return type".to_string())
            }
        }
        TypeSpec::Optional(inner) => check_inner(inner, usage, strict, container, in_model),
        TypeSpec::Union(members) => {
            for member in members {
                if matches!(member, TypeSpec::None) {
                    continue;
                }
                check_inner(member, usage, strict, container, in_model)?;
            }
            Ok(())
        }
        TypeSpec::Model(model) => {
            if matches!(usage, TypeUse::Path | TypeUse::Query) {
                return Err("models cannot be passed in the url".to_string());
            }
            if in_model {
                return Err(format!("model {} is nested inside another model", model.name));
            }
            for field in &model.fields {
                check_inner(&field.ty, usage, strict, None, true)
                    .map_err(|reason| format!("field {}: {}", field.name, reason))?;
            }
            Ok(())
        }
        TypeSpec::List(inner) => match container {
            None => check_inner(inner, usage, strict, Some(Container::List), in_model),
            // a dict value may be a list of simple values
            Some(Container::Dict) => check_inner(inner, usage, strict, Some(Container::List), in_model),
            Some(Container::List) => Err("nested lists are not supported".to_string()),
        },
        TypeSpec::Dict(inner) => match container {
            None => check_inner(inner, usage, strict, Some(Container::Dict), in_model),
            Some(_) => Err("nested dicts are not supported".to_string()),
        },
    }
}

// ── Structural validation ───────────────────────────────────────────────────

/// Coerce `value` into `ty`, appending every failure to `errors`.
///
/// Returns `None` when the value could not be coerced.
pub fn coerce(ty: &TypeSpec, value: &Value, loc: &str, errors: &mut Vec<FieldError>) -> Option<Value> {
    let fail = |errors: &mut Vec<FieldError>, msg: String| -> Option<Value> {
        errors.push(FieldError::new(loc, msg));
        None
    };

    match ty {
        TypeSpec::Any => Some(value.clone()),
        TypeSpec::None => match value {
            Value::Null => Some(Value::Null),
            _ => fail(errors, "value is not none".into()),
        },
        TypeSpec::Optional(inner) => match value {
            Value::Null => Some(Value::Null),
            _ => coerce(inner, value, loc, errors),
        },
        TypeSpec::Str => match value {
            Value::String(_) => Some(value.clone()),
            _ => fail(errors, "str type expected".into()),
        },
        TypeSpec::Int => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(value.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Some(Value::Number(Number::from(f as i64))),
                _ => fail(errors, "value is not a valid integer".into()),
            },
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(i) => Some(Value::Number(i.into())),
                Err(_) => fail(errors, "value is not a valid integer".into()),
            },
            _ => fail(errors, "value is not a valid integer".into()),
        },
        TypeSpec::Float => {
            let parsed = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match parsed.and_then(Number::from_f64) {
                Some(n) => Some(Value::Number(n)),
                None => fail(errors, "value is not a valid float".into()),
            }
        }
        TypeSpec::Bool => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::Number(n) if n.as_u64() == Some(0) => Some(Value::Bool(false)),
            Value::Number(n) if n.as_u64() == Some(1) => Some(Value::Bool(true)),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Some(Value::Bool(false)),
                _ => fail(errors, "value could not be parsed to a boolean".into()),
            },
            _ => fail(errors, "value could not be parsed to a boolean".into()),
        },
        TypeSpec::Uuid => match value.as_str().map(uuid::Uuid::parse_str) {
            Some(Ok(id)) => Some(Value::String(id.hyphenated().to_string())),
            _ => fail(errors, "value is not a valid uuid".into()),
        },
        TypeSpec::DateTime => match value.as_str().and_then(parse_datetime) {
            Some(dt) => Some(Value::String(codec::format_datetime(&dt))),
            None => fail(errors, "invalid datetime format".into()),
        },
        TypeSpec::Bytes => match value.as_str() {
            Some(s) if base64::engine::general_purpose::STANDARD.decode(s).is_ok() => {
                Some(value.clone())
            }
            _ => fail(errors, "value is not valid base64 encoded bytes".into()),
        },
        TypeSpec::Enum(spec) => {
            let by_name = value
                .as_str()
                .and_then(|s| spec.variants.iter().find(|(name, _)| name == s));
            let by_value = spec.variants.iter().find(|(_, wire)| wire == value);
            match by_name.or(by_value) {
                Some((_, wire)) => Some(wire.clone()),
                None => {
                    let permitted: Vec<String> =
                        spec.variants.iter().map(|(_, v)| v.to_string()).collect();
                    fail(
                        errors,
                        format!(
                            "value is not a valid enumeration member; permitted: {}",
                            permitted.join(", ")
                        ),
                    )
                }
            }
        }
        TypeSpec::Model(model) => match value {
            Value::Object(obj) => {
                let before = errors.len();
                let mut out = Map::new();
                for field in &model.fields {
                    let field_loc = join_loc(loc, &field.name);
                    match obj.get(&field.name) {
                        Some(v) => {
                            if let Some(c) = coerce(&field.ty, v, &field_loc, errors) {
                                out.insert(field.name.clone(), c);
                            }
                        }
                        None => match (&field.default, field.ty.is_optional()) {
                            (Some(default), _) => {
                                out.insert(field.name.clone(), default.clone());
                            }
                            (None, true) => {
                                out.insert(field.name.clone(), Value::Null);
                            }
                            (None, false) => {
                                errors.push(FieldError::new(field_loc, "field required"));
                            }
                        },
                    }
                }
                (errors.len() == before).then_some(Value::Object(out))
            }
            _ => fail(errors, format!("value is not a valid {} object", model.name)),
        },
        TypeSpec::List(inner) => match value {
            Value::Array(items) => {
                let before = errors.len();
                let out: Vec<Value> = items
                    .iter()
                    .enumerate()
                    .filter_map(|(i, v)| coerce(inner, v, &join_loc(loc, &i.to_string()), errors))
                    .collect();
                (errors.len() == before).then_some(Value::Array(out))
            }
            _ => fail(errors, "value is not a valid list".into()),
        },
        TypeSpec::Dict(inner) => match value {
            Value::Object(obj) => {
                let before = errors.len();
                let mut out = Map::new();
                for (k, v) in obj {
                    if let Some(c) = coerce(inner, v, &join_loc(loc, k), errors) {
                        out.insert(k.clone(), c);
                    }
                }
                (errors.len() == before).then_some(Value::Object(out))
            }
            _ => fail(errors, "value is not a valid dict".into()),
        },
        TypeSpec::Object => match value {
            Value::Object(_) => Some(value.clone()),
            _ => fail(errors, "value is not a valid dict".into()),
        },
        TypeSpec::Union(members) => {
            if value.is_null() && members.iter().any(|m| matches!(m, TypeSpec::None)) {
                return Some(Value::Null);
            }
            for member in members {
                let mut scratch = Vec::new();
                if let Some(v) = coerce(member, value, loc, &mut scratch) {
                    if scratch.is_empty() {
                        return Some(v);
                    }
                }
            }
            fail(errors, format!("value does not match any type in {}", ty))
        }
    }
}

fn join_loc(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}.{child}")
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Validator synthesised from a parameter list.
#[derive(Debug, Clone)]
pub struct ArgumentValidator {
    model: String,
    params: Vec<Param>,
}

impl ArgumentValidator {
    pub fn from_signature(signature: &Signature) -> Self {
        Self {
            model: signature.name.clone(),
            params: signature.params.clone(),
        }
    }

    /// Coerce every declared argument, filling in defaults.
    ///
    /// Keys that are not declared parameters are ignored here; the caller
    /// decides whether they are allowed.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<Map<String, Value>, ValidationError> {
        let mut errors = Vec::new();
        let mut out = Map::new();

        for param in &self.params {
            match args.get(&param.name) {
                Some(value) => {
                    if let Some(v) = coerce(&param.ty, value, &param.name, &mut errors) {
                        out.insert(param.name.clone(), v);
                    }
                }
                None => match &param.default {
                    Some(default) => {
                        out.insert(param.name.clone(), default.clone());
                    }
                    None if param.ty.is_optional() => {
                        out.insert(param.name.clone(), Value::Null);
                    }
                    None => errors.push(FieldError::new(&param.name, "field required")),
                },
            }
        }

        if errors.is_empty() {
            Ok(out)
        } else {
            Err(ValidationError::new(&self.model, errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project() -> TypeSpec {
        TypeSpec::model(
            "Project",
            vec![
                FieldSpec::new("id", TypeSpec::Uuid),
                FieldSpec::new("name", TypeSpec::Str),
            ],
        )
    }

    // ── allow-list ──────────────────────────────────────────────────────────

    #[test]
    fn test_allows_simple_and_one_level_collections() {
        for ty in [
            TypeSpec::Str,
            TypeSpec::list(TypeSpec::Uuid),
            TypeSpec::dict(TypeSpec::Int),
            TypeSpec::dict(TypeSpec::list(TypeSpec::Str)),
            TypeSpec::optional(TypeSpec::DateTime),
            TypeSpec::union(vec![TypeSpec::Int, TypeSpec::Str]),
        ] {
            assert!(check_declared(&ty, TypeUse::Query, true).is_ok(), "{ty}");
        }
        assert!(check_declared(&TypeSpec::list(project()), TypeUse::Body, true).is_ok());
    }

    #[test]
    fn test_rejects_nested_collections() {
        for ty in [
            TypeSpec::dict(TypeSpec::dict(TypeSpec::Str)),
            TypeSpec::list(TypeSpec::list(TypeSpec::Str)),
            TypeSpec::list(TypeSpec::dict(TypeSpec::Str)),
            TypeSpec::dict(TypeSpec::list(TypeSpec::list(TypeSpec::Str))),
        ] {
            assert!(check_declared(&ty, TypeUse::Body, true).is_err(), "{ty}");
        }
    }

    #[test]
    fn test_any_only_without_strict_typing() {
        assert!(check_declared(&TypeSpec::Any, TypeUse::Body, true).is_err());
        assert!(check_declared(&TypeSpec::Any, TypeUse::Body, false).is_ok());
    }

    #[test]
    fn test_models_in_url_and_nested_models() {
        assert!(check_declared(&project(), TypeUse::Query, true).is_err());
        let outer = TypeSpec::model("Outer", vec![FieldSpec::new("inner", project())]);
        assert!(check_declared(&outer, TypeUse::Body, true).is_err());
        assert!(check_declared(&TypeSpec::list(TypeSpec::Str), TypeUse::Path, true).is_err());
    }

    // ── binding ─────────────────────────────────────────────────────────────

    #[test]
    fn test_bind_maps_positionals_in_declared_order() {
        let sig = Signature::new("f")
            .param("a", TypeSpec::Int)
            .param_default("b", TypeSpec::Str, json!("x"));
        let mut kwargs = Map::new();
        kwargs.insert("b".into(), json!("y"));
        let bound = sig.bind(vec![json!(1)], kwargs).unwrap();
        assert_eq!(Value::Object(bound), json!({"a": 1, "b": "y"}));
    }

    #[test]
    fn test_bind_reports_every_problem() {
        let sig = Signature::new("f").param("a", TypeSpec::Int).param("b", TypeSpec::Int);
        let mut kwargs = Map::new();
        kwargs.insert("c".into(), json!(1));
        let err = sig.bind(vec![], kwargs).unwrap_err();
        let locs: Vec<&str> = err.errors.iter().map(|e| e.loc.as_str()).collect();
        assert_eq!(locs, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_bind_catch_all_accepts_unknown() {
        let sig = Signature::new("f").catch_all("kwargs", TypeSpec::Object);
        let mut kwargs = Map::new();
        kwargs.insert("anything".into(), json!(true));
        assert!(sig.bind(vec![], kwargs).is_ok());
    }

    // ── coercion ────────────────────────────────────────────────────────────

    #[test]
    fn test_validator_coerces_query_strings() {
        let sig = Signature::new("list")
            .param("limit", TypeSpec::Int)
            .param("deep", TypeSpec::Bool)
            .param_default("since", TypeSpec::optional(TypeSpec::DateTime), Value::Null);
        let v = ArgumentValidator::from_signature(&sig);
        let mut args = Map::new();
        args.insert("limit".into(), json!("10"));
        args.insert("deep".into(), json!("true"));
        let out = v.validate(&args).unwrap();
        assert_eq!(out["limit"], json!(10));
        assert_eq!(out["deep"], json!(true));
        assert_eq!(out["since"], Value::Null);
    }

    #[test]
    fn test_validator_aggregates_errors() {
        let sig = Signature::new("create")
            .param("name", TypeSpec::Str)
            .param("id", TypeSpec::Uuid)
            .param("count", TypeSpec::Int);
        let v = ArgumentValidator::from_signature(&sig);
        let mut args = Map::new();
        args.insert("id".into(), json!("not-a-uuid"));
        args.insert("count".into(), json!("many"));
        let err = v.validate(&args).unwrap_err();
        assert_eq!(err.errors.len(), 3);
    }

    #[test]
    fn test_enum_accepts_name_or_value() {
        let ty = TypeSpec::Enum(EnumSpec {
            name: "State".into(),
            variants: vec![("deployed".into(), json!("deployed")), ("failed".into(), json!(2))],
        });
        let mut errors = Vec::new();
        assert_eq!(coerce(&ty, &json!("failed"), "s", &mut errors), Some(json!(2)));
        assert_eq!(coerce(&ty, &json!(2), "s", &mut errors), Some(json!(2)));
        assert!(coerce(&ty, &json!("gone"), "s", &mut errors).is_none());
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_model_field_paths() {
        let mut errors = Vec::new();
        let out = coerce(&project(), &json!({"name": 3}), "project", &mut errors);
        assert!(out.is_none());
        let locs: Vec<&str> = errors.iter().map(|e| e.loc.as_str()).collect();
        assert_eq!(locs, vec!["project.id", "project.name"]);
    }

    #[test]
    fn test_uuid_and_datetime_normalised() {
        let mut errors = Vec::new();
        let id = coerce(
            &TypeSpec::Uuid,
            &json!("6BA7B810-9DAD-11D1-80B4-00C04FD430C8"),
            "id",
            &mut errors,
        );
        assert_eq!(id, Some(json!("6ba7b810-9dad-11d1-80b4-00c04fd430c8")));
        let dt = coerce(&TypeSpec::DateTime, &json!("2024-01-02T03:04:05Z"), "t", &mut errors);
        assert_eq!(dt, Some(json!("2024-01-02T03:04:05.000000+00:00")));
        assert!(errors.is_empty());
    }
}
