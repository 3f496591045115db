//! Definition-time annotations and the contract registry.
//!
//! A callable is registered by handing its [`Signature`] and its annotations
//! to a [`RegistryBuilder`], in the order they are written (outermost first):
//!
//! ```
//! use orchestra_rpc::contract::{MethodOptions, Verb};
//! use orchestra_rpc::decorators::{RegistryBuilder, auth, typedmethod};
//! use orchestra_rpc::typing::{Signature, TypeSpec};
//!
//! let mut builder = RegistryBuilder::new();
//! builder
//!     .decorate(
//!         Signature::new("get_version").returns(TypeSpec::Str),
//!         [
//!             typedmethod(MethodOptions::new("/version").operation(Verb::Get)),
//!             auth("version.read", true, None),
//!         ],
//!     )
//!     .unwrap();
//! let registry = builder.freeze();
//! assert_eq!(registry.contracts("get_version").len(), 1);
//! ```
//!
//! Once startup is done the builder is frozen into an immutable [`Registry`]
//! that is shared by reference.

use crate::client::VersionMatch;
use crate::config::RpcConfig;
use crate::contract::{AccessPolicy, DEFAULT_ENVELOPE_KEY, MethodContract, MethodOptions};
use crate::error::{ClientError, DefinitionError};
use crate::typing::Signature;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One annotation on a callable.
#[derive(Debug, Clone)]
pub enum Annotation {
    Method { options: MethodOptions, typed: bool },
    AccessPolicy(AccessPolicy),
}

/// Plain method: arguments are validated, return values are free-form.
pub fn method(options: MethodOptions) -> Annotation {
    Annotation::Method {
        options,
        typed: false,
    }
}

/// Fully typed method: arguments and return type are checked against the
/// allow-list and responses always use the envelope.
pub fn typedmethod(options: MethodOptions) -> Annotation {
    Annotation::Method {
        options,
        typed: true,
    }
}

/// Access policy. Must be the last annotation (closest to the callable).
pub fn auth(auth_label: &str, read_only: bool, environment_param: Option<&str>) -> Annotation {
    Annotation::AccessPolicy(AccessPolicy {
        auth_label: auth_label.to_string(),
        read_only,
        environment_param: environment_param.map(str::to_string),
    })
}

/// Server-side binding of a handler to a registered method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub method: String,
    /// Bind only this version. `None` binds every version of the method.
    pub api_version: Option<u32>,
    /// Handler argument name for each method argument that is renamed.
    pub mapping: BTreeMap<String, String>,
}

pub fn handle(method: &str) -> Handle {
    Handle {
        method: method.to_string(),
        api_version: None,
        mapping: BTreeMap::new(),
    }
}

impl Handle {
    pub fn api_version(mut self, version: u32) -> Self {
        self.api_version = Some(version);
        self
    }

    pub fn map_arg(mut self, method_arg: &str, handler_arg: &str) -> Self {
        self.mapping
            .insert(method_arg.to_string(), handler_arg.to_string());
        self
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Open registry, only alive during startup.
#[derive(Debug)]
pub struct RegistryBuilder {
    contracts: BTreeMap<String, Vec<Arc<MethodContract>>>,
    envelope_key: String,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            contracts: BTreeMap::new(),
            envelope_key: DEFAULT_ENVELOPE_KEY.to_string(),
        }
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder whose methods use the configured envelope key unless they
    /// name their own.
    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new().envelope_key(&config.envelope_key)
    }

    pub fn envelope_key(mut self, key: &str) -> Self {
        self.envelope_key = key.to_string();
        self
    }

    /// Register `signature` with `annotations`, outermost first.
    ///
    /// Every method annotation yields one contract. Fails on the first
    /// definition problem; nothing is registered in that case.
    pub fn decorate(
        &mut self,
        signature: Signature,
        annotations: impl IntoIterator<Item = Annotation>,
    ) -> Result<Vec<Arc<MethodContract>>, DefinitionError> {
        let name = signature.name.clone();
        let signature = Arc::new(signature);

        let mut methods = Vec::new();
        let mut policy: Option<AccessPolicy> = None;
        for annotation in annotations {
            match annotation {
                Annotation::Method { options, typed } => {
                    if policy.is_some() {
                        return Err(DefinitionError::MisorderedAccessPolicy { function: name });
                    }
                    methods.push((options, typed));
                }
                Annotation::AccessPolicy(p) => {
                    if policy.is_some() {
                        return Err(DefinitionError::DuplicateAccessPolicy { function: name });
                    }
                    policy = Some(p);
                }
            }
        }

        if let Some(existing) = self.contracts.get(&name).and_then(|c| c.first()) {
            if *existing.signature != *signature {
                return Err(DefinitionError::invalid(
                    &name,
                    "already registered with a different signature",
                ));
            }
        }

        let mut created: Vec<Arc<MethodContract>> = Vec::new();
        for (mut options, typed) in methods {
            if options.envelope_key.is_none() {
                options.envelope_key = Some(self.envelope_key.clone());
            }
            let mut contract = MethodContract::new(signature.clone(), options, typed)?;
            contract.access_policy = policy.clone();

            let existing = self.contracts.get(&name).into_iter().flatten();
            let clash = existing.chain(created.iter()).any(|c| {
                c.url_path.path() == contract.url_path.path() && c.api_version == contract.api_version
            });
            if clash {
                return Err(DefinitionError::DuplicateContract {
                    function: name,
                    path: contract.url_path.path().to_string(),
                    api_version: contract.api_version,
                });
            }
            created.push(Arc::new(contract));
        }

        for contract in &created {
            debug!(
                method = %name,
                path = %contract.get_full_path(),
                verb = %contract.operation,
                "Registered method contract"
            );
        }
        let entry = self.contracts.entry(name).or_default();
        entry.extend(created.iter().cloned());
        entry.sort_by_key(|c| c.api_version);
        Ok(created)
    }

    /// Close registration.
    pub fn freeze(self) -> Arc<Registry> {
        Arc::new(Registry {
            contracts: self.contracts,
        })
    }
}

/// Frozen contract registry: function name to its contracts, ordered by api
/// version.
#[derive(Debug, Default)]
pub struct Registry {
    contracts: BTreeMap<String, Vec<Arc<MethodContract>>>,
}

impl Registry {
    pub fn contracts(&self, name: &str) -> &[Arc<MethodContract>] {
        self.contracts.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn get(&self, name: &str, api_version: u32) -> Option<Arc<MethodContract>> {
        self.contracts(name)
            .iter()
            .find(|c| c.api_version == api_version)
            .cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MethodContract>> {
        self.contracts.values().flatten()
    }

    /// Pick one contract for `name` according to `policy`.
    pub fn resolve(&self, name: &str, policy: VersionMatch) -> Result<Arc<MethodContract>, ClientError> {
        let contracts = self.contracts(name);
        if contracts.is_empty() {
            return Err(ClientError::UnknownMethod(name.to_string()));
        }
        let found = match policy {
            VersionMatch::Lowest => contracts.iter().min_by_key(|c| c.api_version),
            VersionMatch::Highest => contracts.iter().max_by_key(|c| c.api_version),
            VersionMatch::Exact(version) => contracts.iter().find(|c| c.api_version == version),
        };
        found.cloned().ok_or_else(|| match policy {
            VersionMatch::Exact(version) => ClientError::VersionNotFound {
                name: name.to_string(),
                version,
            },
            _ => ClientError::UnknownMethod(name.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::Verb;
    use crate::typing::TypeSpec;

    fn list_sig() -> Signature {
        Signature::new("list_versions").returns(TypeSpec::list(TypeSpec::Int))
    }

    fn versioned() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder
            .decorate(
                list_sig(),
                (1..=3).map(|v| typedmethod(MethodOptions::new("/version").operation(Verb::Get).api_version(v))),
            )
            .unwrap();
        builder.freeze()
    }

    #[test]
    fn test_duplicate_path_and_version_rejected() {
        let mut builder = RegistryBuilder::new();
        builder
            .decorate(list_sig(), [typedmethod(MethodOptions::new("/version"))])
            .unwrap();
        let err = builder
            .decorate(list_sig(), [typedmethod(MethodOptions::new("/version"))])
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateContract { .. }));

        let err = RegistryBuilder::new()
            .decorate(
                list_sig(),
                [
                    typedmethod(MethodOptions::new("/a")),
                    typedmethod(MethodOptions::new("/a")),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateContract { .. }));
    }

    #[test]
    fn test_same_path_other_version_is_fine() {
        let registry = versioned();
        assert_eq!(registry.contracts("list_versions").len(), 3);
        assert!(registry.get("list_versions", 2).is_some());
    }

    #[test]
    fn test_access_policy_must_be_last() {
        let err = RegistryBuilder::new()
            .decorate(
                list_sig(),
                [
                    auth("read", true, None),
                    typedmethod(MethodOptions::new("/version")),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, DefinitionError::MisorderedAccessPolicy { .. }));

        let err = RegistryBuilder::new()
            .decorate(
                list_sig(),
                [
                    typedmethod(MethodOptions::new("/version")),
                    auth("read", true, None),
                    auth("write", false, None),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateAccessPolicy { .. }));
    }

    #[test]
    fn test_access_policy_attached_to_every_contract() {
        let mut builder = RegistryBuilder::new();
        let contracts = builder
            .decorate(
                list_sig(),
                [
                    typedmethod(MethodOptions::new("/version")),
                    typedmethod(MethodOptions::new("/version").api_version(2)),
                    auth("version.read", true, Some("tid")),
                ],
            )
            .unwrap();
        assert!(contracts.iter().all(|c| c.access_policy.is_some()));
    }

    #[test]
    fn test_version_selection() {
        let registry = versioned();
        let pick = |policy| registry.resolve("list_versions", policy).map(|c| c.api_version);
        assert_eq!(pick(VersionMatch::Lowest).unwrap(), 1);
        assert_eq!(pick(VersionMatch::Highest).unwrap(), 3);
        assert_eq!(pick(VersionMatch::Exact(2)).unwrap(), 2);
        assert!(matches!(
            pick(VersionMatch::Exact(5)),
            Err(ClientError::VersionNotFound { version: 5, .. })
        ));
        assert!(matches!(
            registry.resolve("nope", VersionMatch::Lowest),
            Err(ClientError::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_failed_decoration_registers_nothing() {
        let mut builder = RegistryBuilder::new();
        let sig = Signature::new("bad").returns(TypeSpec::Str);
        assert!(builder
            .decorate(sig, [typedmethod(MethodOptions::new("/bad/<id>"))])
            .is_err());
        assert!(builder.freeze().contracts("bad").is_empty());
    }

    #[test]
    fn test_configured_envelope_key_applies_to_unnamed_methods() {
        let config = RpcConfig {
            envelope_key: "payload".to_string(),
            ..RpcConfig::default()
        };
        let mut builder = RegistryBuilder::from_config(&config);
        let contracts = builder
            .decorate(
                list_sig(),
                [
                    typedmethod(MethodOptions::new("/version")),
                    typedmethod(MethodOptions::new("/version").api_version(2).envelope_key("items")),
                ],
            )
            .unwrap();
        assert_eq!(contracts[0].envelope_key, "payload");
        assert_eq!(contracts[1].envelope_key, "items");
        assert_eq!(versioned().contracts("list_versions")[0].envelope_key, "data");
    }
}
