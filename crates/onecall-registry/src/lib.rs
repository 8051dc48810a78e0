#![warn(missing_docs)]

//! # onecall-registry
//!
//! The function registry behind the single `run` operation.
//!
//! Agent code calls capabilities as `namespace.function(...)`. The registry
//! maps each qualified name to a [`RegistryEntry`] holding the parameter
//! schema and the isolation kind: an in-process [`Capability`] or a
//! worker-backed module described by a [`WorkerSpec`].
//!
//! Lookups are an explicit two-level map (namespace, then function). A miss
//! returns a typed [`LookupError`] carrying the names that do exist.
//!
//! A [`Registry`] is immutable once built. [`LiveRegistry`] holds the active
//! table behind a single swappable pointer so a reload never changes the view
//! of a command that already captured its snapshot.

pub mod builtins;
pub mod discovery;
pub mod live;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use discovery::{parse_script_dependencies, DeclaredModules, FunctionDecl, ModuleDecl};
pub use live::{LiveRegistry, RegistrySource, WeakRegistry};
pub use onecall_error::{CallError, LookupError};

static NAMESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap());
static FUNCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Maximum length of a namespace or function name.
pub const MAX_NAME_LENGTH: usize = 64;

/// Returns whether `name` is a valid namespace (`[a-z_][a-z0-9_]*`).
pub fn is_valid_namespace(name: &str) -> bool {
    name.len() <= MAX_NAME_LENGTH && NAMESPACE_RE.is_match(name)
}

/// Returns whether `name` is a valid function short name.
pub fn is_valid_function_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LENGTH && FUNCTION_RE.is_match(name)
}

/// Split `namespace.function` into its two parts.
pub fn split_qualified(qualified: &str) -> Result<(&str, &str), LookupError> {
    match qualified.split_once('.') {
        Some((ns, func)) if !ns.is_empty() && !func.is_empty() && !func.contains('.') => {
            Ok((ns, func))
        }
        _ => Err(LookupError::NotQualified(qualified.to_string())),
    }
}

/// Errors raised while building or reloading a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A namespace does not match `[a-z_][a-z0-9_]*`.
    #[error("invalid namespace '{0}': must match [a-z_][a-z0-9_]*")]
    InvalidNamespace(String),

    /// A function name is empty or contains invalid characters.
    #[error("invalid function name '{0}'")]
    InvalidFunctionName(String),

    /// Two entries share a qualified name.
    #[error("duplicate registry entry '{0}'")]
    Duplicate(String),

    /// A parameter schema is inconsistent.
    #[error("invalid parameter schema for '{function}': {reason}")]
    InvalidParams {
        /// Qualified name of the function.
        function: String,
        /// What is wrong with the schema.
        reason: String,
    },

    /// A worker module could not be read or described.
    #[error("invalid worker module '{path}': {reason}")]
    InvalidModule {
        /// The module source path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The discovery step failed as a whole.
    #[error("registry discovery failed: {0}")]
    Discovery(String),
}

/// One declared parameter of a registered function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Whether the caller must supply this parameter.
    #[serde(default)]
    pub required: bool,
    /// Value used when the caller omits the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Optional description of the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSpec {
    /// A required parameter.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            default: None,
            description: None,
        }
    }

    /// An optional parameter with a default value.
    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            required: false,
            default: Some(default),
            description: None,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// How the parameter appears in a signature: `name`, `name=default`
    /// or `name?`.
    pub fn render(&self) -> String {
        match (&self.default, self.required) {
            (_, true) => self.name.clone(),
            (Some(default), false) => format!("{}={default}", self.name),
            (None, false) => format!("{}?", self.name),
        }
    }
}

/// Per-call configuration and secret values handed to a capability.
///
/// Built fresh for every call from the registry snapshot; never cached by
/// the capability across calls.
#[derive(Clone, Default)]
pub struct CallContext {
    /// Configuration values visible to the function.
    pub config: Map<String, Value>,
    /// Secret values visible to the function.
    pub secrets: Map<String, Value>,
    /// The snapshot the calling command resolved against, when the call
    /// comes from a command.
    pub registry: Option<Arc<Registry>>,
}

impl CallContext {
    /// Attach the snapshot the call was resolved against.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

impl PartialEq for CallContext {
    fn eq(&self, other: &Self) -> bool {
        let same_registry = match (&self.registry, &other.registry) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_registry && self.config == other.config && self.secrets == other.secrets
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("config", &self.config)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("snapshot", &self.registry.is_some())
            .finish()
    }
}

/// The fully resolved configuration and secret feed a registry forwards
/// into calls.
#[derive(Clone, Default, PartialEq)]
pub struct CallValues {
    /// Configuration values, keyed by name.
    pub config: Map<String, Value>,
    /// Secret values, keyed by name.
    pub secrets: Map<String, Value>,
}

impl fmt::Debug for CallValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallValues")
            .field("config", &self.config)
            .field("secrets", &format_args!("<{} redacted>", self.secrets.len()))
            .finish()
    }
}

/// An in-process capability implementation.
#[async_trait::async_trait]
pub trait Capability: Send + Sync {
    /// Invoke the capability with already-bound keyword arguments.
    async fn call(&self, args: Map<String, Value>, ctx: &CallContext) -> Result<Value, CallError>;
}

/// Adapter turning an async closure into a [`Capability`].
pub struct FnCapability<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Map<String, Value>, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CallError>> + Send,
{
    async fn call(&self, args: Map<String, Value>, ctx: &CallContext) -> Result<Value, CallError> {
        (self.0)(args, ctx.clone()).await
    }
}

/// Wrap an async closure as a shareable [`Capability`].
pub fn capability_fn<F, Fut>(f: F) -> Arc<dyn Capability>
where
    F: Fn(Map<String, Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    Arc::new(FnCapability(f))
}

/// A worker-backed module: the source the launcher runs and the
/// dependencies it declares.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerSpec {
    /// Path of the module source. Identifies the worker process.
    pub source: PathBuf,
    /// Version-constrained package names the module depends on.
    pub dependencies: Vec<String>,
}

impl WorkerSpec {
    /// A worker spec with no declared dependencies.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dependencies: Vec::new(),
        }
    }
}

/// Where a registered function runs.
#[derive(Clone)]
pub enum Isolation {
    /// Directly in the host process.
    InProcess(Arc<dyn Capability>),
    /// In a persistent subprocess for the module.
    Worker(WorkerSpec),
}

impl Isolation {
    /// Short label: `in_process` or `worker`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InProcess(_) => "in_process",
            Self::Worker(_) => "worker",
        }
    }
}

impl fmt::Debug for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess(_) => f.write_str("InProcess"),
            Self::Worker(spec) => f.debug_tuple("Worker").field(spec).finish(),
        }
    }
}

/// A single registered function.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Namespace part of the qualified name.
    pub namespace: String,
    /// Function part of the qualified name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Ordered parameter schema.
    pub params: Vec<ParamSpec>,
    /// Where the function runs.
    pub isolation: Isolation,
    /// Configuration keys forwarded to the function. `None` forwards all.
    pub config_keys: Option<Vec<String>>,
    /// Secret keys forwarded to the function.
    pub secret_keys: Vec<String>,
}

impl RegistryEntry {
    /// An entry backed by an in-process capability.
    pub fn in_process(
        namespace: impl Into<String>,
        name: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        Self::new(namespace, name, Isolation::InProcess(capability))
    }

    /// An entry backed by a worker module.
    pub fn worker(namespace: impl Into<String>, name: impl Into<String>, spec: WorkerSpec) -> Self {
        Self::new(namespace, name, Isolation::Worker(spec))
    }

    fn new(namespace: impl Into<String>, name: impl Into<String>, isolation: Isolation) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            description: String::new(),
            params: Vec::new(),
            isolation,
            config_keys: None,
            secret_keys: Vec::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a parameter to the schema.
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Replace the parameter schema.
    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }

    /// Restrict the configuration keys forwarded to the function.
    pub fn with_config_keys(mut self, keys: Vec<String>) -> Self {
        self.config_keys = Some(keys);
        self
    }

    /// Set the secret keys forwarded to the function.
    pub fn with_secret_keys(mut self, keys: Vec<String>) -> Self {
        self.secret_keys = keys;
        self
    }

    /// `namespace.function`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// The expected call signature, e.g. `web.search(query, limit=10)`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self.params.iter().map(ParamSpec::render).collect();
        format!("{}({})", self.qualified_name(), params.join(", "))
    }

    /// Look up a declared parameter by name.
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Check keyword arguments against the schema and fill in defaults.
    ///
    /// Unknown and missing required arguments are rejected with the
    /// expected signature attached.
    pub fn bind(&self, mut args: Map<String, Value>) -> Result<Map<String, Value>, CallError> {
        if let Some(unknown) = args.keys().find(|k| self.param(k).is_none()) {
            return Err(self.argument_error(format!("unknown argument '{unknown}'")));
        }
        let mut bound = Map::new();
        for param in &self.params {
            match args.remove(&param.name) {
                Some(value) => {
                    bound.insert(param.name.clone(), value);
                }
                None if param.required => {
                    return Err(
                        self.argument_error(format!("missing required argument '{}'", param.name))
                    );
                }
                None => {
                    if let Some(default) = &param.default {
                        bound.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(bound)
    }

    /// Build an [`CallError::InvalidArguments`] for this entry.
    pub fn argument_error(&self, message: impl Into<String>) -> CallError {
        CallError::InvalidArguments {
            function: self.qualified_name(),
            message: message.into(),
            signature: self.signature(),
        }
    }

    /// The configuration and secrets this entry may see.
    pub fn context(&self, values: &CallValues) -> CallContext {
        let config = match &self.config_keys {
            None => values.config.clone(),
            Some(keys) => pick(&values.config, keys),
        };
        CallContext {
            config,
            secrets: pick(&values.secrets, &self.secret_keys),
            registry: None,
        }
    }

    /// JSON description used by discovery helpers.
    pub fn describe(&self) -> Value {
        let mut obj = serde_json::json!({
            "name": self.qualified_name(),
            "signature": self.signature(),
            "description": self.description,
            "params": self.params,
            "isolation": self.isolation.kind(),
        });
        if let Isolation::Worker(spec) = &self.isolation {
            obj["dependencies"] = serde_json::json!(spec.dependencies);
        }
        obj
    }
}

fn pick(source: &Map<String, Value>, keys: &[String]) -> Map<String, Value> {
    keys.iter()
        .filter_map(|k| source.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

/// The functions registered under one namespace.
#[derive(Debug, Clone)]
pub struct Namespace {
    /// Namespace name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Functions, keyed by short name (BTreeMap for deterministic ordering).
    pub functions: BTreeMap<String, RegistryEntry>,
}

/// An immutable registry table.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    namespaces: BTreeMap<String, Namespace>,
    values: CallValues,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a namespace.
    pub fn namespace(&self, namespace: &str) -> Result<&Namespace, LookupError> {
        self.namespaces
            .get(namespace)
            .ok_or_else(|| LookupError::UnknownNamespace {
                namespace: namespace.to_string(),
                known: self.namespace_names(),
            })
    }

    /// Two-level lookup of `namespace.function`.
    pub fn resolve(&self, namespace: &str, function: &str) -> Result<&RegistryEntry, LookupError> {
        let ns = self.namespace(namespace)?;
        ns.functions
            .get(function)
            .ok_or_else(|| LookupError::UnknownFunction {
                namespace: namespace.to_string(),
                function: function.to_string(),
                known: ns.functions.keys().cloned().collect(),
            })
    }

    /// Look up a qualified name.
    pub fn lookup(&self, qualified: &str) -> Result<&RegistryEntry, LookupError> {
        let (ns, func) = split_qualified(qualified)?;
        self.resolve(ns, func)
    }

    /// All namespace names, sorted.
    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.keys().cloned().collect()
    }

    /// All namespaces, sorted by name.
    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    /// All entries, sorted by qualified name.
    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.namespaces.values().flat_map(|ns| ns.functions.values())
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.namespaces.values().map(|ns| ns.functions.len()).sum()
    }

    /// Returns whether no functions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configuration and secret feed.
    pub fn values(&self) -> &CallValues {
        &self.values
    }

    /// Compact text listing of every function signature, grouped by
    /// namespace. Used in the front end's instructions.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for ns in self.namespaces.values() {
            if ns.description.is_empty() {
                out.push_str(&format!("{}:\n", ns.name));
            } else {
                out.push_str(&format!("{}: {}\n", ns.name, ns.description));
            }
            for entry in ns.functions.values() {
                if entry.description.is_empty() {
                    out.push_str(&format!("  {}\n", entry.signature()));
                } else {
                    out.push_str(&format!("  {} - {}\n", entry.signature(), entry.description));
                }
            }
        }
        out
    }
}

/// Builder that validates entries before producing a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<RegistryEntry>,
    descriptions: BTreeMap<String, String>,
    values: CallValues,
}

impl RegistryBuilder {
    /// Add an entry.
    pub fn add(mut self, entry: RegistryEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Add many entries.
    pub fn extend(mut self, entries: impl IntoIterator<Item = RegistryEntry>) -> Self {
        self.entries.extend(entries);
        self
    }

    /// Describe a namespace.
    pub fn describe_namespace(
        mut self,
        namespace: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        self.descriptions.insert(namespace.into(), description.into());
        self
    }

    /// Set the configuration and secret feed.
    pub fn values(mut self, values: CallValues) -> Self {
        self.values = values;
        self
    }

    /// Validate every entry and build the table.
    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut namespaces: BTreeMap<String, Namespace> = BTreeMap::new();
        for entry in self.entries {
            validate_entry(&entry)?;
            let ns = namespaces
                .entry(entry.namespace.clone())
                .or_insert_with(|| Namespace {
                    name: entry.namespace.clone(),
                    description: self
                        .descriptions
                        .get(&entry.namespace)
                        .cloned()
                        .unwrap_or_default(),
                    functions: BTreeMap::new(),
                });
            if ns.functions.contains_key(&entry.name) {
                return Err(RegistryError::Duplicate(entry.qualified_name()));
            }
            ns.functions.insert(entry.name.clone(), entry);
        }
        Ok(Registry {
            namespaces,
            values: self.values,
        })
    }
}

fn validate_entry(entry: &RegistryEntry) -> Result<(), RegistryError> {
    if !is_valid_namespace(&entry.namespace) {
        return Err(RegistryError::InvalidNamespace(entry.namespace.clone()));
    }
    if !is_valid_function_name(&entry.name) {
        return Err(RegistryError::InvalidFunctionName(entry.name.clone()));
    }
    let mut seen = std::collections::HashSet::new();
    for param in &entry.params {
        if !is_valid_function_name(&param.name) {
            return Err(RegistryError::InvalidParams {
                function: entry.qualified_name(),
                reason: format!("invalid parameter name '{}'", param.name),
            });
        }
        if !seen.insert(param.name.as_str()) {
            return Err(RegistryError::InvalidParams {
                function: entry.qualified_name(),
                reason: format!("parameter '{}' declared twice", param.name),
            });
        }
        if param.required && param.default.is_some() {
            return Err(RegistryError::InvalidParams {
                function: entry.qualified_name(),
                reason: format!("required parameter '{}' cannot have a default", param.name),
            });
        }
    }
    Ok(())
}
