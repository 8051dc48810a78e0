#![warn(missing_docs)]

//! # onecall-config
//!
//! Configuration loading for the onecall code-execution server.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [engine]
//! timeout_secs = 30
//! max_heap_mb = 64
//!
//! [security]
//! blocked = ["fetch"]
//! warned = ["Date.now"]
//! allowed = ["require"]
//!
//! [workers]
//! launcher = ["uv", "run", "--quiet", "--script"]
//! idle_timeout_secs = 600
//!
//! [aliases]
//! read = "sheets.read"
//!
//! [snippets.first_sheet]
//! params = [{ name = "path", required = true }]
//! body = "sheets.read(path={{ path }}, sheet=\"Sheet1\")"
//!
//! [modules.sheets]
//! source = "capabilities/sheets.py"
//! secret_keys = ["api_key"]
//!
//! [modules.sheets.functions.read]
//! params = [{ name = "path", required = true }, { name = "sheet", default = "Sheet1" }]
//!
//! [values]
//! region = "eu"
//!
//! [secrets]
//! api_key = "${SHEETS_API_KEY}"
//! ```

#[cfg(feature = "config-watch")]
pub mod watcher;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use onecall_registry::{is_valid_function_name, is_valid_namespace, split_qualified, ModuleDecl, ParamSpec};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Namespace reserved for the built-in discovery helpers.
pub const RESERVED_NAMESPACE: &str = "meta";

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level onecall configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OnecallConfig {
    /// Execution engine limits.
    #[serde(default)]
    pub engine: EngineOverrides,

    /// Validator pattern lists and linting.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Worker pool settings.
    #[serde(default)]
    pub workers: WorkerOverrides,

    /// Short names mapped to qualified function names.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    /// Named, parameterized code templates.
    #[serde(default)]
    pub snippets: BTreeMap<String, SnippetConfig>,

    /// Worker-backed modules, keyed by namespace.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleDecl>,

    /// Configuration values forwarded into calls.
    #[serde(default)]
    pub values: Map<String, Value>,

    /// Secret values forwarded into calls that declare them.
    #[serde(default)]
    pub secrets: Secrets,
}

/// Secret values. `Debug` output never includes them.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Secrets(pub Map<String, Value>);

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Engine limit overrides. Unset values keep the engine defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineOverrides {
    /// Execution timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent command executions.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Maximum capability calls per command.
    #[serde(default)]
    pub max_calls: Option<usize>,

    /// Maximum command size in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Maximum rendered result size in kilobytes.
    #[serde(default)]
    pub max_output_kb: Option<usize>,
}

/// Validator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Run the pattern checks at all.
    #[serde(default = "default_true")]
    pub check: bool,

    /// Extra blocked patterns. These win over `allowed`.
    #[serde(default)]
    pub blocked: Vec<String>,

    /// Extra warned patterns.
    #[serde(default)]
    pub warned: Vec<String>,

    /// Patterns exempted from the default blocked and all warned patterns.
    #[serde(default)]
    pub allowed: Vec<String>,

    /// Optional external linter.
    #[serde(default)]
    pub lint: Option<LintConfig>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            check: true,
            blocked: Vec::new(),
            warned: Vec::new(),
            allowed: Vec::new(),
            lint: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// External linter invocation. The source is written to its stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct LintConfig {
    /// Program and arguments.
    pub command: Vec<String>,

    /// Give up after this many milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Worker pool overrides. Unset values keep the pool defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerOverrides {
    /// Launcher program and arguments; the module path is appended.
    #[serde(default)]
    pub launcher: Option<Vec<String>>,

    /// Idle time before a worker is terminated.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// How often the reaper scans for idle workers.
    #[serde(default)]
    pub reap_interval_secs: Option<u64>,

    /// Per-call timeout. Unset means calls may block indefinitely.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,

    /// Time allowed for a worker to print its handshake.
    #[serde(default)]
    pub startup_timeout_secs: Option<u64>,

    /// Environment variables passed through to workers.
    #[serde(default)]
    pub env_passthrough: Vec<String>,
}

/// A snippet template.
#[derive(Debug, Clone, Deserialize)]
pub struct SnippetConfig {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Declared parameters.
    #[serde(default)]
    pub params: Vec<ParamSpec>,

    /// Jinja template producing the code.
    pub body: String,
}

impl OnecallConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: OnecallConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (namespace, module) in &self.modules {
            if !is_valid_namespace(namespace) {
                return Err(ConfigError::Invalid(format!(
                    "module '{namespace}': namespace must match [a-z_][a-z0-9_]*"
                )));
            }
            if namespace == RESERVED_NAMESPACE {
                return Err(ConfigError::Invalid(format!(
                    "module '{namespace}': namespace is reserved for built-ins"
                )));
            }
            if module.source.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "module '{namespace}': 'source' must not be empty"
                )));
            }
            if let Some(bad) = module.functions.keys().find(|f| !is_valid_function_name(f)) {
                return Err(ConfigError::Invalid(format!(
                    "module '{namespace}': invalid function name '{bad}'"
                )));
            }
        }

        for (alias, target) in &self.aliases {
            if !is_valid_function_name(alias) {
                return Err(ConfigError::Invalid(format!(
                    "alias '{alias}': must be a plain identifier"
                )));
            }
            let valid_target = split_qualified(target)
                .map(|(ns, f)| is_valid_namespace(ns) && is_valid_function_name(f))
                .unwrap_or(false);
            if !valid_target {
                return Err(ConfigError::Invalid(format!(
                    "alias '{alias}': target '{target}' is not a qualified name (namespace.function)"
                )));
            }
        }

        for (name, snippet) in &self.snippets {
            if !is_valid_function_name(name) {
                return Err(ConfigError::Invalid(format!(
                    "snippet '{name}': must be a plain identifier"
                )));
            }
            if snippet.body.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "snippet '{name}': 'body' must not be empty"
                )));
            }
            if let Some(p) = snippet.params.iter().find(|p| !is_valid_function_name(&p.name)) {
                return Err(ConfigError::Invalid(format!(
                    "snippet '{name}': invalid parameter name '{}'",
                    p.name
                )));
            }
        }

        let patterns = self
            .security
            .blocked
            .iter()
            .chain(&self.security.warned)
            .chain(&self.security.allowed);
        for pattern in patterns {
            globset::Glob::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("security pattern '{pattern}': {e}"))
            })?;
        }
        if let Some(lint) = &self.security.lint {
            if lint.command.is_empty() {
                return Err(ConfigError::Invalid(
                    "security.lint: 'command' must not be empty".into(),
                ));
            }
        }

        if let Some(launcher) = &self.workers.launcher {
            if launcher.is_empty() {
                return Err(ConfigError::Invalid(
                    "workers.launcher must name a program".into(),
                ));
            }
        }
        let timeouts = [
            ("engine.timeout_secs", self.engine.timeout_secs),
            ("workers.idle_timeout_secs", self.workers.idle_timeout_secs),
            ("workers.reap_interval_secs", self.workers.reap_interval_secs),
            ("workers.call_timeout_secs", self.workers.call_timeout_secs),
            ("workers.startup_timeout_secs", self.workers.startup_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unresolved placeholders stay in place
                Err(_) => result.push_str(&format!("${{{var_name}}}")),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_empty_is_valid() {
        let config = OnecallConfig::from_toml("").unwrap();
        assert!(config.modules.is_empty());
        assert!(config.security.check);
        assert!(config.engine.timeout_secs.is_none());
    }

    #[test]
    fn config_parses_full_example() {
        let toml = r#"
            [engine]
            timeout_secs = 10
            max_heap_mb = 128
            max_calls = 20

            [security]
            blocked = ["fetch"]
            warned = ["Date.now"]
            allowed = ["require"]
            lint = { command = ["eslint", "--stdin"], timeout_ms = 500 }

            [workers]
            launcher = ["uv", "run", "--script"]
            idle_timeout_secs = 60
            env_passthrough = ["UV_CACHE_DIR"]

            [aliases]
            read = "sheets.read"

            [snippets.first]
            params = [{ name = "path", required = true }]
            body = "sheets.read(path={{ path }})"

            [modules.sheets]
            source = "caps/sheets.py"
            dependencies = ["openpyxl"]

            [modules.sheets.functions.read]
            params = [{ name = "path", required = true }]

            [values]
            region = "eu"
            retries = 3

            [secrets]
            api_key = "k"
        "#;

        let config = OnecallConfig::from_toml(toml).unwrap();
        assert_eq!(config.engine.timeout_secs, Some(10));
        assert_eq!(config.engine.max_calls, Some(20));
        assert_eq!(config.security.blocked, vec!["fetch"]);
        assert_eq!(config.security.lint.as_ref().unwrap().timeout_ms, Some(500));
        assert_eq!(config.workers.idle_timeout_secs, Some(60));
        assert_eq!(config.aliases["read"], "sheets.read");
        assert_eq!(config.snippets["first"].params[0].name, "path");
        assert_eq!(config.modules["sheets"].functions.len(), 1);
        assert_eq!(config.values["retries"], serde_json::json!(3));
        assert_eq!(config.secrets.0["api_key"], serde_json::json!("k"));
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("ONECALL_TEST_TOKEN", "secret123");
        let toml = r#"
            [secrets]
            token = "Bearer ${ONECALL_TEST_TOKEN}"
        "#;
        let config = OnecallConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(config.secrets.0["token"], "Bearer secret123");
        std::env::remove_var("ONECALL_TEST_TOKEN");
    }

    #[test]
    fn debug_output_hides_secret_values() {
        let config = OnecallConfig::from_toml("[secrets]\napi_key = \"hunter2\"\n").unwrap();
        let debug = format!("{config:?}");
        assert!(debug.contains("api_key"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn config_rejects_invalid_namespace() {
        let toml = r#"
            [modules.Sheets]
            source = "s.py"
        "#;
        let err = OnecallConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("Sheets"));
    }

    #[test]
    fn config_rejects_reserved_namespace() {
        let toml = r#"
            [modules.meta]
            source = "m.py"
        "#;
        let err = OnecallConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn config_rejects_unqualified_alias_target() {
        let toml = r#"
            [aliases]
            search = "search"
        "#;
        let err = OnecallConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("not a qualified name"));
    }

    #[test]
    fn config_rejects_empty_snippet_body() {
        let toml = r#"
            [snippets.nothing]
            body = "   "
        "#;
        assert!(OnecallConfig::from_toml(toml).is_err());
    }

    #[test]
    fn config_rejects_bad_glob() {
        let toml = r#"
            [security]
            blocked = ["eval[", "ok"]
        "#;
        let err = OnecallConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("eval["));
    }

    #[test]
    fn config_rejects_zero_timeouts() {
        let err = OnecallConfig::from_toml("[workers]\nidle_timeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("workers.idle_timeout_secs"));
    }

    #[test]
    fn config_rejects_empty_launcher() {
        assert!(OnecallConfig::from_toml("[workers]\nlauncher = []\n").is_err());
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("onecall.toml");
        std::fs::write(&path, "[aliases]\nsearch = \"web.search\"\n").unwrap();
        let config = OnecallConfig::from_file(&path).unwrap();
        assert_eq!(config.aliases["search"], "web.search");
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        assert_eq!(expand_env_vars("no variables here"), "no variables here");
    }
}
