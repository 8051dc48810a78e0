//! Registry discovery from declared module metadata.
//!
//! Worker-backed capabilities are declared per namespace: the module source
//! path, the functions it exposes and their parameter schemas. Dependencies
//! are taken from the declaration or, when omitted, from the module's own
//! inline script header:
//!
//! ```text
//! # /// script
//! # dependencies = ["openpyxl>=3.1"]
//! # ///
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    CallValues, ParamSpec, Registry, RegistryEntry, RegistryError, RegistrySource, WorkerSpec,
};

/// A declared worker module, keyed by namespace in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDecl {
    /// Module source path. Relative paths resolve against the base
    /// directory of the declaration.
    pub source: PathBuf,

    /// Namespace description.
    #[serde(default)]
    pub description: String,

    /// Dependencies. When omitted they are read from the source header.
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,

    /// Configuration keys forwarded to calls. Omitted forwards all.
    #[serde(default)]
    pub config_keys: Option<Vec<String>>,

    /// Secret keys forwarded to calls.
    #[serde(default)]
    pub secret_keys: Vec<String>,

    /// Exposed functions, keyed by short name.
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionDecl>,
}

/// A declared function of a worker module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionDecl {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Ordered parameter schema.
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

/// A complete discovery input: declared modules plus in-process entries.
#[derive(Clone, Default)]
pub struct DeclaredModules {
    /// Worker modules keyed by namespace.
    pub modules: BTreeMap<String, ModuleDecl>,
    /// Directory relative module paths resolve against.
    pub base_dir: PathBuf,
    /// In-process entries registered alongside the modules.
    pub builtins: Vec<RegistryEntry>,
    /// Configuration and secret feed.
    pub values: CallValues,
}

impl DeclaredModules {
    /// Build a registry from the declarations.
    pub fn build(&self) -> Result<Registry, RegistryError> {
        let mut builder = Registry::builder()
            .extend(self.builtins.iter().cloned())
            .values(self.values.clone());

        for (namespace, module) in &self.modules {
            let source = if module.source.is_absolute() {
                module.source.clone()
            } else {
                self.base_dir.join(&module.source)
            };
            let dependencies = match &module.dependencies {
                Some(deps) => deps.clone(),
                None => read_dependencies(&source)?,
            };
            if module.functions.is_empty() {
                tracing::warn!(namespace = %namespace, "module declares no functions");
            }
            if !module.description.is_empty() {
                builder = builder.describe_namespace(namespace.clone(), module.description.clone());
            }
            for (name, function) in &module.functions {
                let mut entry = RegistryEntry::worker(
                    namespace.clone(),
                    name.clone(),
                    WorkerSpec {
                        source: source.clone(),
                        dependencies: dependencies.clone(),
                    },
                )
                .with_description(function.description.clone())
                .with_params(function.params.clone())
                .with_secret_keys(module.secret_keys.clone());
                entry.config_keys = module.config_keys.clone();
                builder = builder.add(entry);
            }
        }

        builder.build()
    }
}

impl RegistrySource for DeclaredModules {
    fn discover(&self) -> Result<Registry, RegistryError> {
        self.build()
    }
}

fn read_dependencies(source: &Path) -> Result<Vec<String>, RegistryError> {
    let text = std::fs::read_to_string(source).map_err(|e| RegistryError::InvalidModule {
        path: source.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_script_dependencies(&text).map_err(|reason| RegistryError::InvalidModule {
        path: source.to_path_buf(),
        reason,
    })
}

/// Extract the `dependencies` list from an inline `# /// script` header.
///
/// Returns an empty list when the source has no header.
pub fn parse_script_dependencies(source: &str) -> Result<Vec<String>, String> {
    let mut lines = source.lines();
    if !lines.any(|l| l.trim_end() == "# /// script") {
        return Ok(Vec::new());
    }

    let mut body = String::new();
    let mut closed = false;
    for line in lines {
        let line = line.trim_end();
        if line == "# ///" {
            closed = true;
            break;
        }
        let content = line
            .strip_prefix("# ")
            .or_else(|| line.strip_prefix('#'))
            .ok_or_else(|| format!("script header line is not a comment: {line:?}"))?;
        body.push_str(content);
        body.push('\n');
    }
    if !closed {
        return Err("unterminated script header".to_string());
    }

    #[derive(Deserialize)]
    struct Header {
        #[serde(default)]
        dependencies: Vec<String>,
    }
    let header: Header =
        toml::from_str(&body).map_err(|e| format!("invalid script header: {e}"))?;
    Ok(header.dependencies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const HEADER: &str = r#"# /// script
# requires-python = ">=3.11"
# dependencies = [
#   "openpyxl>=3.1",
#   "requests<3",
# ]
# ///

def read(path):
    pass
"#;

    #[test]
    fn header_dependencies_are_parsed() {
        let deps = parse_script_dependencies(HEADER).unwrap();
        assert_eq!(deps, vec!["openpyxl>=3.1", "requests<3"]);
    }

    #[test]
    fn missing_header_means_no_dependencies() {
        assert!(parse_script_dependencies("print('hi')\n").unwrap().is_empty());
    }

    #[test]
    fn unterminated_header_is_rejected() {
        let err = parse_script_dependencies("# /// script\n# dependencies = []\n").unwrap_err();
        assert!(err.contains("unterminated"));
    }

    #[test]
    fn non_comment_line_in_header_is_rejected() {
        let err =
            parse_script_dependencies("# /// script\ndependencies = []\n# ///\n").unwrap_err();
        assert!(err.contains("not a comment"));
    }

    fn module_toml(source: &str) -> ModuleDecl {
        toml::from_str(&format!(
            r#"
            source = "{source}"
            description = "Spreadsheet helpers"
            secret_keys = ["api_key"]

            [functions.read]
            description = "Read a sheet"
            params = [
                {{ name = "path", required = true }},
                {{ name = "sheet", default = "Sheet1" }},
            ]
            "#
        ))
        .unwrap()
    }

    #[test]
    fn declared_module_builds_worker_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("sheets.py")).unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();

        let mut modules = BTreeMap::new();
        modules.insert("sheets".to_string(), module_toml("sheets.py"));
        let declared = DeclaredModules {
            modules,
            base_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let registry = declared.build().unwrap();
        let entry = registry.resolve("sheets", "read").unwrap();
        assert_eq!(entry.signature(), "sheets.read(path, sheet=\"Sheet1\")");
        assert_eq!(entry.secret_keys, vec!["api_key"]);
        match &entry.isolation {
            crate::Isolation::Worker(spec) => {
                assert_eq!(spec.source, dir.path().join("sheets.py"));
                assert_eq!(spec.dependencies, vec!["openpyxl>=3.1", "requests<3"]);
            }
            other => panic!("expected worker isolation, got {other:?}"),
        }
        assert_eq!(
            registry.namespace("sheets").unwrap().description,
            "Spreadsheet helpers"
        );
    }

    #[test]
    fn explicit_dependencies_skip_header_scan() {
        let mut decl = module_toml("/nonexistent/sheets.py");
        decl.dependencies = Some(vec!["pandas".into()]);
        let mut modules = BTreeMap::new();
        modules.insert("sheets".to_string(), decl);
        let registry = DeclaredModules {
            modules,
            ..Default::default()
        }
        .build()
        .unwrap();
        assert_eq!(
            registry.lookup("sheets.read").unwrap().describe()["dependencies"],
            json!(["pandas"])
        );
    }

    #[test]
    fn missing_module_source_fails_discovery() {
        let mut modules = BTreeMap::new();
        modules.insert("sheets".to_string(), module_toml("/nonexistent/sheets.py"));
        let result = DeclaredModules {
            modules,
            ..Default::default()
        }
        .discover();
        assert!(matches!(result, Err(RegistryError::InvalidModule { .. })));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<ModuleDecl, _> = toml::from_str("source = \"a.py\"\nsorce = \"b\"\n");
        assert!(result.is_err());
    }
}
