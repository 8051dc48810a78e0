//! The built-in `meta` namespace.
//!
//! Lets agent code discover what it can call without a separate endpoint:
//!
//! - `meta.namespaces()` lists namespaces with descriptions and sizes
//! - `meta.functions(namespace)` lists a namespace's signatures
//! - `meta.describe(name)` returns the full schema of one function

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::{
    CallContext, CallError, Capability, ParamSpec, Registry, RegistryEntry, WeakRegistry,
};

/// Namespace the built-ins are registered under.
pub const META_NAMESPACE: &str = "meta";

/// In-process entries for the `meta` namespace, reading from `registry`.
pub fn meta_entries(registry: WeakRegistry) -> Vec<RegistryEntry> {
    vec![
        RegistryEntry::in_process(
            META_NAMESPACE,
            "namespaces",
            Arc::new(Meta {
                registry: registry.clone(),
                op: MetaOp::Namespaces,
            }),
        )
        .with_description("List every namespace"),
        RegistryEntry::in_process(
            META_NAMESPACE,
            "functions",
            Arc::new(Meta {
                registry: registry.clone(),
                op: MetaOp::Functions,
            }),
        )
        .with_description("List the functions of a namespace")
        .with_param(ParamSpec::required("namespace")),
        RegistryEntry::in_process(
            META_NAMESPACE,
            "describe",
            Arc::new(Meta {
                registry,
                op: MetaOp::Describe,
            }),
        )
        .with_description("Describe one function by qualified name")
        .with_param(ParamSpec::required("name")),
    ]
}

#[derive(Clone, Copy)]
enum MetaOp {
    Namespaces,
    Functions,
    Describe,
}

struct Meta {
    registry: WeakRegistry,
    op: MetaOp,
}

impl Meta {
    fn qualified(&self) -> &'static str {
        match self.op {
            MetaOp::Namespaces => "meta.namespaces",
            MetaOp::Functions => "meta.functions",
            MetaOp::Describe => "meta.describe",
        }
    }

    fn failed(&self, message: impl Into<String>) -> CallError {
        CallError::Failed {
            function: self.qualified().to_string(),
            message: message.into(),
        }
    }

    fn string_arg<'a>(&self, args: &'a Map<String, Value>, name: &str) -> Result<&'a str, CallError> {
        args.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| self.failed(format!("'{name}' must be a string")))
    }

    fn run(&self, registry: &Registry, args: &Map<String, Value>) -> Result<Value, CallError> {
        match self.op {
            MetaOp::Namespaces => Ok(Value::Array(
                registry
                    .namespaces()
                    .map(|ns| {
                        json!({
                            "name": ns.name,
                            "description": ns.description,
                            "functions": ns.functions.len(),
                        })
                    })
                    .collect(),
            )),
            MetaOp::Functions => {
                let namespace = self.string_arg(args, "namespace")?;
                let ns = registry
                    .namespace(namespace)
                    .map_err(|e| self.failed(e.to_string()))?;
                Ok(Value::Array(
                    ns.functions
                        .values()
                        .map(|f| {
                            json!({
                                "name": f.name,
                                "signature": f.signature(),
                                "description": f.description,
                            })
                        })
                        .collect(),
                ))
            }
            MetaOp::Describe => {
                let name = self.string_arg(args, "name")?;
                let entry = registry.lookup(name).map_err(|e| self.failed(e.to_string()))?;
                Ok(entry.describe())
            }
        }
    }
}

#[async_trait::async_trait]
impl Capability for Meta {
    async fn call(&self, args: Map<String, Value>, ctx: &CallContext) -> Result<Value, CallError> {
        // A command sees the table it resolved against, even mid-reload
        if let Some(snapshot) = &ctx.registry {
            return self.run(snapshot, &args);
        }
        let registry = self
            .registry
            .current()
            .ok_or_else(|| self.failed("registry is no longer available"))?;
        self.run(&registry, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{capability_fn, LiveRegistry, RegistryError};

    fn live() -> LiveRegistry {
        let live = LiveRegistry::new(Registry::new());
        let meta = meta_entries(live.downgrade());
        live.with_source(Arc::new(move || -> Result<Registry, RegistryError> {
            Registry::builder()
                .extend(meta.clone())
                .add(
                    RegistryEntry::in_process(
                        "web",
                        "search",
                        capability_fn(|_a, _c| async { Ok(Value::Null) }),
                    )
                    .with_param(ParamSpec::required("query")),
                )
                .describe_namespace("web", "Web access")
                .build()
        }))
        .unwrap()
    }

    async fn call(live: &LiveRegistry, name: &str, args: Value) -> Result<Value, CallError> {
        let registry = live.current();
        let entry = registry.lookup(name).unwrap();
        let args = entry.bind(args.as_object().cloned().unwrap_or_default())?;
        match &entry.isolation {
            crate::Isolation::InProcess(cap) => cap.call(args, &CallContext::default()).await,
            crate::Isolation::Worker(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn namespaces_lists_meta_and_registered() {
        let live = live();
        let out = call(&live, "meta.namespaces", json!({})).await.unwrap();
        let names: Vec<&str> = out
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["meta", "web"]);
    }

    #[tokio::test]
    async fn command_snapshot_wins_over_the_live_table() {
        let live = live();
        let snapshot = Arc::new(
            Registry::builder()
                .extend(meta_entries(live.downgrade()))
                .build()
                .unwrap(),
        );
        let entry = snapshot.lookup("meta.namespaces").unwrap();
        let crate::Isolation::InProcess(cap) = &entry.isolation else {
            unreachable!()
        };
        let ctx = CallContext::default().with_registry(snapshot.clone());
        let out = cap.call(Map::new(), &ctx).await.unwrap();
        assert_eq!(out.as_array().unwrap().len(), 1);
        assert_eq!(out[0]["name"], "meta");
    }

    #[tokio::test]
    async fn functions_returns_signatures() {
        let live = live();
        let out = call(&live, "meta.functions", json!({"namespace": "web"}))
            .await
            .unwrap();
        assert_eq!(out[0]["signature"], "web.search(query)");
    }

    #[tokio::test]
    async fn functions_unknown_namespace_lists_alternatives() {
        let live = live();
        let err = call(&live, "meta.functions", json!({"namespace": "nope"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("available namespaces: meta, web"));
    }

    #[tokio::test]
    async fn describe_returns_schema() {
        let live = live();
        let out = call(&live, "meta.describe", json!({"name": "web.search"}))
            .await
            .unwrap();
        assert_eq!(out["isolation"], "in_process");
        assert_eq!(out["params"][0]["name"], "query");
    }
}
