#![warn(missing_docs)]

//! # onecall-server
//!
//! MCP front end for onecall.
//!
//! Exposes exactly one tool, `run`, which takes a snippet of JavaScript and
//! hands it to the [`CommandProcessor`]. Successful commands return their
//! rendered result as text. Failed commands return a structured JSON error
//! with a stable `code`, a `retryable` flag and, where one exists, a
//! `suggested_fix`.

use std::sync::Arc;

use onecall_engine::{CommandProcessor, EngineError};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars::JsonSchema;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Deserialize;

/// The onecall MCP server handler.
#[derive(Clone)]
pub struct OnecallServer {
    processor: Arc<CommandProcessor>,
    tool_router: ToolRouter<Self>,
}

impl OnecallServer {
    /// Create a server around a shared processor.
    pub fn new(processor: Arc<CommandProcessor>) -> Self {
        Self {
            processor,
            tool_router: Self::tool_router(),
        }
    }

    /// The processor behind the `run` tool.
    pub fn processor(&self) -> &Arc<CommandProcessor> {
        &self.processor
    }
}

/// Input for the `run` tool.
#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(crate = "rmcp::schemars")]
pub struct RunInput {
    /// JavaScript to run. May be wrapped in a markdown code fence or a
    /// single pair of backticks.
    pub code: String,
}

/// Render an engine error as the JSON text returned to the caller.
pub fn render_error(error: &EngineError) -> String {
    let structured = error.to_structured_error();
    serde_json::to_string(&structured).unwrap_or_else(|_| {
        format!(
            r#"{{"error":true,"code":"{}","message":"error serialization failed","retryable":false}}"#,
            error.code()
        )
    })
}

#[tool_router(router = tool_router)]
impl OnecallServer {
    /// Run a command against the function registry.
    #[tool(
        name = "run",
        description = "Run JavaScript against the function registry. Call registered functions as `namespace.function(...)` with positional, keyword (`name=value`) or object arguments; calls at the top level and in async functions are awaited for you. Inside plain callbacks such as `xs.map(x => ...)` they return promises: write `await Promise.all(xs.map(x => ns.fn(x)))`. The value of the last expression (or an explicit `return`) is the result.\n\nStart with `meta.namespaces()` or `meta.functions(namespace=\"...\")` to discover what is available.\n\nNOT a sandbox for arbitrary programs: eval, Function, require, import, process and Deno are rejected before anything runs.\n\nExample: `const hits = web.search(query=\"rust\", limit=3); hits.map(h => h.title)`"
    )]
    pub async fn run(&self, Parameters(input): Parameters<RunInput>) -> Result<String, String> {
        tracing::info!(code_len = input.code.len(), "run: starting");

        match self.processor.run_to_string(&input.code).await {
            Ok(text) => {
                tracing::info!(result_len = text.len(), "run: complete");
                Ok(text)
            }
            Err(e) => {
                tracing::warn!(code = e.code(), error = %e, "run: failed");
                Err(render_error(&e))
            }
        }
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for OnecallServer {
    fn get_info(&self) -> ServerInfo {
        let registry = self.processor.registry().current();
        let stats = format!(
            "{} namespaces, {} functions",
            registry.namespace_names().len(),
            registry.len()
        );

        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(format!(
                "onecall code execution server ({stats}). \
                 Use run() with a `code` parameter containing JavaScript.\n\
                 \n\
                 Call functions as namespace.function(args). Keyword arguments use \
                 `name=value`; a single object argument works too. Results come back \
                 directly, no await required. The last expression is the result.\n\
                 \n\
                 Errors are JSON objects with `code`, `message`, `retryable` and often \
                 `suggested_fix`. WORKER_UNAVAILABLE and TIMEOUT are safe to retry.\n\
                 \n\
                 Available functions:\n{}",
                registry.summary()
            )),
            server_info: Implementation {
                name: "onecall".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onecall_engine::{
        CommandLauncher, Executor, ExecutorConfig, PoolConfig, ProcessorSettings, WorkerPool,
    };
    use onecall_registry::{capability_fn, LiveRegistry, ParamSpec, Registry, RegistryEntry};
    use serde_json::json;

    fn test_server() -> OnecallServer {
        let registry = Registry::builder()
            .add(
                RegistryEntry::in_process(
                    "text",
                    "upper",
                    capability_fn(|args, _ctx| async move {
                        Ok(json!(args["value"].as_str().unwrap_or_default().to_uppercase()))
                    }),
                )
                .with_description("Uppercase a string")
                .with_param(ParamSpec::required("value")),
            )
            .describe_namespace("text", "String helpers")
            .build()
            .unwrap();
        let pool = Arc::new(WorkerPool::new(
            PoolConfig::default(),
            Arc::new(CommandLauncher::default()),
        ));
        let processor = CommandProcessor::new(
            LiveRegistry::new(registry),
            pool,
            Executor::new(ExecutorConfig::default()),
            ProcessorSettings::default(),
        );
        OnecallServer::new(Arc::new(processor))
    }

    #[test]
    fn get_info_returns_correct_metadata() {
        let server = test_server();
        let info = server.get_info();
        assert_eq!(info.server_info.name, "onecall");
        assert_eq!(info.server_info.version, env!("CARGO_PKG_VERSION"));
        let instructions = info.instructions.unwrap();
        assert!(instructions.contains("run()"));
        assert!(instructions.contains("1 namespaces, 1 functions"));
        assert!(instructions.contains("text: String helpers"));
        assert!(instructions.contains("text.upper(value) - Uppercase a string"));
    }

    #[test]
    fn exactly_one_tool_is_exposed() {
        let server = test_server();
        let tools = server.tool_router.list_all();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "run");
    }

    #[tokio::test]
    async fn run_returns_text() {
        let server = test_server();
        let out = server
            .run(Parameters(RunInput {
                code: "text.upper(value=\"hi\")".into(),
            }))
            .await
            .unwrap();
        assert_eq!(out, "HI");
    }

    #[tokio::test]
    async fn run_failure_is_structured_json() {
        let server = test_server();
        let err = server
            .run(Parameters(RunInput {
                code: "text.uper(value=\"HI\")".into(),
            }))
            .await
            .unwrap_err();
        let parsed: serde_json::Value = serde_json::from_str(&err).unwrap();
        assert_eq!(parsed["error"], true);
        assert_eq!(parsed["code"], "RESOLUTION_ERROR");
        assert_eq!(parsed["retryable"], false);
        assert_eq!(parsed["suggested_fix"], "Did you mean 'text.upper'?");
    }

    #[test]
    fn render_error_carries_the_code() {
        let rendered = render_error(&EngineError::HeapLimitExceeded);
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["code"], "LIMIT_EXCEEDED");
    }
}
