//! End-to-end command scenarios through the processor.

mod common;

use std::sync::Arc;

use common::FakeLauncher;
use onecall_engine::{
    CommandProcessor, EngineError, Executor, ExecutorConfig, PoolConfig, ProcessorSettings,
    Snippet, WorkerPool,
};
use onecall_registry::builtins::meta_entries;
use onecall_registry::{
    capability_fn, CallError, LiveRegistry, ParamSpec, Registry, RegistryEntry, WorkerSpec,
};
use serde_json::{json, Value};

struct Harness {
    processor: CommandProcessor,
    launcher: Arc<FakeLauncher>,
}

fn harness(settings: ProcessorSettings) -> Harness {
    let live = LiveRegistry::new(Registry::new());
    let registry = Registry::builder()
        .extend(meta_entries(live.downgrade()))
        .add(
            RegistryEntry::in_process(
                "web",
                "search",
                capability_fn(|args, _ctx| async move {
                    let query = args["query"].as_str().unwrap_or_default().to_string();
                    let limit = args["limit"].as_u64().unwrap_or(0);
                    Ok(json!({"query": query, "limit": limit, "hits": [format!("{query}-1")]}))
                }),
            )
            .with_description("Search the web")
            .with_param(ParamSpec::required("query"))
            .with_param(ParamSpec::optional("limit", json!(10))),
        )
        .add(
            RegistryEntry::in_process(
                "web",
                "fetch",
                capability_fn(|args, _ctx| async move {
                    match args["url"].as_str() {
                        Some(url) if url.starts_with("https://") => Ok(json!(format!("body of {url}"))),
                        _ => Err(CallError::Failed {
                            function: "web.fetch".into(),
                            message: "only https is supported".into(),
                        }),
                    }
                }),
            )
            .with_param(ParamSpec::required("url")),
        )
        .add(
            RegistryEntry::in_process(
                "math",
                "nothing",
                capability_fn(|_args, _ctx| async move { Ok(Value::Null) }),
            ),
        )
        .add(
            RegistryEntry::worker("sheets", "echo", WorkerSpec::new("mods/sheets.py"))
                .with_param(ParamSpec::optional("value", Value::Null)),
        )
        .add(RegistryEntry::worker("sheets", "pid", WorkerSpec::new("mods/sheets.py")))
        .describe_namespace("web", "Web access")
        .build()
        .unwrap();
    live.replace(registry);

    let launcher = Arc::new(FakeLauncher::default());
    let pool = Arc::new(WorkerPool::new(PoolConfig::default(), launcher.clone()));
    Harness {
        processor: CommandProcessor::new(live, pool, Executor::new(ExecutorConfig::default()), settings),
        launcher,
    }
}

fn default_harness() -> Harness {
    harness(ProcessorSettings::default())
}

#[tokio::test]
async fn fenced_inline_and_plain_commands_are_equivalent() {
    let h = default_harness();
    let plain = "const r = web.search(query=\"rust\");\nr.hits[0]";
    let fenced = format!("```javascript\n{plain}\n```");
    let bare_fence = format!("```\n{plain}\n```");
    let inline = "`web.search(query=\"rust\").hits`";

    let expected = h.processor.run_to_string(plain).await.unwrap();
    assert_eq!(expected, "rust-1");
    assert_eq!(h.processor.run_to_string(&fenced).await.unwrap(), expected);
    assert_eq!(h.processor.run_to_string(&bare_fence).await.unwrap(), expected);
    assert_eq!(h.processor.run_to_string(inline).await.unwrap(), r#"["rust-1"]"#);
}

#[tokio::test]
async fn eval_is_rejected_before_anything_runs() {
    let h = default_harness();
    let err = h.processor.run("eval(\"1+1\")").await.unwrap_err();
    assert_eq!(err.code(), "SECURITY_ERROR");
    let json = err.to_structured_error();
    let errors = json["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    let message = errors[0].as_str().unwrap();
    assert!(message.contains("eval"), "{message}");
    assert!(message.contains("line 1"), "{message}");
    assert!(message.contains("dynamic code evaluation"), "{message}");
}

#[tokio::test]
async fn unknown_namespace_lists_every_namespace() {
    let h = default_harness();
    let err = h.processor.run("unknown_ns.fn()").await.unwrap_err();
    assert_eq!(err.code(), "RESOLUTION_ERROR");
    let message = err.to_string();
    for ns in ["math", "meta", "sheets", "web"] {
        assert!(message.contains(ns), "{message}");
    }
}

#[tokio::test]
async fn unknown_function_suggests_the_closest_match() {
    let h = default_harness();
    let err = h.processor.run("web.serch(query=\"x\")").await.unwrap_err();
    let json = err.to_structured_error();
    assert_eq!(json["alternatives"], json!(["fetch", "search"]));
    assert_eq!(json["suggested_fix"], "Did you mean 'web.search'?");
}

#[tokio::test]
async fn inline_alias_call_runs() {
    let mut settings = ProcessorSettings::default();
    settings.aliases.insert("search".into(), "web.search".into());
    let h = harness(settings);

    let out = h.processor.run("`search(query=\"x\")`").await.unwrap();
    let rendered = out.to_string();
    let value: Value = serde_json::from_str(&rendered).unwrap();
    assert_eq!(value["query"], "x");
    assert_eq!(value["limit"], 10);
}

#[tokio::test]
async fn explicit_null_differs_from_no_value() {
    let h = default_harness();
    assert_eq!(h.processor.run_to_string("return null;").await.unwrap(), "null");
    assert_eq!(h.processor.run_to_string("math.nothing()").await.unwrap(), "null");
    assert_eq!(
        h.processor.run_to_string("const x = 1;").await.unwrap(),
        "(no value produced)"
    );
    assert_eq!(
        h.processor.run_to_string("let y = 2;\ny = 3;").await.unwrap(),
        "(no value produced)"
    );
}

#[tokio::test]
async fn resolve_and_call_round_trip() {
    let h = default_harness();
    let source = "
        const first = web.search(\"a\", 3);
        const second = web.search({query: \"b\"});
        return [first.limit, second.limit, first.hits.concat(second.hits)];
    ";
    let out = h.processor.run_to_string(source).await.unwrap();
    assert_eq!(out, r#"[3,10,["a-1","b-1"]]"#);
}

#[tokio::test]
async fn argument_errors_report_the_signature() {
    let h = default_harness();
    let err = h.processor.run("web.search(limit=1)").await.unwrap_err();
    assert_eq!(err.code(), "ARGUMENT_ERROR");
    let message = err.to_string();
    assert!(message.contains("query"), "{message}");
    assert!(message.contains("web.search(query, limit=10)"), "{message}");
}

#[tokio::test]
async fn runtime_errors_point_at_the_submitted_line() {
    let h = default_harness();
    let source = "```js\nconst a = 1;\nconst b = null;\nb.missing.value\n```";
    let err = h.processor.run(source).await.unwrap_err();
    match err {
        EngineError::Runtime { error_type, line, .. } => {
            assert_eq!(error_type, "TypeError");
            assert_eq!(line, Some(3));
        }
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[tokio::test]
async fn capability_failures_surface_with_their_line() {
    let h = default_harness();
    let source = "const ok = web.search(query=\"a\");\nweb.fetch(url=\"http://plain\")";
    let err = h.processor.run(source).await.unwrap_err();
    assert_eq!(err.code(), "CAPABILITY_ERROR");
    assert_eq!(err.line(), Some(2));
    assert!(err.to_string().contains("only https"));
}

#[tokio::test]
async fn meta_namespace_describes_the_registry() {
    let h = default_harness();
    let out = h
        .processor
        .run_to_string("meta.functions(namespace=\"web\").map(f => f.signature)")
        .await
        .unwrap();
    assert_eq!(out, r#"["web.fetch(url)","web.search(query, limit=10)"]"#);
}

#[tokio::test]
async fn in_process_and_worker_calls_mix() {
    let h = default_harness();
    let source = "
        const hits = web.search(query=\"q\").hits;
        const echoed = sheets.echo(value=hits);
        return {echoed};
    ";
    let out = h.processor.run_to_string(source).await.unwrap();
    assert_eq!(out, r#"{"echoed":{"value":["q-1"]}}"#);
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test]
async fn killed_idle_worker_is_respawned_between_commands() {
    let h = default_harness();
    let first = h.processor.run_to_string("sheets.pid()").await.unwrap();
    h.launcher.kill_last();
    let second = h.processor.run_to_string("sheets.pid()").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(h.launcher.launches(), 2);
}

#[tokio::test]
async fn snippets_expand_before_validation() {
    let mut settings = ProcessorSettings::default();
    settings.snippets.insert(
        "top".into(),
        Snippet::new("web.search(query={{ query }}, limit={{ limit }}).limit")
            .with_param(ParamSpec::required("query"))
            .with_param(ParamSpec::optional("limit", json!(5))),
    );
    let h = harness(settings);

    assert_eq!(h.processor.run_to_string("@top(query=\"x\")").await.unwrap(), "5");
    assert_eq!(h.processor.run_to_string("@top(query=\"x\", limit=2)").await.unwrap(), "2");

    let err = h.processor.run("@nope()").await.unwrap_err();
    assert!(err.to_string().ends_with("available snippets: top"), "{err}");
}

#[tokio::test]
async fn registry_reload_applies_to_the_next_command() {
    let h = default_harness();
    assert!(h.processor.run("math.nothing()").await.is_ok());

    h.processor.registry().replace(Registry::new());
    let err = h.processor.run("math.nothing()").await.unwrap_err();
    assert_eq!(err.code(), "RESOLUTION_ERROR");
}

#[tokio::test]
async fn validation_is_idempotent() {
    let h = default_harness();
    let source = "const f = require('fs');\nDeno.openSync('x')";
    let first = h.processor.validate(source);
    let second = h.processor.validate(source);
    assert_eq!(first, second);
    assert!(!first.valid);
    assert_eq!(first.warnings.len(), 1);
}
