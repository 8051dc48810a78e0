//! The command pipeline behind the single `run` operation.
//!
//! ```text
//! raw text -> strip fences -> alias -> snippet -> dedent
//!          -> validate -> resolve (one registry snapshot) -> execute
//! ```
//!
//! Nothing executes unless validation and resolution both succeed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use oxc_allocator::Allocator;
use onecall_registry::LiveRegistry;

use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::executor::{Executor, Outcome};
use crate::expand::{expand_alias, expand_snippet, Snippet};
use crate::fence::strip_fences;
use crate::pool::WorkerPool;
use crate::resolve::resolve;
use crate::syntax::{self, MAX_NESTING_DEPTH};
use crate::validator::{ValidationResult, Validator};
use crate::wrap::dedent;

/// Hot-swappable processor settings.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Short names rewritten to qualified function names.
    pub aliases: BTreeMap<String, String>,
    /// Snippets invoked as `@name(...)`.
    pub snippets: BTreeMap<String, Snippet>,
    /// The validation gate.
    pub validator: Validator,
    /// Run the security pattern checks.
    pub check_security: bool,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            aliases: BTreeMap::new(),
            snippets: BTreeMap::new(),
            validator: Validator::default(),
            check_security: true,
        }
    }
}

/// Turns submitted text into a result.
///
/// Reentrant: any number of commands may run at once, each against the
/// registry snapshot it captured when it was resolved.
pub struct CommandProcessor {
    settings: ArcSwap<ProcessorSettings>,
    registry: LiveRegistry,
    pool: Arc<WorkerPool>,
    executor: Executor,
}

impl CommandProcessor {
    /// Create a processor.
    pub fn new(
        registry: LiveRegistry,
        pool: Arc<WorkerPool>,
        executor: Executor,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings),
            registry,
            pool,
            executor,
        }
    }

    /// The live registry commands resolve against.
    pub fn registry(&self) -> &LiveRegistry {
        &self.registry
    }

    /// The worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The settings in effect.
    pub fn settings(&self) -> Arc<ProcessorSettings> {
        self.settings.load_full()
    }

    /// Replace aliases, snippets and the validator. Commands already in
    /// flight keep the settings they started with.
    pub fn update_settings(&self, settings: ProcessorSettings) {
        tracing::info!(
            aliases = settings.aliases.len(),
            snippets = settings.snippets.len(),
            "processor settings updated"
        );
        self.settings.store(Arc::new(settings));
    }

    /// Validate a command without running it. Fences, aliases and
    /// snippets are expanded first, as [`run()`](Self::run) would.
    pub fn validate(&self, raw: &str) -> ValidationResult {
        let settings = self.settings();
        match prepare(raw, &settings) {
            Ok(source) => settings.validator.validate(&source, settings.check_security),
            Err(e) => ValidationResult {
                valid: false,
                errors: vec![e.to_string()],
                warnings: Vec::new(),
            },
        }
    }

    /// Run a command and return what it produced.
    #[tracing::instrument(skip_all, fields(code_len = raw.len()))]
    pub async fn run(&self, raw: &str) -> Result<Outcome, EngineError> {
        let started = Instant::now();
        let result = self.run_inner(raw).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(elapsed_ms, "command complete"),
            Err(e) => tracing::warn!(elapsed_ms, code = e.code(), error = %e, "command failed"),
        }
        result
    }

    /// Run a command and render its outcome as response text.
    pub async fn run_to_string(&self, raw: &str) -> Result<String, EngineError> {
        self.run(raw).await.map(|outcome| outcome.to_string())
    }

    async fn run_inner(&self, raw: &str) -> Result<Outcome, EngineError> {
        let settings = self.settings();
        let source = prepare(raw, &settings)?;
        gate(&source, &settings)?;

        let registry = self.registry.current();
        let command = resolve(&source, &registry)?;
        tracing::debug!(
            calls = command.call_lines.values().map(Vec::len).sum::<usize>(),
            "command resolved"
        );

        let dispatcher = Arc::new(Dispatcher::new(registry, self.pool.clone()));
        let source_lines = source.lines().count().max(1);
        self.executor.execute(&command, source_lines, dispatcher).await
    }
}

/// Everything that happens to the text before validation.
fn prepare(raw: &str, settings: &ProcessorSettings) -> Result<String, EngineError> {
    let code = strip_fences(raw)?;
    let code = expand_alias(&code, &settings.aliases);
    let code = expand_snippet(&code, &settings.snippets)?;
    Ok(dedent(&code))
}

fn gate(source: &str, settings: &ProcessorSettings) -> Result<(), EngineError> {
    if source.trim().is_empty() {
        return Err(EngineError::Syntax {
            line: 1,
            message: "code is empty".into(),
        });
    }
    let max = settings.validator.max_code_size();
    if source.len() > max {
        return Err(EngineError::CodeTooLarge {
            max,
            actual: source.len(),
        });
    }
    let depth = syntax::nesting_depth(source);
    if depth > MAX_NESTING_DEPTH {
        return Err(EngineError::NestingTooDeep {
            max: MAX_NESTING_DEPTH,
            actual: depth,
        });
    }

    let report = settings.validator.validate(source, settings.check_security);
    for warning in &report.warnings {
        tracing::warn!(warning = %warning, "validation warning");
    }
    if report.valid {
        return Ok(());
    }

    let allocator = Allocator::default();
    if let Err(issue) = syntax::parse(&allocator, source) {
        return Err(EngineError::Syntax {
            line: issue.line,
            message: issue.message,
        });
    }
    Err(EngineError::Security {
        errors: report.errors,
    })
}
