//! Pre-execution validator.
//!
//! A gate against careless code, not a containment boundary. The source is
//! parsed once; a syntax error is the only issue that stops the checks
//! early. The security scan matches identifier references and static member
//! chains against glob patterns:
//!
//! - a pattern without a dot (`eval`, `require`) matches bare identifier
//!   references, including the root of a member chain
//! - a pattern with a dot (`Deno.run`, `child_process.*`) matches every
//!   prefix of a static member chain: `a.b` and `a.b.c` for `a.b.c`
//!
//! Allowed patterns exempt names from the default blocked set and from every
//! warned pattern. Blocked patterns configured explicitly always win.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use globset::{Glob, GlobMatcher, GlobSet, GlobSetBuilder};
use oxc_allocator::Allocator;
use oxc_ast::ast::IdentifierReference;
use oxc_span::Span;
use serde::Serialize;

use crate::syntax::{self, Ctx, Visitor, MAX_NESTING_DEPTH};

/// Maximum source size in bytes (64 KiB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Blocked by default, with the category reported in errors.
const DEFAULT_BLOCKED: &[(&str, &str)] = &[
    ("eval", "dynamic code evaluation"),
    ("Function", "dynamic code compilation"),
    ("AsyncFunction", "dynamic code compilation"),
    ("GeneratorFunction", "dynamic code compilation"),
    ("import", "dynamic module import"),
    ("require", "dynamic module import"),
    ("Deno.run", "subprocess spawning"),
    ("Deno.Command", "subprocess spawning"),
    ("Deno.spawn*", "subprocess spawning"),
    ("child_process", "subprocess spawning"),
    ("child_process.*", "subprocess spawning"),
    ("process.binding", "subprocess spawning"),
];

/// Warned by default.
const DEFAULT_WARNED: &[(&str, &str)] = &[
    ("Deno.open", "raw file access"),
    ("Deno.openSync", "raw file access"),
    ("fs.open", "raw file access"),
    ("fs.openSync", "raw file access"),
];

/// Outcome of [`Validator::validate`].
///
/// Any error makes the result invalid. Warnings never affect validity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    /// Whether the source may run.
    pub valid: bool,
    /// Errors, in discovery order.
    pub errors: Vec<String>,
    /// Warnings, in discovery order.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn finish(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    matcher: GlobMatcher,
    category: String,
    dotted: bool,
    explicit: bool,
}

impl Rule {
    fn new(pattern: &str, category: &str, explicit: bool) -> Result<Self, globset::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            matcher: Glob::new(pattern)?.compile_matcher(),
            category: category.to_string(),
            dotted: pattern.contains('.'),
            explicit,
        })
    }

    fn matches(&self, name: &str, dotted: bool) -> bool {
        self.dotted == dotted && self.matcher.is_match(name)
    }
}

/// Blocked, warned and allowed patterns.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    blocked: Vec<Rule>,
    warned: Vec<Rule>,
    allowed: GlobSet,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        // The built-in patterns are valid globs.
        Self::new(&[], &[], &[]).unwrap_or_else(|_| Self {
            blocked: Vec::new(),
            warned: Vec::new(),
            allowed: GlobSet::empty(),
        })
    }
}

impl SecurityPolicy {
    /// The default patterns extended with configured ones.
    pub fn new(
        blocked: &[String],
        warned: &[String],
        allowed: &[String],
    ) -> Result<Self, globset::Error> {
        let mut blocked_rules = DEFAULT_BLOCKED
            .iter()
            .map(|(p, c)| Rule::new(p, c, false))
            .collect::<Result<Vec<_>, _>>()?;
        for pattern in blocked {
            blocked_rules.push(Rule::new(pattern, "configured blocked pattern", true)?);
        }

        let mut warned_rules = DEFAULT_WARNED
            .iter()
            .map(|(p, c)| Rule::new(p, c, false))
            .collect::<Result<Vec<_>, _>>()?;
        for pattern in warned {
            warned_rules.push(Rule::new(pattern, "configured warned pattern", true)?);
        }

        let mut allow = GlobSetBuilder::new();
        for pattern in allowed {
            allow.add(Glob::new(pattern)?);
        }

        Ok(Self {
            blocked: blocked_rules,
            warned: warned_rules,
            allowed: allow.build()?,
        })
    }
}

/// An external linter. The source is written to its stdin and every
/// non-empty line it prints becomes a warning.
#[derive(Debug, Clone)]
pub struct LintCommand {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Give up after this long.
    pub timeout: Duration,
}

/// The configured validator.
#[derive(Debug, Clone)]
pub struct Validator {
    policy: SecurityPolicy,
    max_code_size: usize,
    lint: Option<LintCommand>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(SecurityPolicy::default())
    }
}

impl Validator {
    /// A validator with the given policy and default limits.
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy,
            max_code_size: DEFAULT_MAX_CODE_SIZE,
            lint: None,
        }
    }

    /// Set the maximum source size in bytes.
    pub fn with_max_code_size(mut self, max: usize) -> Self {
        self.max_code_size = max;
        self
    }

    /// The maximum source size in bytes.
    pub fn max_code_size(&self) -> usize {
        self.max_code_size
    }

    /// Run an external linter after the built-in checks.
    pub fn with_lint(mut self, lint: LintCommand) -> Self {
        self.lint = Some(lint);
        self
    }

    /// Validate `source`. With `check_security` unset, only syntax and
    /// structural limits are checked.
    pub fn validate(&self, source: &str, check_security: bool) -> ValidationResult {
        if source.trim().is_empty() {
            return ValidationResult::finish(vec!["code is empty".into()], Vec::new());
        }
        if source.len() > self.max_code_size {
            return ValidationResult::finish(
                vec![format!(
                    "code exceeds maximum size of {} bytes (got {})",
                    self.max_code_size,
                    source.len()
                )],
                Vec::new(),
            );
        }
        let depth = syntax::nesting_depth(source);
        if depth > MAX_NESTING_DEPTH {
            return ValidationResult::finish(
                vec![format!(
                    "nesting depth {depth} exceeds maximum {MAX_NESTING_DEPTH}"
                )],
                Vec::new(),
            );
        }

        let allocator = Allocator::default();
        let program = match syntax::parse(&allocator, source) {
            Ok(program) => program,
            Err(issue) => {
                return ValidationResult::finish(
                    vec![format!("Syntax error at line {}: {}", issue.line, issue.message)],
                    Vec::new(),
                );
            }
        };

        let mut scan = SecurityScan {
            source,
            policy: &self.policy,
            errors: Vec::new(),
            warnings: Vec::new(),
            seen_errors: HashSet::new(),
            seen_warnings: HashSet::new(),
        };
        if check_security {
            let summary = syntax::walk(&program, &mut scan);
            if summary.truncated {
                scan.errors
                    .push("code is nested too deeply to be checked".to_string());
            }
        }
        let SecurityScan {
            errors,
            mut warnings,
            ..
        } = scan;

        if let Some(lint) = &self.lint {
            warnings.extend(run_lint(lint, source));
        }

        ValidationResult::finish(errors, warnings)
    }
}

/// Validate with the default policy and limits.
pub fn validate(source: &str, check_security: bool) -> ValidationResult {
    Validator::default().validate(source, check_security)
}

struct SecurityScan<'s> {
    source: &'s str,
    policy: &'s SecurityPolicy,
    errors: Vec<String>,
    warnings: Vec<String>,
    seen_errors: HashSet<(String, usize)>,
    seen_warnings: HashSet<(String, usize)>,
}

impl SecurityScan<'_> {
    fn check(&mut self, name: &str, dotted: bool, span: Span) {
        let line = syntax::line_of(self.source, span.start as usize);
        let allowed = self.policy.allowed.is_match(name);

        let mut blocked = false;
        for rule in &self.policy.blocked {
            if !rule.matches(name, dotted) || (allowed && !rule.explicit) {
                continue;
            }
            blocked = true;
            if self.seen_errors.insert((rule.pattern.clone(), line)) {
                self.errors.push(format!(
                    "line {line}: '{name}' matches blocked pattern '{}' ({})",
                    rule.pattern, rule.category
                ));
            }
        }
        if blocked || allowed {
            return;
        }
        for rule in &self.policy.warned {
            if rule.matches(name, dotted) && self.seen_warnings.insert((rule.pattern.clone(), line))
            {
                self.warnings.push(format!(
                    "line {line}: '{name}' matches warned pattern '{}' ({})",
                    rule.pattern, rule.category
                ));
            }
        }
    }
}

impl<'a> Visitor<'a> for SecurityScan<'_> {
    fn reference(&mut self, ident: &IdentifierReference<'a>, _ctx: Ctx) {
        self.check(ident.name.as_str(), false, ident.span);
    }

    fn chain(&mut self, segments: &[&'a str], span: Span, _ctx: Ctx) {
        for len in 2..=segments.len() {
            self.check(&segments[..len].join("."), true, span);
        }
    }

    fn dynamic_import(&mut self, span: Span) {
        self.check("import", false, span);
    }

    fn static_import(&mut self, span: Span) {
        self.check("import", false, span);
    }
}

/// Run the linter, turning its output into warnings. Any failure is
/// logged and swallowed.
fn run_lint(lint: &LintCommand, source: &str) -> Vec<String> {
    match try_lint(lint, source) {
        Ok(lines) => lines.into_iter().map(|l| format!("lint: {l}")).collect(),
        Err(e) => {
            tracing::debug!(program = %lint.program, error = %e, "lint skipped");
            Vec::new()
        }
    }
}

fn try_lint(lint: &LintCommand, source: &str) -> std::io::Result<Vec<String>> {
    let mut child = Command::new(&lint.program)
        .args(&lint.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        let source = source.to_string();
        std::thread::spawn(move || {
            let _ = stdin.write_all(source.as_bytes());
        });
    }
    let reader = child.stdout.take().map(|mut stdout| {
        std::thread::spawn(move || {
            let mut out = String::new();
            let _ = stdout.read_to_string(&mut out);
            out
        })
    });

    let deadline = Instant::now() + lint.timeout;
    loop {
        if child.try_wait()?.is_some() {
            break;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("lint timed out after {}ms", lint.timeout.as_millis()),
            ));
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let output = reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}
