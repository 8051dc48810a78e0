//! Namespace resolution and call rewriting.
//!
//! A free, lowercase identifier at the root of a member chain names a
//! registry namespace. Every such reference is checked against one registry
//! snapshot before anything runs, and every call to a registered function is
//! rewritten so the runtime receives a single kwargs object:
//!
//! ```text
//! web.search(query="x", limit=5)   ->  (await web.search({query:"x", limit:5}))
//! web.search("x", 5)               ->  (await web.search({"query": "x", "limit": 5}))
//! web.search({query: "x"})         ->  (await web.search({query: "x"}))
//! ```
//!
//! Rewrites are span edits that never add or remove a newline, so a line
//! in the rewritten code is the same line in the submitted code.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use onecall_registry::{is_valid_namespace, Registry, RegistryEntry};
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, AssignmentOperator, AssignmentTarget, CallExpression, ObjectExpression,
    ObjectPropertyKind, Program, PropertyKey, Statement,
};
use oxc_span::{GetSpan, Span};

use crate::error::EngineError;
use crate::syntax::{self, line_of, Ctx, Visitor};

/// Lowercase globals that are never namespaces.
pub const KNOWN_GLOBALS: &[&str] = &[
    "console",
    "undefined",
    "arguments",
    "self",
    "window",
    "crypto",
    "performance",
    "navigator",
    "__onecall",
];

/// A command ready to be wrapped and executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    /// The rewritten source, line-aligned with the input.
    pub code: String,
    /// Source lines of every capability call, by qualified name.
    pub call_lines: BTreeMap<String, Vec<usize>>,
}

impl ResolvedCommand {
    /// The line of the only call site of `qualified`, if there is exactly
    /// one.
    pub fn single_call_line(&self, qualified: &str) -> Option<usize> {
        match self.call_lines.get(qualified).map(Vec::as_slice) {
            Some([line]) => Some(*line),
            _ => None,
        }
    }
}

/// Resolve namespace references in `source` against `registry` and
/// rewrite capability calls.
pub fn resolve(source: &str, registry: &Registry) -> Result<ResolvedCommand, EngineError> {
    let allocator = Allocator::default();
    let program = syntax::parse(&allocator, source).map_err(|issue| EngineError::Syntax {
        line: issue.line,
        message: issue.message,
    })?;

    let mut bindings = Bindings::default();
    syntax::walk(&program, &mut bindings);

    let mut resolver = Resolver {
        source,
        registry,
        bindings: bindings.names,
        edits: Vec::new(),
        call_lines: BTreeMap::new(),
        error: None,
    };
    syntax::walk(&program, &mut resolver);
    if let Some(err) = resolver.error {
        return Err(err);
    }
    resolver.capture_tail(&program);

    Ok(ResolvedCommand {
        code: apply(source, resolver.edits),
        call_lines: resolver.call_lines,
    })
}

#[derive(Default)]
struct Bindings {
    names: HashSet<String>,
}

impl<'a> Visitor<'a> for Bindings {
    fn binding(&mut self, name: &'a str) {
        self.names.insert(name.to_string());
    }
}

#[derive(Debug)]
struct Edit {
    start: u32,
    end: u32,
    text: String,
    depth: usize,
    close: bool,
    seq: usize,
}

impl Edit {
    /// At one position, closing text goes first (innermost first), then
    /// opening text (outermost first).
    fn sort_key(&self) -> (u32, bool, Reverse<usize>, usize, usize) {
        if self.close {
            (self.start, false, Reverse(self.depth), 0, self.seq)
        } else {
            (self.start, true, Reverse(0), self.depth, self.seq)
        }
    }
}

fn apply(source: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(Edit::sort_key);
    let mut out = String::with_capacity(source.len() + edits.len() * 8);
    let mut cursor = 0usize;
    for edit in edits {
        let start = edit.start as usize;
        if start < cursor {
            continue;
        }
        out.push_str(&source[cursor..start]);
        out.push_str(&edit.text);
        cursor = edit.end as usize;
    }
    out.push_str(&source[cursor..]);
    out
}

struct Resolver<'s, 'r> {
    source: &'s str,
    registry: &'r Registry,
    bindings: HashSet<String>,
    edits: Vec<Edit>,
    call_lines: BTreeMap<String, Vec<usize>>,
    error: Option<EngineError>,
}

impl<'r> Resolver<'_, 'r> {
    fn is_namespace_root(&self, root: &str) -> bool {
        is_valid_namespace(root) && !KNOWN_GLOBALS.contains(&root) && !self.bindings.contains(root)
    }

    fn fail(&mut self, err: EngineError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn edit(&mut self, start: u32, end: u32, text: impl Into<String>, depth: usize, close: bool) {
        let seq = self.edits.len();
        self.edits.push(Edit {
            start,
            end,
            text: text.into(),
            depth,
            close,
            seq,
        });
    }

    fn insert(&mut self, at: u32, text: impl Into<String>, depth: usize, close: bool) {
        self.edit(at, at, text, depth, close);
    }

    /// Make the call pass a single kwargs object, checking argument names
    /// against the schema when they are statically known.
    fn rewrite_arguments(
        &mut self,
        call: &CallExpression<'_>,
        entry: &RegistryEntry,
        depth: usize,
    ) -> Result<(), String> {
        let args = call.arguments.as_slice();
        match args {
            [] => return check_names(entry, &[]),
            [Argument::ObjectExpression(obj)] => {
                if let Some(keys) = static_keys(obj) {
                    check_names(entry, &keys)?;
                }
                return Ok(());
            }
            _ => {}
        }

        let mut names = Vec::with_capacity(args.len());
        let mut pending = Vec::with_capacity(args.len());
        let mut positional = 0usize;
        let mut seen_keyword = false;
        for arg in args {
            if let Some((key, gap)) = keyword(arg) {
                seen_keyword = true;
                let newlines: String = self.source[gap.start as usize..gap.end as usize]
                    .chars()
                    .filter(|c| *c == '\n')
                    .collect();
                names.push(key);
                pending.push((gap.start, gap.end, format!(":{newlines}")));
                continue;
            }
            if matches!(arg, Argument::SpreadElement(_)) {
                return Err("spread arguments are not supported; pass keyword arguments".into());
            }
            if seen_keyword {
                return Err("positional argument follows keyword argument".into());
            }
            let Some(param) = entry.params.get(positional) else {
                let given = args.iter().filter(|a| keyword(a).is_none()).count();
                return Err(format!(
                    "too many positional arguments: takes {}, got {given}",
                    entry.params.len()
                ));
            };
            positional += 1;
            names.push(param.name.clone());
            let start = arg.span().start;
            let key = serde_json::to_string(&param.name).map_err(|e| e.to_string())?;
            pending.push((start, start, format!("{key}: ")));
        }
        check_names(entry, &names)?;

        let first = args[0].span().start;
        let last = args[args.len() - 1].span().end;
        self.insert(first, "{", depth, false);
        for (start, end, text) in pending {
            self.edit(start, end, text, depth, false);
        }
        self.insert(last, "}", depth, true);
        Ok(())
    }

    /// Turn the final bare expression into the command's value.
    fn capture_tail(&mut self, program: &Program<'_>) {
        let span = match program.body.last() {
            Some(Statement::ExpressionStatement(stmt)) => stmt.expression.span(),
            Some(_) => return,
            None => match program.directives.last() {
                Some(directive) => directive.expression.span,
                None => return,
            },
        };
        self.insert(span.start, "return __onecall.tail((", 0, false);
        self.insert(span.end, "))", 0, true);
    }
}

impl<'a> Visitor<'a> for Resolver<'_, '_> {
    fn chain(&mut self, segments: &[&'a str], span: Span, _ctx: Ctx) {
        let root = segments[0];
        if !self.is_namespace_root(root) {
            return;
        }
        let result = match segments.get(1) {
            Some(function) => self.registry.resolve(root, function).map(|_| ()),
            None => self.registry.namespace(root).map(|_| ()),
        };
        if let Err(error) = result {
            let line = line_of(self.source, span.start as usize);
            self.fail(EngineError::Resolution { line, error });
        }
    }

    fn call(&mut self, call: &CallExpression<'a>, ctx: Ctx) {
        let Some(chain) = syntax::static_chain(&call.callee) else {
            return;
        };
        let [namespace, function] = chain.as_slice() else {
            return;
        };
        if !self.is_namespace_root(namespace) {
            return;
        }
        // Unknown names are reported when the callee chain is visited
        let registry = self.registry;
        let Ok(entry) = registry.resolve(namespace, function) else {
            return;
        };

        let line = line_of(self.source, call.span.start as usize);
        self.call_lines
            .entry(entry.qualified_name())
            .or_default()
            .push(line);

        if let Err(message) = self.rewrite_arguments(call, entry, ctx.depth) {
            self.fail(EngineError::Argument {
                line: Some(line),
                message,
                signature: entry.signature(),
            });
        }
        if ctx.in_async && !ctx.awaited {
            self.insert(call.span.start, "(await ", ctx.depth, false);
            self.insert(call.span.end, ")", ctx.depth, true);
        }
    }
}

/// `name = value` arguments: the name and the span between the name and
/// the value.
fn keyword(arg: &Argument<'_>) -> Option<(String, Span)> {
    let Argument::AssignmentExpression(assign) = arg else {
        return None;
    };
    if assign.operator != AssignmentOperator::Assign {
        return None;
    }
    let AssignmentTarget::AssignmentTargetIdentifier(ident) = &assign.left else {
        return None;
    };
    let gap = Span::new(ident.span.end, assign.right.span().start);
    Some((ident.name.to_string(), gap))
}

/// Property names of an object literal, when all of them are static.
fn static_keys(obj: &ObjectExpression<'_>) -> Option<Vec<String>> {
    let mut keys: Vec<String> = Vec::with_capacity(obj.properties.len());
    for prop in &obj.properties {
        let ObjectPropertyKind::ObjectProperty(prop) = prop else {
            return None;
        };
        if prop.computed {
            return None;
        }
        let key = match &prop.key {
            PropertyKey::StaticIdentifier(ident) => ident.name.to_string(),
            PropertyKey::StringLiteral(lit) => lit.value.to_string(),
            _ => return None,
        };
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    Some(keys)
}

fn check_names(entry: &RegistryEntry, names: &[String]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(format!("duplicate argument '{name}'"));
        }
        if entry.param(name).is_none() {
            return Err(format!("unknown argument '{name}'"));
        }
    }
    if let Some(missing) = entry
        .params
        .iter()
        .find(|p| p.required && !seen.contains(p.name.as_str()))
    {
        return Err(format!("missing required argument '{}'", missing.name));
    }
    Ok(())
}
