//! Alias and snippet expansion.
//!
//! Both run on the command text before validation, so whatever they
//! produce is validated and resolved like hand-written code.

use std::collections::{BTreeMap, HashSet};

use minijinja::Environment;
use onecall_registry::ParamSpec;
use oxc_allocator::Allocator;
use oxc_ast::ast::{Argument, AssignmentOperator, AssignmentTarget, Expression, Statement};
use oxc_span::GetSpan;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::syntax;

/// A named code template invoked as `@name(key=value, ...)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Declared parameters, in order.
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Jinja template producing JavaScript.
    pub body: String,
}

impl Snippet {
    /// A snippet with the given template and no parameters.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Append a declared parameter.
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    fn signature(&self, name: &str) -> String {
        let params: Vec<String> = self.params.iter().map(ParamSpec::render).collect();
        format!("@{name}({})", params.join(", "))
    }
}

/// Rewrite a leading alias to its qualified target.
///
/// Only the first identifier of the command is considered, and only when
/// it is followed by `(` or ends the command. Anything else passes through.
pub fn expand_alias(source: &str, aliases: &BTreeMap<String, String>) -> String {
    let body = source.trim_start();
    let indent = &source[..source.len() - body.len()];
    let ident_len = body
        .char_indices()
        .take_while(|(i, c)| {
            c.is_ascii_alphabetic() || *c == '_' || *c == '$' || (*i > 0 && c.is_ascii_digit())
        })
        .map(|(_, c)| c.len_utf8())
        .sum::<usize>();
    if ident_len == 0 {
        return source.to_string();
    }

    let (ident, rest) = body.split_at(ident_len);
    if !(rest.starts_with('(') || rest.trim().is_empty()) {
        return source.to_string();
    }
    match aliases.get(ident) {
        Some(target) => {
            tracing::debug!(alias = ident, target = %target, "expanded alias");
            format!("{indent}{target}{rest}")
        }
        None => source.to_string(),
    }
}

/// Expand a leading `@name(...)` snippet invocation.
///
/// Commands that do not start with `@` are returned unchanged.
pub fn expand_snippet(
    source: &str,
    snippets: &BTreeMap<String, Snippet>,
) -> Result<String, EngineError> {
    let body = source.trim_start();
    let Some(invocation) = body.strip_prefix('@') else {
        return Ok(source.to_string());
    };

    let name_len = invocation
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(invocation.len());
    let name = &invocation[..name_len];
    if name.is_empty() {
        return Err(EngineError::Syntax {
            line: 1,
            message: "expected a snippet name after '@'".into(),
        });
    }
    let snippet = snippets
        .get(name)
        .ok_or_else(|| EngineError::UnknownSnippet {
            name: name.to_string(),
            known: snippets.keys().cloned().collect(),
        })?;

    let after_name = &invocation[name_len..];
    let (args_src, trailing) = match after_name.strip_prefix('(') {
        Some(open) => {
            let close = closing_paren(open).ok_or_else(|| EngineError::Syntax {
                line: 1,
                message: format!("unterminated argument list for snippet '@{name}'"),
            })?;
            (&open[..close], &open[close + 1..])
        }
        None => ("", after_name),
    };

    let signature = snippet.signature(name);
    let argument_error = |message: String| EngineError::Argument {
        line: Some(1),
        message,
        signature: signature.clone(),
    };

    let explicit = parse_keyword_args(args_src).map_err(&argument_error)?;
    let mut bound: BTreeMap<String, String> = BTreeMap::new();
    for (key, value) in &explicit {
        if !snippet.params.iter().any(|p| &p.name == key) {
            return Err(argument_error(format!(
                "unknown parameter '{key}' for snippet '@{name}'"
            )));
        }
        bound.insert(key.clone(), value.clone());
    }
    for param in &snippet.params {
        if bound.contains_key(&param.name) {
            continue;
        }
        match &param.default {
            _ if param.required => {
                return Err(argument_error(format!(
                    "missing required parameter '{}' for snippet '@{name}'",
                    param.name
                )));
            }
            Some(default) => {
                bound.insert(param.name.clone(), serde_json::to_string(default)?);
            }
            None => {
                bound.insert(param.name.clone(), "undefined".to_string());
            }
        }
    }

    let rendered = Environment::new()
        .render_str(&snippet.body, &bound)
        .map_err(|e| argument_error(format!("snippet '@{name}' failed to render: {e}")))?;
    tracing::debug!(snippet = name, "expanded snippet");

    let trailing = trailing.trim();
    if trailing.is_empty() {
        Ok(rendered)
    } else {
        Ok(format!("{}\n{trailing}", rendered.trim_end()))
    }
}

/// Byte index of the `)` closing an argument list whose `(` was already
/// consumed. Brackets inside strings and templates are skipped.
fn closing_paren(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' if depth == 0 => return Some(i),
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

/// Parse `key=value, ...` into (key, value source) pairs in order.
fn parse_keyword_args(args: &str) -> Result<Vec<(String, String)>, String> {
    if args.trim().is_empty() {
        return Ok(Vec::new());
    }
    let wrapped = format!("__snippet({args})");
    let allocator = Allocator::default();
    let program = syntax::parse(&allocator, &wrapped)
        .map_err(|issue| format!("invalid snippet arguments: {}", issue.message))?;

    let call = match program.body.as_slice() {
        [Statement::ExpressionStatement(stmt)] => match &stmt.expression {
            Expression::CallExpression(call) => call,
            _ => return Err("invalid snippet arguments".into()),
        },
        _ => return Err("invalid snippet arguments".into()),
    };

    let mut seen = HashSet::new();
    let mut pairs = Vec::with_capacity(call.arguments.len());
    for arg in &call.arguments {
        let Argument::AssignmentExpression(assign) = arg else {
            return Err("snippet arguments must be written as key=value".into());
        };
        let AssignmentTarget::AssignmentTargetIdentifier(key) = &assign.left else {
            return Err("snippet arguments must be written as key=value".into());
        };
        if assign.operator != AssignmentOperator::Assign {
            return Err("snippet arguments must be written as key=value".into());
        }
        let key = key.name.to_string();
        if !seen.insert(key.clone()) {
            return Err(format!("duplicate parameter '{key}'"));
        }
        let span = assign.right.span();
        pairs.push((key, wrapped[span.start as usize..span.end as usize].to_string()));
    }
    Ok(pairs)
}
