//! Markdown fence stripping.

use crate::error::EngineError;

/// Remove one outer layer of markdown fencing.
///
/// Accepts a fenced block (```` ```js ````, ```` ``` ````) or inline
/// single-backtick wrapping. Fences inside the code are left alone and
/// unfenced input is returned unchanged.
///
/// The `!` command prefix is not supported and is rejected as a syntax
/// error.
pub fn strip_fences(input: &str) -> Result<String, EngineError> {
    let trimmed = input.trim();
    let code = if let Some(inner) = fenced_block(trimmed) {
        inner.to_string()
    } else if let Some(inner) = inline_code(trimmed) {
        inner.to_string()
    } else {
        input.to_string()
    };

    if code.trim_start().starts_with('!') {
        return Err(EngineError::Syntax {
            line: 1,
            message: "the '!' command prefix is not supported; submit plain JavaScript".into(),
        });
    }
    Ok(code)
}

fn fenced_block(text: &str) -> Option<&str> {
    let body = text.strip_prefix("```")?.strip_suffix("```")?;
    match body.split_once('\n') {
        // The first line is the language tag, possibly empty
        Some((tag, rest)) if is_language_tag(tag) => Some(rest.trim_end_matches(['\n', '\r'])),
        Some(_) => Some(body.trim_matches(['\n', '\r'])),
        None => Some(body.trim()),
    }
}

fn is_language_tag(tag: &str) -> bool {
    tag.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'))
}

fn inline_code(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('`')?.strip_suffix('`')?;
    if inner.is_empty() || inner.contains('`') {
        return None;
    }
    Some(inner)
}
