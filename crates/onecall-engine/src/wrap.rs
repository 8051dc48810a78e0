//! Dedenting, wrapping and stack-line mapping.

use std::sync::LazyLock;

use regex::Regex;

/// Script name the wrapped command runs under. Stack frames in the command
/// carry it.
pub const SCRIPT_NAME: &str = "[onecall:run]";

/// Lines the wrapper adds before the command body.
pub const BODY_LINE_OFFSET: usize = 1;

const PRELUDE: &str =
    "((__onecall) => { (async () => { try { const __value = await (async () => {";

const EPILOGUE: &str = "return __onecall.none;\n})(); __onecall.finish(__value); } catch (e) { __onecall.fail(e); } })(); })(globalThis.__onecall);";

static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[onecall:run\]:(\d+):\d+").unwrap());

/// Remove the leading whitespace common to every non-blank line.
pub fn dedent(source: &str) -> String {
    let indent = source
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);
    if indent == 0 {
        return source.to_string();
    }
    source
        .split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                line.trim_start_matches([' ', '\t'])
            } else {
                &line[indent..]
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wrap a resolved command in an async function whose outcome is reported
/// through the `__onecall` helpers.
///
/// The body starts on line `1 + BODY_LINE_OFFSET` of the wrapped script.
pub fn wrap(body: &str) -> String {
    format!("{PRELUDE}\n{body}\n{EPILOGUE}")
}

/// Map a line of the wrapped script back to the submitted source.
pub fn source_line(wrapped_line: usize, source_lines: usize) -> Option<usize> {
    let line = wrapped_line.checked_sub(BODY_LINE_OFFSET)?;
    (1..=source_lines.max(1)).contains(&line).then_some(line)
}

/// The submitted-source line of the first stack frame inside the command.
pub fn line_from_stack(stack: &str, source_lines: usize) -> Option<usize> {
    FRAME_RE
        .captures_iter(stack)
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .find_map(|line| source_line(line, source_lines))
}
