//! `{{NAME}}` substitution and YAML double-quoted scalar escaping.

use std::fmt::Write as _;

use crate::error::RenderError;

/// A value to substitute for one placeholder.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Value<'a> {
    /// Goes inside a `"..."` scalar in the template; escaped on the way in.
    Quoted(&'a str),
    /// A pre-rendered block of trusted text, indented by `n` spaces so it
    /// sits inside a YAML literal block.
    Block(&'a str, usize),
}

/// Substitute every `{{NAME}}` token in `template` in a single left-to-right
/// pass. Substituted text is never scanned again, so a value that itself
/// contains `{{...}}` comes out literally.
pub(crate) fn render(
    name: &'static str,
    template: &str,
    vars: &[(&str, Value<'_>)],
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(RenderError::Unterminated { template: name })?;
        let key = &after[..end];

        let value = vars
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .ok_or_else(|| RenderError::UnknownPlaceholder {
                template: name,
                name: key.to_string(),
            })?;

        match value {
            Value::Quoted(s) => out.push_str(&escape_yaml_double_quoted(s)),
            Value::Block(s, indent) => push_indented(&mut out, s, indent),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn push_indented(out: &mut String, block: &str, indent: usize) {
    let pad = " ".repeat(indent);
    let mut lines = block.trim_end_matches('\n').split('\n').peekable();
    while let Some(line) = lines.next() {
        if !line.is_empty() {
            out.push_str(&pad);
            out.push_str(line);
        }
        if lines.peek().is_some() {
            out.push('\n');
        }
    }
}

/// Escape `value` for the inside of a YAML double-quoted scalar.
///
/// Besides `\` and `"`, every character YAML does not accept raw in a quoted
/// scalar (and every line break, which would be folded) is written as an
/// escape sequence, so parsing the result gives back exactly `value`.
pub fn escape_yaml_double_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' => out.push_str("\\L"),
            '\u{2029}' => out.push_str("\\P"),
            '\u{FEFF}' | '\u{FFFE}' | '\u{FFFF}' => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
