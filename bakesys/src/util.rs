/*!
Small parsing helpers shared by the document parser and the client command
layer: the logical line reader, `--key=value` flag extraction, and the
parameter substitution used for client commands and tag templates.
*/

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use snafu::ensure;

use crate::error::{Result, TemplateSnafu};

/// Split `document` into logical lines.
///
/// Lines have leading and trailing whitespace stripped. Lines whose first
/// non-whitespace character is `#` are omitted. A line ending with a single
/// backslash continues onto the following line, not including the backslash
/// or line feed. Each returned entry carries the index of the line on which
/// the logical line ended.
pub fn line_reader(document: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut parts: Vec<&str> = Vec::new();
    let mut last_idx = 0;

    for (idx, raw) in document.lines().enumerate() {
        last_idx = idx;
        let line_part = raw.trim_end();
        if line_part.trim_start().starts_with('#') {
            continue;
        }
        if line_part.ends_with('\\') && !line_part.ends_with("\\\\") {
            parts.push(&line_part[..line_part.len() - 1]);
            continue;
        }

        let mut line = parts.concat();
        line.push_str(line_part);
        parts.clear();
        let line = line.trim();
        if !line.is_empty() {
            result.push((idx, line.to_string()));
        }
    }

    let line = parts.concat();
    let line = line.trim();
    if !line.is_empty() {
        result.push((last_idx, line.to_string()));
    }
    result
}

/// Ordered `--key=value` flag set extracted from a command line. Insertion
/// order is preserved; setting an existing key updates it in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandFlags {
    flags: Vec<(String, String)>,
}

impl CommandFlags {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        match self.flags.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.flags.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.flags.iter().position(|(key, _)| key == name)?;
        Some(self.flags.remove(pos).1)
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.flags
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

lazy_static! {
    static ref FLAG: Regex =
        Regex::new(r"^\s*--([A-Za-z][A-Za-z0-9_-]*)=(\S*)").expect("flag regex is valid");
}

/// Strip leading `--key=value` flags off a command line. Returns the
/// remaining line and the extracted flags. A line with no leading flags is
/// returned unchanged.
pub fn extract_command_flags(line: &str) -> (String, CommandFlags) {
    let mut flags = CommandFlags::default();
    let mut rest = line;
    while let Some(captures) = FLAG.captures(rest) {
        flags.set(&captures[1], &captures[2]);
        rest = &rest[captures.get(0).map(|m| m.end()).unwrap_or(0)..];
    }
    if flags.is_empty() {
        (line.to_string(), flags)
    } else {
        (rest.trim_start().to_string(), flags)
    }
}

/// Inverse of [`extract_command_flags`]: prepend the flag set back onto the
/// stripped line, in insertion order.
pub fn format_command_with_flags(line: &str, flags: &CommandFlags) -> String {
    let mut parts: Vec<String> = flags
        .iter()
        .map(|(key, value)| format!("--{key}={value}"))
        .collect();
    if !line.is_empty() {
        parts.push(line.to_string());
    }
    parts.join(" ")
}

/// Substitute `{name}` parameters in `template` from `params`. `{{` and
/// `}}` escape literal braces. Unknown parameters and unbalanced braces are
/// errors; this is intentionally not a full template language.
pub fn format_simple(template: &str, params: &BTreeMap<String, String>) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    result.push('{');
                    continue;
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return TemplateSnafu {
                                message: format!("unclosed parameter in {template:?}"),
                                frames: String::new(),
                            }
                            .fail()
                        }
                    }
                }
                match params.get(&name) {
                    Some(value) => result.push_str(value),
                    None => {
                        return TemplateSnafu {
                            message: format!("unknown parameter {name:?} in {template:?}"),
                            frames: String::new(),
                        }
                        .fail()
                    }
                }
            }
            '}' => {
                ensure!(
                    chars.peek() == Some(&'}'),
                    TemplateSnafu {
                        message: format!("single '}}' in {template:?}"),
                        frames: String::new(),
                    }
                );
                chars.next();
                result.push('}');
            }
            _ => result.push(ch),
        }
    }
    Ok(result)
}

/// Convenience constructor for parameter maps.
pub fn params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
