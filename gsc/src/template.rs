//! Named-placeholder templates.
//!
//! `$name` and `${name}` are placeholders, where `name` matches
//! `[_A-Za-z][_A-Za-z0-9]*`, and `$$` is a literal `$`. Any other `$` is an
//! error. Values are inserted verbatim, without escaping.

use crate::substitutions::SubstitutionSet;
use anyhow::{Result, bail};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder {
        name: String,
        line: usize,
        column: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    name: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse template text. `name` identifies the template in error messages.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self> {
        let name = name.into();
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;
        let mut offset = 0;

        while let Some(start) = rest.find('$') {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 1..];

            let (placeholder, consumed) = if after.starts_with('$') {
                (None, 2)
            } else if let Some(braced) = after.strip_prefix('{') {
                match braced.find('}') {
                    Some(end) if is_identifier(&braced[..end]) => (Some(&braced[..end]), end + 3),
                    _ => invalid_placeholder(&name, text, offset + start)?,
                }
            } else {
                match identifier_len(after) {
                    0 => invalid_placeholder(&name, text, offset + start)?,
                    len => (Some(&after[..len]), len + 1),
                }
            };

            match placeholder {
                Some(placeholder) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let (line, column) = position(text, offset + start);
                    segments.push(Segment::Placeholder {
                        name: placeholder.to_string(),
                        line,
                        column,
                    });
                }
                None => literal.push('$'),
            }

            rest = &rest[start + consumed..];
            offset += start + consumed;
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { name, segments })
    }

    /// Render the template. Every placeholder must have a value.
    pub fn substitute(&self, values: &SubstitutionSet) -> Result<String> {
        let mut rendered = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Placeholder { name, line, column } => match values.get(name) {
                    Some(value) => rendered.push_str(value),
                    None => bail!(
                        "{}: no value for placeholder ${} at line {}, column {}",
                        self.name,
                        name,
                        line,
                        column
                    ),
                },
            }
        }

        Ok(rendered)
    }
}

fn invalid_placeholder<T>(name: &str, text: &str, offset: usize) -> Result<T> {
    let (line, column) = position(text, offset);
    bail!("{name}: invalid placeholder at line {line}, column {column}")
}

fn identifier_len(s: &str) -> usize {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return 0,
    }

    chars
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map_or(s.len(), |(idx, _)| idx)
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && identifier_len(s) == s.len()
}

/// 1-based line and column of a byte offset.
fn position(text: &str, offset: usize) -> (usize, usize) {
    let before = &text[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |idx| idx + 1);
    let column = before[line_start..].chars().count() + 1;

    (line, column)
}
