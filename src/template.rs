//! Rendering simulation input decks from parameterized templates.
//!
//! The driver only depends on the [`Renderer`] trait. [`Template`] is the
//! built-in implementation: plain text with `{{ name }}` placeholders.
//! Rendering never substitutes a default: an unmatched placeholder is an
//! error.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{Error, RenderError, Result};
use crate::parameter::{is_identifier, ParamValue};

/// Placeholder name to value.
pub type Substitutions = BTreeMap<String, ParamValue>;

/// Turns substitutions into the text of a runnable simulation input.
///
/// Implementations must be pure: identical inputs produce byte-identical
/// output.
pub trait Renderer: Send + Sync {
    /// Names of every placeholder the template references.
    fn placeholders(&self) -> &BTreeSet<String>;

    /// Render the template.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::MissingPlaceholder`] if `substitutions` lacks a
    /// referenced name.
    fn render(&self, substitutions: &Substitutions) -> core::result::Result<String, RenderError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder(String),
}

/// A parsed text template with `{{ name }}` placeholders.
///
/// Whitespace inside the braces is ignored; names must be identifiers.
/// A `{{` without a closing `}}` on the same line is malformed.
///
/// # Examples
///
/// ```
/// use picopt::parameter::ParamValue;
/// use picopt::template::{Renderer, Substitutions, Template};
///
/// let template = Template::parse("a0 = {{ a0 }}\nn = {{n}}\n").unwrap();
/// let mut subs = Substitutions::new();
/// subs.insert("a0".into(), ParamValue::Float(2.0));
/// subs.insert("n".into(), ParamValue::Int(64));
/// assert_eq!(template.render(&subs).unwrap(), "a0 = 2.0\nn = 64\n");
/// ```
#[derive(Clone, Debug)]
pub struct Template {
    segments: Vec<Segment>,
    placeholders: BTreeSet<String>,
}

impl Template {
    /// Parse template text.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::Malformed`] with the position of the first
    /// unclosed or invalid placeholder.
    pub fn parse(source: &str) -> core::result::Result<Self, RenderError> {
        let mut segments = Vec::new();
        let mut placeholders = BTreeSet::new();
        let mut text = String::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            text.push_str(&rest[..start]);
            let open = offset + start;
            let after = &rest[start + 2..];
            let line_end = after.find('\n').unwrap_or(after.len());
            let Some(end) = after[..line_end].find("}}") else {
                return Err(malformed(source, open, "unclosed placeholder"));
            };
            let name = after[..end].trim();
            if name.is_empty() {
                return Err(malformed(source, open, "empty placeholder"));
            }
            if !is_identifier(name) {
                return Err(malformed(
                    source,
                    open,
                    &format!("invalid placeholder name '{name}'"),
                ));
            }
            if !text.is_empty() {
                segments.push(Segment::Text(core::mem::take(&mut text)));
            }
            segments.push(Segment::Placeholder(name.to_string()));
            placeholders.insert(name.to_string());

            let consumed = start + 2 + end + 2;
            rest = &rest[consumed..];
            offset += consumed;
        }
        text.push_str(rest);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self {
            segments,
            placeholders,
        })
    }

    /// Read and parse a template file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file cannot be read, or
    /// [`Error::Render`] if it is malformed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| Error::storage(path, e))?;
        Ok(Self::parse(&source)?)
    }
}

impl Renderer for Template {
    fn placeholders(&self) -> &BTreeSet<String> {
        &self.placeholders
    }

    fn render(&self, substitutions: &Substitutions) -> core::result::Result<String, RenderError> {
        // Check everything up front so a failure never yields partial output.
        if let Some(missing) = self
            .placeholders
            .iter()
            .find(|name| !substitutions.contains_key(*name))
        {
            return Err(RenderError::MissingPlaceholder(missing.clone()));
        }

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = substitutions
                        .get(name)
                        .ok_or_else(|| RenderError::MissingPlaceholder(name.clone()))?;
                    out.push_str(&value.to_string());
                }
            }
        }
        Ok(out)
    }
}

fn malformed(source: &str, byte_offset: usize, reason: &str) -> RenderError {
    let before = &source[..byte_offset];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rfind('\n')
        .map_or(before.chars().count(), |nl| before[nl + 1..].chars().count())
        + 1;
    RenderError::Malformed {
        line,
        column,
        reason: reason.to_string(),
    }
}
