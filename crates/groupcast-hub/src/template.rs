//! Group name templates such as `room_{id}`.
//!
//! `{name}` is replaced by the captured parameter `name`; `{{` and `}}` are
//! literal braces. Templates are parsed once at build time and checked against
//! the capture names their route can produce, so a typo fails startup instead
//! of the first connect.

use std::collections::BTreeSet;
use std::fmt;

use groupcast_core::Params;

use crate::errors::HubError;
use crate::groups::validate_group_name;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed group name template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupNameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl GroupNameTemplate {
    /// Parse `template`. Unbalanced braces and empty or non-identifier
    /// placeholders are rejected.
    pub fn parse(template: &str) -> Result<Self, HubError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    let _ = chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    let _ = chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => {
                                return Err(HubError::malformed_template(template, "unbalanced '{'"));
                            }
                            Some(ch) => name.push(ch),
                        }
                    }
                    if !is_identifier(&name) {
                        return Err(HubError::malformed_template(
                            template,
                            format!("'{{{name}}}' is not a valid placeholder"),
                        ));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Param(name));
                }
                '}' => {
                    return Err(HubError::malformed_template(template, "unbalanced '}'"));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_owned(),
            segments,
        })
    }

    /// The template as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names of every placeholder.
    pub fn required_params(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Param(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Fail if any placeholder is not among `available` capture names.
    pub fn validate_against<'a>(
        &self,
        available: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), HubError> {
        let available: BTreeSet<&str> = available.into_iter().collect();
        match self
            .required_params()
            .into_iter()
            .find(|name| !available.contains(name))
        {
            Some(missing) => Err(HubError::malformed_template(
                &self.source,
                format!("parameter '{missing}' is never captured"),
            )),
            None => Ok(()),
        }
    }

    /// Substitute `params` and validate the resulting group name.
    pub fn resolve(&self, params: &Params) -> Result<String, HubError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Param(name) => match params.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(HubError::malformed_template(
                            &self.source,
                            format!("parameter '{name}' was not captured"),
                        ));
                    }
                },
            }
        }
        validate_group_name(&out)?;
        Ok(out)
    }
}

impl fmt::Display for GroupNameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
