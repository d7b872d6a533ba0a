//! Declarative message filters.
//!
//! A [`Filter`] combines an optional command pattern, an optional path pattern,
//! any number of field patterns and free-form predicates. All parts must
//! match; named regex groups become handler parameters.

use std::fmt;
use std::sync::Arc;

use groupcast_core::{Message, Params};
use regex::Regex;

use crate::context::HandlerContext;
use crate::errors::HubError;

/// Match rule for a single string value.
#[derive(Clone)]
pub enum Pattern {
    /// The whole value must equal this string.
    Literal(String),
    /// The regex must match at the start of the value. Named groups are
    /// captured.
    Regex(Regex),
}

impl Pattern {
    /// Exact-match pattern.
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    /// Compile a regex pattern anchored at the start of the value.
    pub fn regex(source: &str) -> Result<Self, HubError> {
        Regex::new(&format!("^(?:{source})"))
            .map(Self::Regex)
            .map_err(|source_err| HubError::InvalidPattern {
                pattern: source.to_owned(),
                source: source_err,
            })
    }

    /// Match `value`, returning named captures on success.
    pub fn matches(&self, value: &str) -> Option<Params> {
        match self {
            Self::Literal(expected) => (expected == value).then(Params::new),
            Self::Regex(re) => {
                let caps = re.captures(value)?;
                Some(
                    re.capture_names()
                        .flatten()
                        .filter_map(|name| {
                            caps.name(name)
                                .map(|m| (name.to_owned(), m.as_str().to_owned()))
                        })
                        .collect(),
                )
            }
        }
    }

    /// Names of the groups this pattern can capture.
    pub fn capture_names(&self) -> Vec<&str> {
        match self {
            Self::Literal(_) => Vec::new(),
            Self::Regex(re) => re.capture_names().flatten().collect(),
        }
    }
}

impl From<&str> for Pattern {
    fn from(value: &str) -> Self {
        Self::literal(value)
    }
}

impl From<String> for Pattern {
    fn from(value: String) -> Self {
        Self::Literal(value)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(s) => f.debug_tuple("Literal").field(s).finish(),
            Self::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
        }
    }
}

type PredicateFn = dyn Fn(&HandlerContext, &Message) -> bool + Send + Sync;

/// A named boolean check over the context and message.
#[derive(Clone)]
pub struct Predicate {
    name: String,
    check: Arc<PredicateFn>,
}

impl Predicate {
    /// Wrap a closure.
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&HandlerContext, &Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Predicate name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate the predicate.
    pub fn check(&self, ctx: &HandlerContext, message: &Message) -> bool {
        (self.check)(ctx, message)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.name).finish()
    }
}

/// Route filter. An empty filter matches every message.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    command: Option<Pattern>,
    path: Option<Pattern>,
    fields: Vec<(String, Pattern)>,
    predicates: Vec<Predicate>,
}

impl Filter {
    /// Filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the message command to match `pattern`.
    #[must_use]
    pub fn command(mut self, pattern: impl Into<Pattern>) -> Self {
        self.command = Some(pattern.into());
        self
    }

    /// Require the connection path to match `pattern`.
    #[must_use]
    pub fn path(mut self, pattern: impl Into<Pattern>) -> Self {
        self.path = Some(pattern.into());
        self
    }

    /// Require message field `key` to be present and match `pattern`.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, pattern: impl Into<Pattern>) -> Self {
        self.fields.push((key.into(), pattern.into()));
        self
    }

    /// Require `predicate` to hold.
    #[must_use]
    pub fn predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Match against `message` on the connection in `ctx`.
    ///
    /// Returns the merged captures of every pattern, later patterns winning
    /// on name clashes.
    pub fn matches(&self, ctx: &HandlerContext, message: &Message) -> Option<Params> {
        let mut captures = Params::new();

        if let Some(pattern) = &self.command {
            captures.extend(pattern.matches(message.command()?)?);
        }
        if let Some(pattern) = &self.path {
            captures.extend(pattern.matches(&ctx.connection().path)?);
        }
        for (key, pattern) in &self.fields {
            let value = message.text(key)?;
            captures.extend(pattern.matches(&value)?);
        }
        if self.predicates.iter().all(|p| p.check(ctx, message)) {
            Some(captures)
        } else {
            None
        }
    }

    /// Every capture name the filter can produce.
    pub fn capture_names(&self) -> Vec<&str> {
        self.command
            .iter()
            .chain(self.path.iter())
            .chain(self.fields.iter().map(|(_, p)| p))
            .flat_map(Pattern::capture_names)
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{context, context_for, services};
    use crate::registry::Connection;
    use assert_matches::assert_matches;

    fn msg(json: &str) -> Message {
        Message::parse(json.as_bytes()).unwrap()
    }

    #[test]
    fn literal_requires_exact_value() {
        let p = Pattern::literal("join");
        assert!(p.matches("join").is_some());
        assert!(p.matches("joined").is_none());
        assert!(p.capture_names().is_empty());
    }

    #[test]
    fn regex_is_anchored_at_start_only() {
        let p = Pattern::regex("join").unwrap();
        assert!(p.matches("join").is_some());
        assert!(p.matches("joined").is_some());
        assert!(p.matches("rejoin").is_none());
        let strict = Pattern::regex("^join$").unwrap();
        assert!(strict.matches("joined").is_none());
    }

    #[test]
    fn regex_alternation_stays_anchored() {
        let p = Pattern::regex("a|b").unwrap();
        assert!(p.matches("bx").is_some());
        assert!(p.matches("xb").is_none());
    }

    #[test]
    fn regex_named_captures() {
        let p = Pattern::regex(r"(?P<room>\w+)").unwrap();
        let caps = p.matches("lobby").unwrap();
        assert_eq!(caps.get("room").map(String::as_str), Some("lobby"));
        assert_eq!(p.capture_names(), vec!["room"]);
    }

    #[test]
    fn optional_group_that_did_not_participate_is_absent() {
        let p = Pattern::regex(r"a(?P<tail>b)?").unwrap();
        let caps = p.matches("a").unwrap();
        assert!(!caps.contains_key("tail"));
    }

    #[test]
    fn invalid_regex_is_reported() {
        assert_matches!(
            Pattern::regex("(unclosed"),
            Err(HubError::InvalidPattern { pattern, .. }) if pattern == "(unclosed"
        );
    }

    #[test]
    fn empty_filter_matches_everything() {
        let (svc, _) = services();
        let ctx = context("c1", &svc);
        assert_eq!(Filter::new().matches(&ctx, &msg("{}")), Some(Params::new()));
    }

    #[test]
    fn command_filter_needs_command() {
        let (svc, _) = services();
        let ctx = context("c1", &svc);
        let f = Filter::new().command("join");
        assert!(f.matches(&ctx, &msg(r#"{"command":"join"}"#)).is_some());
        assert!(f.matches(&ctx, &msg(r#"{"room":"5"}"#)).is_none());
    }

    #[test]
    fn join_and_leave_filters_select_by_command() {
        let (svc, _) = services();
        let ctx = context("c1", &svc);
        let room = || Pattern::regex(r"(?P<room>\w+)").unwrap();
        let join = Filter::new().command("join").field("room", room());
        let leave = Filter::new().command("leave").field("room", room());
        let m = msg(r#"{"command":"leave","room":"5"}"#);

        assert!(join.matches(&ctx, &m).is_none());
        let caps = leave.matches(&ctx, &m).unwrap();
        assert_eq!(caps.get("room").map(String::as_str), Some("5"));
    }

    #[test]
    fn numeric_field_matches_as_text() {
        let (svc, _) = services();
        let ctx = context("c1", &svc);
        let f = Filter::new().field("room", Pattern::regex(r"(?P<room>\d+)").unwrap());
        let caps = f.matches(&ctx, &msg(r#"{"room":42}"#)).unwrap();
        assert_eq!(caps.get("room").map(String::as_str), Some("42"));
    }

    #[test]
    fn missing_field_fails() {
        let (svc, _) = services();
        let ctx = context("c1", &svc);
        let f = Filter::new().field("room", Pattern::regex(r"\w+").unwrap());
        assert!(f.matches(&ctx, &msg(r#"{"command":"x"}"#)).is_none());
    }

    #[test]
    fn path_filter_uses_connection_path() {
        let (svc, _) = services();
        let ctx = context_for(Connection::new("c1", "/chat/7/"), &svc);
        let f = Filter::new().path(Pattern::regex(r"/chat/(?P<id>\d+)/").unwrap());
        let caps = f.matches(&ctx, &msg("{}")).unwrap();
        assert_eq!(caps.get("id").map(String::as_str), Some("7"));
        assert!(Filter::new().path("/other/").matches(&ctx, &msg("{}")).is_none());
    }

    #[test]
    fn predicates_must_all_hold() {
        let (svc, _) = services();
        let ctx = context("c1", &svc);
        let has_text = Predicate::new("has_text", |_, m| m.get("text").is_some());
        let never = Predicate::new("never", |_, _| false);

        let f = Filter::new().predicate(has_text.clone());
        assert!(f.matches(&ctx, &msg(r#"{"text":"x"}"#)).is_some());
        assert!(f.matches(&ctx, &msg("{}")).is_none());
        assert!(Filter::new().predicate(has_text).predicate(never).matches(&ctx, &msg(r#"{"text":"x"}"#)).is_none());
    }

    #[test]
    fn capture_names_cover_all_patterns() {
        let f = Filter::new()
            .command(Pattern::regex(r"(?P<verb>\w+)").unwrap())
            .path(Pattern::regex(r"/r/(?P<id>\d+)").unwrap())
            .field("room", Pattern::regex(r"(?P<room>\w+)").unwrap());
        let mut names = f.capture_names();
        names.sort_unstable();
        assert_eq!(names, vec!["id", "room", "verb"]);
    }
}
