//! Middleware stages run before `on_connect` and before routing.
//!
//! A stage takes the context and either hands it on (possibly enriched) or
//! rejects. Stages run in declaration order and the first rejection
//! short-circuits the rest. At connect time a rejection refuses the
//! connection; at receive time it drops the message and the connection stays
//! open.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use groupcast_core::Message;
use tracing::debug;

use crate::context::HandlerContext;
use crate::errors::Rejection;
use crate::filter::Predicate;

/// When a stage runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before `on_connect`. No message is available.
    Connect,
    /// Before each inbound message is routed.
    Receive,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Receive => "receive",
        })
    }
}

/// A pipeline stage.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name, used in logs.
    fn name(&self) -> &str;

    /// Phases this stage takes part in. Defaults to both.
    fn phases(&self) -> &[Phase] {
        &[Phase::Connect, Phase::Receive]
    }

    /// Inspect the context and pass it on or reject.
    ///
    /// `message` is `None` in the connect phase.
    async fn apply(&self, ctx: HandlerContext, message: Option<&Message>) -> Result<HandlerContext, Rejection>;
}

/// Ordered list of stages.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    /// Empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn push(&mut self, stage: Arc<dyn Stage>) {
        self.stages.push(stage);
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage registered for `phase`.
    pub async fn run(
        &self,
        phase: Phase,
        mut ctx: HandlerContext,
        message: Option<&Message>,
    ) -> Result<HandlerContext, Rejection> {
        for stage in self.stages.iter().filter(|s| s.phases().contains(&phase)) {
            match stage.apply(ctx, message).await {
                Ok(next) => ctx = next,
                Err(rejection) => {
                    debug!(stage = stage.name(), %phase, reason = %rejection, "stage rejected");
                    return Err(rejection);
                }
            }
        }
        Ok(ctx)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.name()))
            .finish()
    }
}

// ── Built-in stages ─────────────────────────────────────────────────────────

/// Rejects connections that carry no session.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequireSession;

#[async_trait]
impl Stage for RequireSession {
    fn name(&self) -> &str {
        "require_session"
    }

    async fn apply(&self, ctx: HandlerContext, _message: Option<&Message>) -> Result<HandlerContext, Rejection> {
        if ctx.session().is_some() {
            Ok(ctx)
        } else {
            Err(Rejection::new("session required"))
        }
    }
}

/// Rejects connections without an authenticated user.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequireUser;

#[async_trait]
impl Stage for RequireUser {
    fn name(&self) -> &str {
        "require_user"
    }

    async fn apply(&self, ctx: HandlerContext, _message: Option<&Message>) -> Result<HandlerContext, Rejection> {
        if ctx.user().is_some() {
            Ok(ctx)
        } else {
            Err(Rejection::new("authenticated user required"))
        }
    }
}

/// Receive-phase permission checks. Every predicate must hold.
#[derive(Clone, Debug, Default)]
pub struct Permissions {
    checks: Vec<Predicate>,
}

impl Permissions {
    /// No checks yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a check.
    #[must_use]
    pub fn require(mut self, check: Predicate) -> Self {
        self.checks.push(check);
        self
    }
}

#[async_trait]
impl Stage for Permissions {
    fn name(&self) -> &str {
        "permissions"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Receive]
    }

    async fn apply(&self, ctx: HandlerContext, message: Option<&Message>) -> Result<HandlerContext, Rejection> {
        let Some(message) = message else {
            return Ok(ctx);
        };
        match self.checks.iter().find(|c| !c.check(&ctx, message)) {
            Some(failed) => Err(Rejection::new(format!("permission '{}' denied", failed.name()))),
            None => Ok(ctx),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
