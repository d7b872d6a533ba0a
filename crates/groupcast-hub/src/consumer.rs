//! Consumers: the unit mounted on the hub.
//!
//! A consumer bundles a path pattern, an optional group name template, lifecycle
//! hooks, a pipeline and a route table. The hub offers each new connection to
//! its consumers in mount order and the first whose path pattern matches owns
//! the connection for its whole life.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use groupcast_core::{Message, Params};
use tracing::debug;

use crate::context::HandlerContext;
use crate::errors::{HandlerError, HubError, Rejection};
use crate::filter::{Filter, Pattern};
use crate::pipeline::{Pipeline, Stage};
use crate::router::{Handler, Router, RouterBuilder};
use crate::template::GroupNameTemplate;

/// Connect and disconnect hooks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Called after connect stages pass and before the connection is
    /// registered. Returning `Err` refuses the connection.
    async fn on_connect(&self, _ctx: &HandlerContext) -> Result<(), Rejection> {
        Ok(())
    }

    /// Called exactly once when an open connection goes away, before its
    /// group memberships are cleared.
    async fn on_disconnect(&self, _ctx: &HandlerContext) {}
}

/// Lifecycle with no behaviour.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLifecycle;

impl Lifecycle for NoopLifecycle {}

/// A mounted consumer.
pub struct Consumer {
    name: String,
    path: Pattern,
    group: Option<GroupNameTemplate>,
    lifecycle: Arc<dyn Lifecycle>,
    router: Router,
    pipeline: Pipeline,
}

impl Consumer {
    /// Start building a consumer named `name`.
    pub fn builder(name: impl Into<String>) -> ConsumerBuilder {
        ConsumerBuilder {
            name: name.into(),
            path: None,
            group: None,
            lifecycle: Arc::new(NoopLifecycle),
            router: Router::default(),
            pipeline: Pipeline::new(),
        }
    }

    /// Consumer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a connection path, returning its captures.
    pub fn match_path(&self, path: &str) -> Option<Params> {
        self.path.matches(path)
    }

    /// Resolve this consumer's group for the given path captures.
    pub fn resolve_group(&self, params: &Params) -> Result<Option<String>, HubError> {
        self.group.as_ref().map(|t| t.resolve(params)).transpose()
    }

    /// The group template, if any.
    pub fn group_template(&self) -> Option<&GroupNameTemplate> {
        self.group.as_ref()
    }

    /// Lifecycle hooks.
    pub fn lifecycle(&self) -> &Arc<dyn Lifecycle> {
        &self.lifecycle
    }

    /// Route table.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Stages.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("group", &self.group.as_ref().map(GroupNameTemplate::as_str))
            .field("router", &self.router)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Consumer`].
pub struct ConsumerBuilder {
    name: String,
    path: Option<Pattern>,
    group: Option<String>,
    lifecycle: Arc<dyn Lifecycle>,
    router: Router,
    pipeline: Pipeline,
}

impl ConsumerBuilder {
    /// Only accept connections whose path matches. Defaults to every path.
    #[must_use]
    pub fn path(mut self, pattern: impl Into<Pattern>) -> Self {
        self.path = Some(pattern.into());
        self
    }

    /// Join every accepted connection to the group named by `template`.
    #[must_use]
    pub fn group(mut self, template: impl Into<String>) -> Self {
        self.group = Some(template.into());
        self
    }

    /// Connect and disconnect hooks.
    #[must_use]
    pub fn lifecycle(mut self, lifecycle: impl Lifecycle + 'static) -> Self {
        self.lifecycle = Arc::new(lifecycle);
        self
    }

    /// Route table for inbound messages.
    #[must_use]
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Append a pipeline stage.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.pipeline.push(Arc::new(stage));
        self
    }

    /// Validate and finish.
    ///
    /// Fails if the group template is malformed or names a parameter the path
    /// pattern never captures.
    pub fn build(self) -> Result<Consumer, HubError> {
        let path = match self.path {
            Some(p) => p,
            None => Pattern::regex("")?,
        };
        let group = match self.group {
            Some(source) => {
                let template = GroupNameTemplate::parse(&source)?;
                template.validate_against(path.capture_names())?;
                Some(template)
            }
            None => None,
        };
        debug!(consumer = %self.name, routes = self.router.routes().len(), stages = self.pipeline.len(), "consumer built");
        Ok(Consumer {
            name: self.name,
            path,
            group,
            lifecycle: self.lifecycle,
            router: self.router,
            pipeline: self.pipeline,
        })
    }
}

// ── Ready-made handlers ─────────────────────────────────────────────────────

/// Rebroadcasts every message it handles to the connection's consumer group.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupRelay {
    skip_sender: bool,
}

impl GroupRelay {
    /// Relay to every member, the sender included.
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay to every member except the sender.
    pub fn skip_sender() -> Self {
        Self { skip_sender: true }
    }
}

#[async_trait]
impl Handler for GroupRelay {
    async fn handle(&self, ctx: HandlerContext, message: Message) -> Result<(), HandlerError> {
        let Some(group) = ctx.group() else {
            return Err(HandlerError::Other(format!(
                "connection '{}' has no consumer group to relay to",
                ctx.connection_id()
            )));
        };
        let payload = bytes::Bytes::from(message.to_json_bytes());
        let delivered = if self.skip_sender {
            ctx.broadcaster()
                .broadcast_except(group, payload, ctx.connection_id())
                .await
        } else {
            ctx.broadcaster().broadcast(group, payload).await
        };
        debug!(group, delivered, "relayed message");
        Ok(())
    }
}

/// Default template for room groups.
pub const DEFAULT_ROOM_TEMPLATE: &str = "room_{room}";

/// `join`, `leave` and `send` commands over named rooms.
///
/// Each command carries a `room` field; the room's group name is the
/// template resolved with that capture. `send` relays the `message` field to
/// the room, but only if the sender is a member.
#[derive(Clone, Debug)]
pub struct RoomRoutes {
    template: Arc<GroupNameTemplate>,
}

impl RoomRoutes {
    /// Room routes using `template` (which may only reference `{room}`).
    pub fn new(template: &str) -> Result<Self, HubError> {
        let template = GroupNameTemplate::parse(template)?;
        template.validate_against(["room"])?;
        Ok(Self {
            template: Arc::new(template),
        })
    }

    /// Room routes with the default `room_{room}` template.
    pub fn with_default_template() -> Result<Self, HubError> {
        Self::new(DEFAULT_ROOM_TEMPLATE)
    }

    /// Append the three room routes to `builder`.
    pub fn install(&self, builder: RouterBuilder) -> Result<RouterBuilder, HubError> {
        let filter = |command: &str| -> Result<Filter, HubError> {
            Ok(Filter::new()
                .command(command)
                .field("room", Pattern::regex(r"(?P<room>\w+)")?))
        };
        Ok(builder
            .route("join", filter("join")?, RoomCommand::new(RoomOp::Join, &self.template))
            .route("leave", filter("leave")?, RoomCommand::new(RoomOp::Leave, &self.template))
            .route("send", filter("send")?, RoomCommand::new(RoomOp::Send, &self.template)))
    }
}

#[derive(Clone, Copy, Debug)]
enum RoomOp {
    Join,
    Leave,
    Send,
}

struct RoomCommand {
    op: RoomOp,
    template: Arc<GroupNameTemplate>,
}

impl RoomCommand {
    fn new(op: RoomOp, template: &Arc<GroupNameTemplate>) -> Self {
        Self {
            op,
            template: Arc::clone(template),
        }
    }
}

#[async_trait]
impl Handler for RoomCommand {
    async fn handle(&self, ctx: HandlerContext, message: Message) -> Result<(), HandlerError> {
        let group = self.template.resolve(ctx.params())?;
        match self.op {
            RoomOp::Join => {
                let _ = ctx.join(&group)?;
            }
            RoomOp::Leave => {
                let _ = ctx.leave(&group);
            }
            RoomOp::Send => {
                if !ctx.is_member(&group) {
                    debug!(conn_id = %ctx.connection_id(), group, "send to room without membership, ignoring");
                    return Ok(());
                }
                let Some(body) = message.get("message") else {
                    return Err(HandlerError::BadRequest("'message' field is required".into()));
                };
                let _ = ctx.broadcast_json(&group, body).await?;
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
