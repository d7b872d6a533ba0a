//! Ordered route table and timed handler dispatch.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use groupcast_core::Message;
use metrics::histogram;
use tracing::{debug, error, warn};

use crate::context::HandlerContext;
use crate::errors::{HandlerError, Rejection};
use crate::filter::Filter;
use crate::metrics::HUB_HANDLER_DURATION_SECONDS;

/// Name reported for messages handled by the default handler.
pub const DEFAULT_ROUTE: &str = "default";

/// Trait implemented by every message handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle `message`. Route captures are available through `ctx.param`.
    async fn handle(&self, ctx: HandlerContext, message: Message) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, message: Message) -> Result<(), HandlerError> {
        (self.0)(ctx, message).await
    }
}

/// A named filter/handler pair.
#[derive(Clone)]
pub struct Route {
    name: String,
    filter: Filter,
    handler: Arc<dyn Handler>,
}

impl Route {
    /// Route name, used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The route's filter.
    pub fn filter(&self) -> &Filter {
        &self.filter
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Why a message was not handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The connection is not registered.
    UnknownConnection,
    /// The connection is not `Open`.
    NotOpen,
    /// The payload is not a UTF-8 JSON object.
    Malformed,
    /// A receive-phase stage rejected the message.
    Rejected(Rejection),
    /// No route matched and there is no default handler.
    NoMatchingFilter,
}

impl DropReason {
    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::UnknownConnection => "unknown_connection",
            Self::NotOpen => "not_open",
            Self::Malformed => "malformed",
            Self::Rejected(_) => "rejected",
            Self::NoMatchingFilter => "no_matching_filter",
        }
    }
}

/// Outcome of dispatching one inbound message.
#[derive(Debug)]
pub enum Dispatch {
    /// A handler ran to completion.
    Handled {
        /// Name of the route that handled it.
        route: String,
    },
    /// The message was dropped before any handler ran.
    Dropped(DropReason),
    /// The handler failed or timed out. The connection stays open.
    Failed {
        /// Name of the route whose handler failed.
        route: String,
        /// What went wrong.
        error: HandlerError,
    },
}

impl Dispatch {
    /// Whether a handler ran successfully.
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled { .. })
    }
}

/// Immutable, ordered route table. First match wins.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
    default: Option<Arc<dyn Handler>>,
}

impl Router {
    /// Start building a router.
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Routes in declaration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Whether a default handler is set.
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Names of all routes (sorted).
    pub fn route_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.iter().map(Route::name).collect();
        names.sort_unstable();
        names
    }

    /// Find the handler for `message` and run it, bounded by `timeout`.
    ///
    /// Route captures are layered over the parameters already in `ctx`.
    pub async fn dispatch(&self, ctx: HandlerContext, message: Message, timeout: Duration) -> Dispatch {
        let matched = self.routes.iter().find_map(|route| {
            route
                .filter
                .matches(&ctx, &message)
                .map(|captures| (route.name.as_str(), Arc::clone(&route.handler), captures))
        });

        let (route, handler, ctx) = match matched {
            Some((name, handler, captures)) => (name, handler, ctx.with_params(captures)),
            None => match &self.default {
                Some(handler) => (DEFAULT_ROUTE, Arc::clone(handler), ctx),
                None => {
                    debug!(conn_id = %ctx.connection_id(), command = ?message.command(), "no matching filter, dropping");
                    return Dispatch::Dropped(DropReason::NoMatchingFilter);
                }
            },
        };

        let start = Instant::now();
        let result = tokio::time::timeout(timeout, handler.handle(ctx, message)).await;
        histogram!(HUB_HANDLER_DURATION_SECONDS, "route" => route.to_owned()).record(start.elapsed().as_secs_f64());

        match result {
            Ok(Ok(())) => Dispatch::Handled {
                route: route.to_owned(),
            },
            Ok(Err(error)) => {
                warn!(route, kind = error.kind(), error = %error, "handler failed");
                Dispatch::Failed {
                    route: route.to_owned(),
                    error,
                }
            }
            Err(_elapsed) => {
                error!(route, "handler timed out after {timeout:?}");
                Dispatch::Failed {
                    route: route.to_owned(),
                    error: HandlerError::TimedOut(timeout),
                }
            }
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes)
            .field("has_default", &self.has_default())
            .finish()
    }
}

/// Builder for [`Router`].
#[derive(Default)]
pub struct RouterBuilder {
    routes: Vec<Route>,
    default: Option<Arc<dyn Handler>>,
}

impl RouterBuilder {
    /// Append a route. Declaration order is match order.
    #[must_use]
    pub fn route(mut self, name: impl Into<String>, filter: Filter, handler: impl Handler + 'static) -> Self {
        self.routes.push(Route {
            name: name.into(),
            filter,
            handler: Arc::new(handler),
        });
        self
    }

    /// Handler for messages no route matches.
    #[must_use]
    pub fn default_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.default = Some(Arc::new(handler));
        self
    }

    /// Finish building.
    pub fn build(self) -> Router {
        Router {
            routes: self.routes,
            default: self.default,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
