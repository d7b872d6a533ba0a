//! # groupcast-hub
//!
//! Group-based publish/subscribe over websocket-style connections.
//!
//! - **Registry**: live connections and their metadata ([`ConnectionRegistry`])
//! - **Groups**: named member sets with O(1) joins and leaves ([`GroupTable`])
//! - **Dispatch**: ordered filter tables, pipeline stages and timed handlers
//!   ([`Router`], [`Pipeline`], [`Dispatcher`])
//! - **Fan-out**: concurrent, timeout-bounded delivery that tolerates
//!   per-member failure ([`Broadcaster`])
//! - **Consumers**: path pattern, group template, lifecycle and routes mounted
//!   on the [`Hub`]
//!
//! The transport layer owns sockets. It calls [`Hub::on_connect`],
//! [`Hub::on_message`] and [`Hub::on_disconnect`], and supplies a
//! [`Transport`] the hub sends through.

#![deny(unsafe_code)]

pub mod broadcast;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod filter;
pub mod groups;
pub mod hub;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod template;
pub mod transport;

pub use broadcast::Broadcaster;
pub use consumer::{Consumer, ConsumerBuilder, GroupRelay, Lifecycle, NoopLifecycle, RoomRoutes};
pub use context::{HandlerContext, Services};
pub use dispatcher::{ConnectOutcome, Dispatcher};
pub use errors::{DeliveryFailure, HandlerError, HubError, Rejection};
pub use filter::{Filter, Pattern, Predicate};
pub use groups::GroupTable;
pub use hub::{Hub, HubBuilder};
pub use pipeline::{Permissions, Phase, Pipeline, RequireSession, RequireUser, Stage};
pub use registry::{Connection, ConnectionInfo, ConnectionRecord, ConnectionRegistry, ConnectionState};
pub use router::{Dispatch, DropReason, Handler, Route, Router, RouterBuilder, handler_fn};
pub use template::GroupNameTemplate;
pub use transport::{ChannelTransport, Transport};
