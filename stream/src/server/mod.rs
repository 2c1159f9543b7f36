//! The server engine.
//!
//! [RpcServer] accepts connections and runs a reader and a writer for each of them. Every decoded
//! request takes a token from the server-wide [Throttler](crate::throttler::Throttler), then runs
//! through the [filter] chain to its [Handler](dispatch::Handler) in a task of its own, so the
//! responses of one connection may go out in any order.

pub mod dispatch;
pub mod filter;

mod server;
pub use server::RpcServer;

pub use dispatch::{Dispatcher, Handler};
pub use filter::{AccessLogFilter, Filter, MetricsFilter, Next, RequestCtx};
pub use wirerpc_core::ServerConfig;
