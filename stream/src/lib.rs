//! # wirerpc-stream
//!
//! The engines of [`wirerpc`](https://docs.rs/wirerpc): packet codec, server, client and the
//! filter chain.
//!
//! Both engines are generic over a [Transport](wirerpc_core::io::Transport) and a
//! [WireFormat](proto::WireFormat), so one engine serves the simple and the checksum-guarded
//! protocol over TCP or Unix sockets.
//!
//! ## Components
//!
//! - [`wirerpc-core`](https://docs.rs/wirerpc-core): errors, config, I/O traits.
//! - [`wirerpc-tcp`](https://docs.rs/wirerpc-tcp): A TCP and Unix socket transport.

#[macro_use]
extern crate captains_log;

pub mod client;
pub mod proto;
pub mod server;
pub mod throttler;
pub use wirerpc_core::error;
pub use wirerpc_core::{ClientConfig, ServerConfig, SocketOptions};
