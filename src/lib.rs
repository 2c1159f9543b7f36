//! # wirerpc
//!
//! An asynchronous request/response RPC transport over raw stream sockets.
//!
//! Every message is a [Packet]: a sequence id, a status code, a command id and an opaque body.
//! Two wire formats are offered, [Simple] with a 16-byte head, and [Guarded] with a 24-byte head
//! carrying sentinels, a version byte and a CRC32 checksum over the whole frame.
//!
//! ## Components
//!
//! - [`wirerpc-core`](https://docs.rs/wirerpc-core): errors, config, I/O and transport traits.
//! - [`wirerpc-stream`](https://docs.rs/wirerpc-stream): codec, server and client engines.
//! - [`wirerpc-tcp`](https://docs.rs/wirerpc-tcp): TCP and Unix socket transport.
//!
//! ## Example
//!
//! ```no_compile,ignore
//! use wirerpc::*;
//!
//! let mut server = TcpServer::<Simple>::new(ServerConfig::default());
//! server.register(1, |body: Vec<u8>| async move { (error::code::OK, body) });
//! let addr = server.start("127.0.0.1:0")?;
//!
//! let client = TcpClient::<Simple>::new(ClientConfig::default());
//! let resp = client.call(&addr, 1, b"hello".to_vec()).await?;
//! assert_eq!(resp.body, b"hello");
//! ```

pub use wirerpc_core::{ClientConfig, ServerConfig, SocketOptions, error, io, metrics};
pub use wirerpc_stream::client::{AsyncResult, ClientConn, RpcClient};
pub use wirerpc_stream::proto::{Guarded, Packet, Simple, WireFormat};
pub use wirerpc_stream::server::{
    AccessLogFilter, Dispatcher, Filter, Handler, MetricsFilter, Next, RequestCtx, RpcServer,
};
pub use wirerpc_stream::{client, proto, server, throttler};
pub use wirerpc_tcp::TcpTransport;

/// A server listening on TCP or Unix sockets
pub type TcpServer<W> = RpcServer<TcpTransport, W>;

/// A client dialing TCP or Unix sockets
pub type TcpClient<W> = RpcClient<TcpTransport, W>;
