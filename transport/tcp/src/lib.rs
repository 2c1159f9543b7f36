//! # wirerpc-tcp
//!
//! This crate provides the TCP transport for [`wirerpc-stream`](https://docs.rs/wirerpc-stream).
//! It is used for both client and server communication over TCP, and over Unix sockets when the
//! address is a path starting with `/`.

pub mod net;
pub use net::{UnifyAddr, UnifyListener, UnifyReader, UnifyStream, UnifyWriter};

use std::io;
use tokio::net::{TcpStream, UnixStream};
use wirerpc_core::SocketOptions;
use wirerpc_core::io::{Transport, io_with_timeout};

/// Dials and listens on TCP or Unix sockets, chosen by the address
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Conn = UnifyStream;
    type Listener = UnifyListener;

    async fn connect(addr: &str, opts: &SocketOptions) -> io::Result<UnifyStream> {
        match UnifyAddr::resolve(addr).await? {
            UnifyAddr::Socket(a) => {
                let stream = io_with_timeout!(opts.connect_timeout, TcpStream::connect(a))?;
                UnifyStream::from_tcp(stream, opts)
            }
            UnifyAddr::Path(path) => {
                let stream = io_with_timeout!(opts.connect_timeout, UnixStream::connect(&path))?;
                Ok(UnifyStream::from_unix(stream, path.display().to_string()))
            }
        }
    }
}
