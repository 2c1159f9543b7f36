//! I/O utilities

use crate::SocketOptions;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::*;
use std::{fmt, io};

mod buf_io;
pub use buf_io::{AsyncBufRead, AsyncBufWrite, AsyncRead, AsyncWrite};

pin_project! {
    /// Cancellable accepts a param `future` for I/O,
    /// abort the I/O waiting when `cancel_future` returns.
    ///
    /// The `cancel_future` can be timer or notification channel recv()
    pub struct Cancellable<F, C> {
        #[pin]
        future: F,
        #[pin]
        cancel_future: C,
    }
}

impl<F: Future, C: Future> Cancellable<F, C> {
    pub fn new(future: F, cancel_future: C) -> Self {
        Self { future, cancel_future }
    }
}

impl<F: Future, C: Future> Future for Cancellable<F, C> {
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }
        if let Poll::Ready(_) = this.cancel_future.poll(cx) {
            return Poll::Ready(Err(()));
        }
        return Poll::Pending;
    }
}

/// Because timeout function return Elapsed as error, this macro convert to io::Error.
///
/// Zero duration means no timeout.
#[macro_export]
macro_rules! io_with_timeout {
    ($timeout: expr, $f: expr) => {{
        let _timeout: std::time::Duration = $timeout;
        if _timeout.is_zero() {
            $f.await
        } else {
            match tokio::time::timeout(_timeout, $f).await {
                Ok(Ok(r)) => Ok(r),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(std::io::Error::from(std::io::ErrorKind::TimedOut)),
            }
        }
    }};
}
pub use crate::io_with_timeout;

/// An established stream connection, split into owned halves so the reader and the writer
/// can run as independent tasks.
pub trait AsyncConn: Send + Sized + 'static + fmt::Debug {
    type Reader: AsyncRead + 'static;
    type Writer: AsyncWrite + 'static;

    /// Remote address for logging
    fn peer_addr(&self) -> String;

    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Interface for transport server listener
pub trait AsyncListener: Send + Sized + 'static + fmt::Debug {
    type Conn: AsyncConn;

    /// The options are applied to every accepted connection
    fn bind(addr: &str, opts: &SocketOptions) -> io::Result<Self>;

    fn accept(&mut self) -> impl Future<Output = io::Result<Self::Conn>> + Send;

    /// The actual bound address, with the port resolved when binding to port 0
    fn local_addr(&self) -> io::Result<String>;
}

/// A stream transport, binding the dialer and the listener of the same address family.
pub trait Transport: Send + Sync + 'static {
    type Conn: AsyncConn;
    type Listener: AsyncListener<Conn = Self::Conn>;

    /// Dial `addr`, fail with `TimedOut` after `opts.connect_timeout`
    fn connect(
        addr: &str, opts: &SocketOptions,
    ) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}
