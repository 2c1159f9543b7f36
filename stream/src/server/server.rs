use super::dispatch::{Dispatcher, Handler, panic_msg};
use super::filter::{Filter, Next, RequestCtx};
use crate::error::*;
use crate::proto::{MAX_PACKET_LEN, Packet, PacketReader, PacketWriter, WireFormat};
use crate::throttler::Throttler;
use captains_log::LogFilter;
use crossfire::{AsyncRx, MAsyncRx, MAsyncTx, MTx, TrySendError, mpmc, mpsc};
use futures::FutureExt;
use std::io;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use wirerpc_core::ServerConfig;
use wirerpc_core::io::{AsyncConn, AsyncListener, AsyncRead, AsyncWrite, Cancellable, Transport};

/// State shared by the accept loop, the connections and the request tasks, frozen at start.
struct ServerShared {
    config: ServerConfig,
    logger: Arc<LogFilter>,
    dispatcher: Dispatcher,
    filters: Box<[Arc<dyn Filter>]>,
    throttler: Throttler,
}

/// Held by a connection task until it exits
struct ConnGuard {
    alive: Arc<AtomicUsize>,
    _done: MTx<()>,
}

impl ConnGuard {
    fn new(alive: &Arc<AtomicUsize>, done: &MTx<()>) -> Self {
        alive.fetch_add(1, Ordering::SeqCst);
        Self { alive: alive.clone(), _done: done.clone() }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An RpcServer that listen, accept, and serve connections with one wire format over one transport.
///
/// Lifecycle: `new()`, `register()` handlers, optionally `add_filter()`, `start()`, `stop()`.
/// A server does not restart after stop.
pub struct RpcServer<T: Transport, W: WireFormat> {
    config: ServerConfig,
    logger: Arc<LogFilter>,
    dispatcher: Option<Dispatcher>,
    filters: Vec<Arc<dyn Filter>>,
    shared: Option<Arc<ServerShared>>,
    local_addr: Option<String>,
    alive_conns: Arc<AtomicUsize>,
    server_close_tx: Option<MTx<()>>,
    server_close_rx: MAsyncRx<()>,
    accept_handle: Option<JoinHandle<()>>,
    done_rx: Option<MAsyncRx<()>>,
    _phan: PhantomData<fn(&T, &W)>,
}

impl<T: Transport, W: WireFormat> RpcServer<T, W> {
    pub fn new(mut config: ServerConfig) -> Self {
        config.normalize();
        let logger = Arc::new(LogFilter::new());
        let (tx, rx) = mpmc::unbounded_async();
        Self {
            config,
            dispatcher: Some(Dispatcher::new(logger.clone())),
            logger,
            filters: Vec::new(),
            shared: None,
            local_addr: None,
            alive_conns: Arc::new(AtomicUsize::new(0)),
            server_close_tx: Some(tx),
            server_close_rx: rx,
            accept_handle: None,
            done_rx: None,
            _phan: PhantomData,
        }
    }

    #[inline]
    pub fn set_log_level(&self, level: log::Level) {
        self.logger.set_level(level);
    }

    #[inline]
    pub fn get_logger(&self) -> &Arc<LogFilter> {
        &self.logger
    }

    /// Register the handler of `cmd`.
    ///
    /// Returns false if `cmd` is taken, the first registration wins.
    ///
    /// # Panics
    ///
    /// After the server is started.
    pub fn register<H: Handler>(&mut self, cmd: u32, handler: H) -> bool {
        match self.dispatcher.as_mut() {
            Some(d) => d.register(cmd, handler),
            None => panic!("register cmd {} after server started", cmd),
        }
    }

    /// Append a filter to the chain, the first added is the outermost.
    ///
    /// # Panics
    ///
    /// After the server is started.
    pub fn add_filter<F: Filter>(&mut self, filter: F) {
        assert!(self.dispatcher.is_some(), "add_filter after server started");
        self.filters.push(Arc::new(filter));
    }

    /// Bind `addr` and spawn the accept loop, return the actual listening address.
    ///
    /// # Panics
    ///
    /// When called twice, or when no handler is registered.
    pub fn start(&mut self, addr: &str) -> io::Result<String> {
        let dispatcher = match self.dispatcher.take() {
            Some(d) => d,
            None => panic!("server already started"),
        };
        if dispatcher.is_empty() {
            panic!("start server without handler");
        }
        let listener = match <T::Listener as AsyncListener>::bind(addr, &self.config.socket) {
            Ok(l) => l,
            Err(e) => {
                logger_error!(self.logger, "bind addr {:?} err: {}", addr, e);
                // Let the caller fix the address and retry
                self.dispatcher = Some(dispatcher);
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => {
                self.dispatcher = Some(dispatcher);
                return Err(e);
            }
        };
        let shared = Arc::new(ServerShared {
            throttler: Throttler::new(self.config.max_workers),
            config: self.config.clone(),
            logger: self.logger.clone(),
            dispatcher,
            filters: std::mem::take(&mut self.filters).into_boxed_slice(),
        });
        let (done_tx, done_rx) = mpmc::unbounded_async();
        logger_info!(
            self.logger,
            "listening on {} ({} handlers, {} format)",
            local_addr,
            shared.dispatcher.len(),
            W::NAME
        );
        let accept = AcceptLoop::<T, W> {
            listener,
            shared: shared.clone(),
            server_close_rx: self.server_close_rx.clone(),
            alive_conns: self.alive_conns.clone(),
            done_tx,
            _phan: PhantomData,
        };
        self.accept_handle = Some(tokio::spawn(accept.run()));
        self.done_rx = Some(done_rx);
        self.shared = Some(shared);
        self.local_addr = Some(local_addr.clone());
        Ok(local_addr)
    }

    #[inline]
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    /// Connections not yet torn down
    #[inline]
    pub fn alive_conns(&self) -> usize {
        self.alive_conns.load(Ordering::SeqCst)
    }

    /// Worker tokens held by running handlers
    #[inline]
    pub fn busy_workers(&self) -> usize {
        self.shared.as_ref().map(|s| s.throttler.busy()).unwrap_or(0)
    }

    /// Close the listener and every connection, return after all of them exit.
    ///
    /// Handler tasks still running are left alone, their responses are dropped.
    ///
    /// # Panics
    ///
    /// When the server is not started.
    pub async fn stop(&mut self) {
        let shared = match self.shared.take() {
            Some(s) => s,
            None => panic!("stop a server not started"),
        };
        // Notify the accept loop and all connections
        let _ = self.server_close_tx.take();
        if let Some(h) = self.accept_handle.take() {
            if let Err(e) = h.await {
                logger_error!(self.logger, "accept loop aborted: {}", e);
            }
        }
        if let Some(done_rx) = self.done_rx.take() {
            // Returns Err when every ConnGuard dropped
            let _ = done_rx.recv().await;
        }
        shared.throttler.close();
        logger_info!(
            self.logger,
            "server {} stopped, alive conn {}",
            self.local_addr.as_deref().unwrap_or(""),
            self.alive_conns()
        );
        // keep the introspection working after stop
        self.shared = Some(shared);
    }
}

struct AcceptLoop<T: Transport, W: WireFormat> {
    listener: T::Listener,
    shared: Arc<ServerShared>,
    server_close_rx: MAsyncRx<()>,
    alive_conns: Arc<AtomicUsize>,
    done_tx: MTx<()>,
    _phan: PhantomData<fn(&W)>,
}

impl<T: Transport, W: WireFormat> AcceptLoop<T, W> {
    async fn run(mut self) {
        let logger = self.shared.logger.clone();
        loop {
            let r = Cancellable::new(self.listener.accept(), self.server_close_rx.recv()).await;
            match r {
                Err(()) => break,
                Ok(Ok(conn)) => {
                    let guard = ConnGuard::new(&self.alive_conns, &self.done_tx);
                    tokio::spawn(serve_conn::<T, W>(
                        conn,
                        self.shared.clone(),
                        self.server_close_rx.clone(),
                        guard,
                    ));
                }
                Ok(Err(e)) => {
                    logger_warn!(logger, "{:?} accept error: {}", self.listener, e);
                    let backoff = self.shared.config.accept_backoff;
                    let sleep = tokio::time::sleep(backoff);
                    if Cancellable::new(sleep, self.server_close_rx.recv()).await.is_err() {
                        break;
                    }
                }
            }
        }
        logger_info!(logger, "{:?} has closed", self.listener);
    }
}

async fn serve_conn<T: Transport, W: WireFormat>(
    conn: T::Conn, shared: Arc<ServerShared>, server_close_rx: MAsyncRx<()>, guard: ConnGuard,
) {
    let logger = shared.logger.clone();
    let peer: Arc<str> = Arc::from(conn.peer_addr());
    logger_debug!(logger, "{} connected", peer);
    let (r, w) = conn.into_split();
    let (resp_tx, resp_rx) = mpsc::bounded_async::<Packet>(shared.config.pending_responses);
    let reader = ConnReader::<_, W> {
        reader: W::new_reader(r, shared.config.read_buf_size),
        resp_tx,
        peer: peer.clone(),
        server_close_rx: server_close_rx.clone(),
        shared: shared.clone(),
    };
    let writer = ConnWriter::<_, W> {
        writer: W::new_writer(w, shared.config.write_buf_size),
        resp_rx,
        flush_delay: shared.config.flush_delay,
    };
    let reader_f = reader.run();
    let writer_f = writer.run();
    tokio::pin!(reader_f);
    tokio::pin!(writer_f);
    // Whichever ends first tears down the whole connection
    tokio::select! {
        r = &mut reader_f => {
            match r {
                Err(RpcErr::Closed) => {
                    logger_debug!(logger, "{} closed by peer", peer);
                }
                Err(e) => {
                    logger_warn!(logger, "{} reader exits: {}", peer, e);
                }
                Ok(()) => {}
            }
        }
        r = &mut writer_f => {
            if let Err(e) = r {
                logger_warn!(logger, "{} writer exits: {}", peer, e);
            }
        }
        _ = server_close_rx.recv() => {
            logger_debug!(logger, "{} closing on server stop", peer);
        }
    }
    drop(guard);
}

struct ConnReader<R: AsyncRead, W: WireFormat> {
    reader: PacketReader<R, W>,
    resp_tx: MAsyncTx<Packet>,
    peer: Arc<str>,
    server_close_rx: MAsyncRx<()>,
    shared: Arc<ServerShared>,
}

impl<R: AsyncRead, W: WireFormat> ConnReader<R, W> {
    async fn run(mut self) -> Result<(), RpcErr> {
        loop {
            let req = self.reader.read_packet().await?;
            logger_trace!(self.shared.logger, "{} recv {:?}", self.peer, req);
            if self.shared.throttler.nearly_full() {
                logger_debug!(
                    self.shared.logger,
                    "{} seq={} waits for a worker, {} busy",
                    self.peer,
                    req.seq,
                    self.shared.throttler.busy()
                );
            }
            let Some(token) = self.shared.throttler.acquire().await else {
                return Err(RpcErr::Closed);
            };
            tokio::spawn(handle_request::<W>(
                self.shared.clone(),
                self.peer.clone(),
                req,
                self.resp_tx.clone(),
                self.server_close_rx.clone(),
                token,
            ));
        }
    }
}

/// Runs one request through the chain and hands the response to the writer.
///
/// Not canceled by connection teardown, the token is held until the handler returns.
async fn handle_request<W: WireFormat>(
    shared: Arc<ServerShared>, peer: Arc<str>, req: Packet, resp_tx: MAsyncTx<Packet>,
    server_close_rx: MAsyncRx<()>, _token: OwnedSemaphorePermit,
) {
    let mut ctx = RequestCtx::new(req, peer);
    let chain = Next::new(&shared.filters, &shared.dispatcher);
    if let Err(e) = AssertUnwindSafe(chain.handle(&mut ctx)).catch_unwind().await {
        logger_error!(
            shared.logger,
            "{} seq={} filter panic: {}",
            ctx.peer_addr,
            ctx.request.seq,
            panic_msg(e.as_ref())
        );
        ctx.set_response(code::INTERNAL_SERVER_ERROR, Vec::new());
    }
    if W::HEAD_LEN + ctx.response.body.len() > MAX_PACKET_LEN {
        logger_error!(
            shared.logger,
            "{} seq={} cmd={} response body {}B too large",
            ctx.peer_addr,
            ctx.request.seq,
            ctx.request.cmd,
            ctx.response.body.len()
        );
        ctx.set_response(code::INTERNAL_SERVER_ERROR, Vec::new());
    }
    let peer = ctx.peer_addr.clone();
    match resp_tx.try_send(ctx.response) {
        Ok(()) => {}
        Err(TrySendError::Full(resp)) => {
            let seq = resp.seq;
            match Cancellable::new(resp_tx.send(resp), server_close_rx.recv()).await {
                Ok(Ok(())) => {}
                _ => {
                    logger_debug!(shared.logger, "{} seq={} response dropped", peer, seq);
                }
            }
        }
        Err(TrySendError::Disconnected(resp)) => {
            logger_debug!(shared.logger, "{} seq={} conn gone, response dropped", peer, resp.seq);
        }
    }
}

struct ConnWriter<Wr: AsyncWrite, W: WireFormat> {
    writer: PacketWriter<Wr, W>,
    resp_rx: AsyncRx<Packet>,
    flush_delay: Duration,
}

impl<Wr: AsyncWrite, W: WireFormat> ConnWriter<Wr, W> {
    async fn run(mut self) -> Result<(), RpcErr> {
        // Deadline of the oldest unflushed frame
        let mut flush_at: Option<Instant> = None;
        loop {
            let resp = match flush_at {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.resp_rx.recv()).await {
                        Ok(Ok(resp)) => resp,
                        Ok(Err(_)) => break,
                        Err(_) => {
                            self.writer.flush().await?;
                            flush_at = None;
                            continue;
                        }
                    }
                }
                None => match self.resp_rx.recv().await {
                    Ok(resp) => resp,
                    Err(_) => break,
                },
            };
            self.writer.write_packet(&resp).await?;
            if self.flush_delay.is_zero() {
                self.writer.flush().await?;
            } else if !self.writer.is_dirty() {
                // The frame went out with a full buffer
                flush_at = None;
            } else if flush_at.is_none() {
                flush_at = Some(Instant::now() + self.flush_delay);
            }
        }
        self.writer.close().await;
        Ok(())
    }
}
