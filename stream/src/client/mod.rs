//! The client engine.
//!
//! [RpcClient] keeps one [ClientConn] per remote address, created on first use. A call is queued to
//! the connection, sent by a writer task and matched to its response by seq in a reader task.
//! The caller holds an [AsyncResult] to wait on.

pub use wirerpc_core::ClientConfig;

mod conn;
pub use conn::ClientConn;
use conn::enqueue;

mod result;
pub use result::AsyncResult;
use result::{CallState, lock};

use crate::error::*;
use crate::proto::{MAX_PACKET_LEN, Packet, WireFormat};
use captains_log::LogFilter;
use crossfire::{MAsyncRx, MTx, mpmc};
use rustc_hash::FxHashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wirerpc_core::io::Transport;
use wirerpc_core::metrics::{MetricsSink, NoopMetrics};
use wirerpc_core::pool::Pool;

/// Shared by the client and all of its connections
pub(crate) struct ClientCommon {
    pub(crate) config: ClientConfig,
    pub(crate) logger: Arc<LogFilter>,
    pub(crate) pool: Arc<Pool<CallState>>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) close_rx: MAsyncRx<()>,
    seq: AtomicU32,
    stopped: AtomicBool,
}

impl ClientCommon {
    #[inline(always)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// A client calling any number of servers with one wire format over one transport.
///
/// Calls need a tokio runtime, the connection tasks are spawned on first use of an address.
///
/// # Example
///
/// ```no_compile,ignore
/// let client = TcpClient::<Simple>::new(ClientConfig::default());
/// let resp = client.call("127.0.0.1:9000", 1, b"hello".to_vec()).await?;
/// ```
pub struct RpcClient<T: Transport, W: WireFormat> {
    common: Arc<ClientCommon>,
    conns: Mutex<FxHashMap<String, Arc<ClientConn>>>,
    close_tx: Mutex<Option<MTx<()>>>,
    done_tx: Mutex<Option<MTx<()>>>,
    done_rx: MAsyncRx<()>,
    _phan: PhantomData<fn(&T, &W)>,
}

impl<T: Transport, W: WireFormat> RpcClient<T, W> {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    /// Every finished call is reported to `metrics`
    pub fn with_metrics(mut config: ClientConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        config.normalize();
        let (close_tx, close_rx) = mpmc::unbounded_async();
        let (done_tx, done_rx) = mpmc::unbounded_async();
        let common = ClientCommon {
            pool: Arc::new(Pool::new(config.pending_requests)),
            config,
            logger: Arc::new(LogFilter::new()),
            metrics,
            close_rx,
            seq: AtomicU32::new(1),
            stopped: AtomicBool::new(false),
        };
        Self {
            common: Arc::new(common),
            conns: Mutex::new(FxHashMap::default()),
            close_tx: Mutex::new(Some(close_tx)),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            _phan: PhantomData,
        }
    }

    #[inline]
    pub fn set_log_level(&self, level: log::Level) {
        self.common.logger.set_level(level);
    }

    #[inline]
    pub fn get_logger(&self) -> &Arc<LogFilter> {
        &self.common.logger
    }

    #[inline]
    pub fn get_config(&self) -> &ClientConfig {
        &self.common.config
    }

    /// The connection to `addr`, None if never used
    pub fn get_conn(&self, addr: &str) -> Option<Arc<ClientConn>> {
        lock(&self.conns).get(addr).cloned()
    }

    fn conn(&self, addr: &str) -> Result<Arc<ClientConn>, RpcErr> {
        if let Some(conn) = lock(&self.conns).get(addr) {
            return Ok(conn.clone());
        }
        let done_tx = lock(&self.done_tx);
        let Some(done) = done_tx.as_ref() else {
            return Err(RpcErr::Closed);
        };
        let mut conns = lock(&self.conns);
        // Another caller may have created it in between
        if let Some(conn) = conns.get(addr) {
            return Ok(conn.clone());
        }
        logger_debug!(self.common.logger, "new conn to {}", addr);
        let conn = ClientConn::new(addr, self.common.clone());
        conn.spawn::<T, W>(done);
        conns.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    /// Queue a call to `addr` and return without waiting.
    ///
    /// With `skip_response`, no response is expected: the handle resolves with an empty packet
    /// once the request is written, and dropping it does not cancel the call.
    ///
    /// Fails with Overflow when the body does not fit a frame, or when the request queue is full
    /// even after failing its oldest call.
    pub fn call_async(
        &self, addr: &str, cmd: u32, body: Vec<u8>, skip_response: bool,
    ) -> Result<AsyncResult, RpcErr> {
        if self.common.is_stopped() {
            return Err(RpcErr::Closed);
        }
        if W::HEAD_LEN + body.len() > MAX_PACKET_LEN {
            logger_warn!(self.common.logger, "cmd={} body {}B too large", cmd, body.len());
            return Err(RpcErr::Overflow);
        }
        let conn = self.conn(addr)?;
        let seq = self.common.next_seq();
        let state = self.common.pool.get_with(|s| {
            s.request = Packet { seq, err_code: 0, cmd, body };
            s.skip_response = skip_response;
        });
        let res =
            AsyncResult::new(state.clone(), self.common.pool.clone(), self.common.metrics.clone());
        if let Err(e) = enqueue(conn.as_ref(), state) {
            logger_debug!(self.common.logger, "{} seq={} cmd={} enqueue: {}", conn, seq, cmd, e);
            return Err(e);
        }
        if self.common.is_stopped() {
            // Raced with stop(), nobody will send it
            conn.fail_queued(RpcErr::Closed);
        }
        Ok(res)
    }

    /// Fire-and-forget, shorthand of `call_async(.., skip_response = true)`
    #[inline]
    pub fn send(&self, addr: &str, cmd: u32, body: Vec<u8>) -> Result<AsyncResult, RpcErr> {
        self.call_async(addr, cmd, body, true)
    }

    /// Call with the configured request timeout and retries.
    ///
    /// The status code from the handler is in `err_code` of the returned packet.
    #[inline]
    pub async fn call(&self, addr: &str, cmd: u32, body: Vec<u8>) -> Result<Packet, RpcErr> {
        let config = &self.common.config;
        self.call_timeout(addr, cmd, body, config.request_timeout, config.retries).await
    }

    /// Call with the configured request timeout, retry up to `retries` times on timeout
    #[inline]
    pub async fn call_retry(
        &self, addr: &str, cmd: u32, body: Vec<u8>, retries: usize,
    ) -> Result<Packet, RpcErr> {
        self.call_timeout(addr, cmd, body, self.common.config.request_timeout, retries).await
    }

    /// Wait at most `timeout` for each attempt, make up to `retries + 1` attempts.
    ///
    /// Only Timeout is retried. Every attempt is a new request with a new seq, so the handler
    /// may run more than once.
    pub async fn call_timeout(
        &self, addr: &str, cmd: u32, mut body: Vec<u8>, timeout: Duration, retries: usize,
    ) -> Result<Packet, RpcErr> {
        let mut attempt = 0;
        loop {
            let last = attempt >= retries;
            let req_body = if last { std::mem::take(&mut body) } else { body.clone() };
            let res = self.call_async(addr, cmd, req_body, false)?.wait_timeout(timeout).await;
            match res {
                Err(e) if e.is_retriable() && !last => {
                    attempt += 1;
                    logger_debug!(
                        self.common.logger,
                        "to {} cmd={} {}, retry {}/{}",
                        addr,
                        cmd,
                        e,
                        attempt,
                        retries
                    );
                }
                _ => return res,
            }
        }
    }

    /// Stop all connections and return after their tasks exit.
    ///
    /// Queued and pending calls fail with Closed, later calls are rejected with Closed.
    pub async fn stop(&self) {
        if self.common.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = lock(&self.close_tx).take();
        let _ = lock(&self.done_tx).take();
        // Returns Err when every worker dropped its sender
        let _ = self.done_rx.recv().await;
        let conns: Vec<Arc<ClientConn>> = lock(&self.conns).values().cloned().collect();
        for conn in conns {
            conn.fail_queued(RpcErr::Closed);
        }
        logger_info!(self.common.logger, "client stopped");
    }
}

impl<T: Transport, W: WireFormat> Drop for RpcClient<T, W> {
    fn drop(&mut self) {
        // Let the workers exit if stop() was never called
        self.common.stopped.store(true, Ordering::Release);
        let _ = lock(&self.close_tx).take();
    }
}
