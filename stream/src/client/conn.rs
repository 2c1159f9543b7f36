use super::ClientCommon;
use super::result::{CallState, lock};
use crate::error::*;
use crate::proto::{Packet, PacketReader, PacketWriter, WireFormat};
use crossfire::{MAsyncRx, MAsyncTx, MTx, TrySendError, mpmc};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use wirerpc_core::io::{AsyncConn, AsyncRead, AsyncWrite, Cancellable, Transport};

const ONE_SEC: Duration = Duration::from_secs(1);

/// Calls waiting for their response on one session, keyed by seq
type PendingMap = Mutex<FxHashMap<u32, Arc<CallState>>>;

pub(crate) enum PushErr {
    Full(Arc<CallState>),
    Closed(Arc<CallState>),
}

/// The outbound side of a request queue
pub(crate) trait CallQueue {
    fn try_push(&self, call: Arc<CallState>) -> Result<(), PushErr>;

    /// Take the oldest queued call
    fn try_pop(&self) -> Option<Arc<CallState>>;
}

/// Put `call` into the queue without blocking.
///
/// When the queue is full, the oldest queued call is failed with Overflow to make room, once.
/// A fire-and-forget call meeting a full queue fails right away.
pub(crate) fn enqueue<Q: CallQueue>(queue: &Q, call: Arc<CallState>) -> Result<(), RpcErr> {
    let call = match queue.try_push(call) {
        Ok(()) => return Ok(()),
        Err(PushErr::Closed(_)) => return Err(RpcErr::Closed),
        Err(PushErr::Full(call)) => call,
    };
    if call.skip_response {
        return Err(RpcErr::Overflow);
    }
    if let Some(oldest) = queue.try_pop() {
        oldest.complete(Err(RpcErr::Overflow));
    }
    match queue.try_push(call) {
        Ok(()) => Ok(()),
        Err(PushErr::Closed(_)) => Err(RpcErr::Closed),
        Err(PushErr::Full(_)) => Err(RpcErr::Overflow),
    }
}

/// All the connections to one address.
///
/// `conns` workers share one bounded request queue, each of them dials, serves a session until it
/// breaks, and dials again until the client stops.
pub struct ClientConn {
    addr: String,
    common: Arc<ClientCommon>,
    tx: MAsyncTx<Arc<CallState>>,
    rx: MAsyncRx<Arc<CallState>>,
    connected: AtomicUsize,
    queued: AtomicUsize,
}

impl fmt::Display for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn to {}", self.addr)
    }
}

impl CallQueue for ClientConn {
    fn try_push(&self, call: Arc<CallState>) -> Result<(), PushErr> {
        self.queued.fetch_add(1, SeqCst);
        match self.tx.try_send(call) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(call)) => {
                self.queued.fetch_sub(1, SeqCst);
                Err(PushErr::Full(call))
            }
            Err(TrySendError::Disconnected(call)) => {
                self.queued.fetch_sub(1, SeqCst);
                Err(PushErr::Closed(call))
            }
        }
    }

    fn try_pop(&self) -> Option<Arc<CallState>> {
        let call = self.rx.try_recv().ok()?;
        self.queued.fetch_sub(1, SeqCst);
        Some(call)
    }
}

impl ClientConn {
    pub(crate) fn new(addr: &str, common: Arc<ClientCommon>) -> Arc<Self> {
        let (tx, rx) = mpmc::bounded_async(common.config.pending_requests);
        Arc::new(Self {
            addr: addr.to_string(),
            common,
            tx,
            rx,
            connected: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sessions currently up
    #[inline]
    pub fn connected(&self) -> usize {
        self.connected.load(SeqCst)
    }

    /// Calls waiting in the request queue
    #[inline]
    pub fn queued(&self) -> usize {
        self.queued.load(SeqCst)
    }

    pub(crate) fn spawn<T: Transport, W: WireFormat>(self: &Arc<Self>, done: &MTx<()>) {
        for worker_id in 0..self.common.config.conns {
            tokio::spawn(self.clone().run_worker::<T, W>(worker_id, done.clone()));
        }
    }

    /// Fail every call still in the request queue
    pub(crate) fn fail_queued(&self, e: RpcErr) -> usize {
        let mut count = 0;
        while let Some(call) = self.try_pop() {
            call.complete(Err(e));
            count += 1;
        }
        count
    }

    async fn run_worker<T: Transport, W: WireFormat>(
        self: Arc<Self>, worker_id: usize, _done: MTx<()>,
    ) {
        let logger = self.common.logger.clone();
        let config = &self.common.config;
        logger_trace!(logger, "{} worker_id={} running", self, worker_id);
        let mut dial_fails = 0;
        while !self.common.is_stopped() {
            let dial = T::connect(&self.addr, &config.socket);
            let r = Cancellable::new(dial, self.common.close_rx.recv()).await;
            match r {
                Err(()) => break,
                Ok(Ok(conn)) => {
                    dial_fails = 0;
                    logger_debug!(logger, "{} worker_id={} connected", self, worker_id);
                    self.connected.fetch_add(1, SeqCst);
                    let r = self.serve::<T::Conn, W>(conn).await;
                    self.connected.fetch_sub(1, SeqCst);
                    match r {
                        Err(RpcErr::Closed) => {
                            logger_debug!(logger, "{} worker_id={} closed", self, worker_id);
                        }
                        Err(e) => {
                            logger_warn!(logger, "{} worker_id={} broken: {}", self, worker_id, e);
                        }
                        Ok(()) => {}
                    }
                }
                Ok(Err(e)) => {
                    dial_fails += 1;
                    logger_warn!(
                        logger,
                        "{} worker_id={} dial failed ({}/{}): {}",
                        self,
                        worker_id,
                        dial_fails,
                        config.dial_retries,
                        e
                    );
                    if dial_fails >= config.dial_retries {
                        dial_fails = 0;
                        if self.connected() == 0 {
                            let failed = self.fail_queued(RpcErr::Unreachable);
                            if failed > 0 {
                                logger_error!(
                                    logger,
                                    "{} unreachable, {} queued calls failed",
                                    self,
                                    failed
                                );
                            }
                        }
                    }
                    let sleep = tokio::time::sleep(ONE_SEC);
                    if Cancellable::new(sleep, self.common.close_rx.recv()).await.is_err() {
                        break;
                    }
                }
            }
        }
        logger_trace!(logger, "{} worker_id={} exit", self, worker_id);
    }

    /// Run one session until either direction fails or the client stops.
    ///
    /// Calls left in the pending table are failed on return, so no caller waits on a dead session.
    async fn serve<C: AsyncConn, W: WireFormat>(&self, conn: C) -> Result<(), RpcErr> {
        let config = &self.common.config;
        let (r, w) = conn.into_split();
        let pending: PendingMap = Mutex::new(FxHashMap::default());
        let writer_f = self.write_loop(W::new_writer(w, config.write_buf_size), &pending);
        let reader_f = self.read_loop(W::new_reader(r, config.read_buf_size), &pending);
        tokio::pin!(writer_f);
        tokio::pin!(reader_f);
        let res = tokio::select! {
            r = &mut writer_f => r,
            r = &mut reader_f => r,
            _ = self.common.close_rx.recv() => Err(RpcErr::Closed),
        };
        let e = match res {
            Err(RpcErr::Closed) => RpcErr::Closed,
            _ if self.common.is_stopped() => RpcErr::Closed,
            _ => RpcErr::IO,
        };
        let calls: Vec<Arc<CallState>> = lock(&pending).drain().map(|(_, call)| call).collect();
        if !calls.is_empty() {
            logger_debug!(self.common.logger, "{} fail {} pending calls: {}", self, calls.len(), e);
        }
        for call in calls {
            call.complete(Err(e));
        }
        res
    }

    async fn write_loop<Wr: AsyncWrite, W: WireFormat>(
        &self, mut writer: PacketWriter<Wr, W>, pending: &PendingMap,
    ) -> Result<(), RpcErr> {
        let logger = &self.common.logger;
        let flush_delay = self.common.config.flush_delay;
        let limit = self.common.config.pending_requests * 3;
        let mut flush_at: Option<Instant> = None;
        loop {
            let call = match flush_at {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(Ok(call)) => call,
                    Ok(Err(_)) => return Err(RpcErr::Closed),
                    Err(_) => {
                        writer.flush().await?;
                        flush_at = None;
                        continue;
                    }
                },
                None => match self.rx.recv().await {
                    Ok(call) => call,
                    Err(_) => return Err(RpcErr::Closed),
                },
            };
            self.queued.fetch_sub(1, SeqCst);
            if call.is_canceled() {
                logger_trace!(logger, "{} {:?} canceled before sent", self, call);
                self.common.pool.put(call);
                continue;
            }
            if !call.skip_response {
                let mut map = lock(pending);
                if map.len() >= limit {
                    map.retain(|_, c| !c.is_canceled());
                    if map.len() >= limit {
                        drop(map);
                        logger_error!(logger, "{} pending calls exceed {}", self, limit);
                        call.complete(Err(RpcErr::Overflow));
                        return Err(RpcErr::Overflow);
                    }
                }
                map.insert(call.request.seq, call.clone());
            }
            logger_trace!(logger, "{} send {:?}", self, call.request);
            if let Err(e) = writer.write_packet(&call.request).await {
                call.complete(Err(e));
                return Err(e);
            }
            if call.skip_response {
                let req = &call.request;
                call.complete(Ok(Packet { seq: req.seq, err_code: 0, cmd: req.cmd, body: Vec::new() }));
            }
            if flush_delay.is_zero() {
                writer.flush().await?;
            } else if !writer.is_dirty() {
                flush_at = None;
            } else if flush_at.is_none() {
                flush_at = Some(Instant::now() + flush_delay);
            }
        }
    }

    async fn read_loop<R: AsyncRead, W: WireFormat>(
        &self, mut reader: PacketReader<R, W>, pending: &PendingMap,
    ) -> Result<(), RpcErr> {
        let logger = &self.common.logger;
        let mut reaper = tokio::time::interval(ONE_SEC);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            let resp = {
                let read_f = reader.read_packet();
                tokio::pin!(read_f);
                loop {
                    tokio::select! {
                        r = &mut read_f => break r?,
                        _ = reaper.tick() => {
                            lock(pending).retain(|_, c| !c.is_canceled());
                        }
                    }
                }
            };
            let call = lock(pending).remove(&resp.seq);
            match call {
                Some(call) if !call.is_canceled() => {
                    logger_trace!(logger, "{} recv {:?}", self, resp);
                    call.complete(Ok(resp));
                }
                Some(call) => {
                    logger_debug!(logger, "{} seq={} late response of canceled call", self, resp.seq);
                    self.common.pool.put(call);
                }
                None => {
                    logger_debug!(logger, "{} seq={} response without pending call", self, resp.seq);
                }
            }
        }
    }
}
