//! The response slot of one in-flight call.

use crate::error::*;
use crate::proto::Packet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use wirerpc_core::metrics::{CallOutcome, MetricsSink};
use wirerpc_core::pool::{Pool, Poolable};

#[inline]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared between the caller, the request queue and the pending table of a connection.
///
/// Whoever completes it first wins, later results are discarded.
#[derive(Default)]
pub(crate) struct CallState {
    canceled: AtomicBool,
    pub(crate) skip_response: bool,
    pub(crate) request: Packet,
    result: Mutex<Option<Result<Packet, RpcErr>>>,
    done: Notify,
}

impl Poolable for CallState {
    fn reset(&mut self) {
        *self.canceled.get_mut() = false;
        self.skip_response = false;
        self.request = Packet::default();
        *self.result.get_mut().unwrap_or_else(|e| e.into_inner()) = None;
        // Drop a permit possibly stored by the last completion
        self.done = Notify::new();
    }
}

impl CallState {
    /// Set the result, return false when already completed
    #[inline]
    pub(crate) fn complete(&self, res: Result<Packet, RpcErr>) -> bool {
        {
            let mut guard = lock(&self.result);
            if guard.is_some() {
                return false;
            }
            guard.replace(res);
        }
        self.done.notify_one();
        true
    }

    #[inline(always)]
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        lock(&self.result).is_some()
    }

    #[inline]
    pub(crate) fn take(&self) -> Option<Result<Packet, RpcErr>> {
        lock(&self.result).take()
    }
}

impl fmt::Debug for CallState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "call(seq={}, cmd={})", self.request.seq, self.request.cmd)
    }
}

/// Caller-side handle of an asynchronous call.
///
/// Dropping the handle of an unfinished call cancels it, unless it was sent with
/// `skip_response`. The slot goes back to the pool of the client.
pub struct AsyncResult {
    state: Option<Arc<CallState>>,
    pool: Arc<Pool<CallState>>,
    metrics: Arc<dyn MetricsSink>,
    seq: u32,
    cmd: u32,
    start: Instant,
}

impl AsyncResult {
    pub(crate) fn new(
        state: Arc<CallState>, pool: Arc<Pool<CallState>>, metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let seq = state.request.seq;
        let cmd = state.request.cmd;
        Self { state: Some(state), pool, metrics, seq, cmd, start: Instant::now() }
    }

    #[inline]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Whether the result is ready (or already taken)
    #[inline]
    pub fn is_done(&self) -> bool {
        match self.state.as_ref() {
            Some(s) => s.is_done(),
            None => true,
        }
    }

    /// Take the result if ready, None when pending or already taken
    pub fn try_take(&mut self) -> Option<Result<Packet, RpcErr>> {
        let res = self.state.as_ref()?.take()?;
        self.report(&res);
        self.release();
        Some(res)
    }

    /// Wait for the result without a deadline.
    ///
    /// Still bounded: a dead connection fails every call it holds.
    pub async fn wait(mut self) -> Result<Packet, RpcErr> {
        self.wait_inner().await
    }

    /// Wait for the result, give up and cancel the call after `timeout`.
    ///
    /// A response arriving after expiry is discarded.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<Packet, RpcErr> {
        let r = tokio::time::timeout(timeout, self.wait_inner()).await;
        match r {
            Ok(res) => res,
            Err(_) => {
                if let Some(state) = self.state.as_ref() {
                    state.cancel();
                }
                let res = Err(RpcErr::Timeout);
                self.report(&res);
                res
            }
        }
    }

    /// Mark the call canceled: dropped before it reaches the wire, its response ignored.
    pub fn cancel(&self) {
        if let Some(state) = self.state.as_ref() {
            state.cancel();
        }
    }

    async fn wait_inner(&mut self) -> Result<Packet, RpcErr> {
        let Some(state) = self.state.clone() else {
            return Err(RpcErr::Closed);
        };
        loop {
            if let Some(res) = state.take() {
                drop(state);
                self.report(&res);
                self.release();
                return res;
            }
            state.done.notified().await;
        }
    }

    #[inline]
    fn report(&self, res: &Result<Packet, RpcErr>) {
        let outcome = match res {
            Ok(pkt) => CallOutcome::Code(pkt.err_code),
            Err(e) => CallOutcome::Err(*e),
        };
        self.metrics.on_call(self.cmd, self.start.elapsed(), outcome);
    }

    #[inline]
    fn release(&mut self) {
        if let Some(state) = self.state.take() {
            self.pool.put(state);
        }
    }
}

impl Drop for AsyncResult {
    fn drop(&mut self) {
        if let Some(state) = self.state.as_ref() {
            if !state.skip_response && !state.is_done() {
                state.cancel();
            }
        }
        self.release();
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AsyncResult(seq={}, cmd={})", self.seq, self.cmd)
    }
}
