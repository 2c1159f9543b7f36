//! Middleware around the handler invocation.
//!
//! The chain is an ordered list assembled before the server starts. Each [Filter] does its work
//! and calls `next.handle(ctx)` to continue, the end of the chain is the [Dispatcher].

use super::dispatch::Dispatcher;
use crate::proto::Packet;
use captains_log::LogFilter;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Instant;
use wirerpc_core::metrics::{CallOutcome, MetricsSink};

/// The state of one request passing through the chain
pub struct RequestCtx {
    pub request: Packet,
    /// Prefilled with seq and cmd of the request
    pub response: Packet,
    pub peer_addr: Arc<str>,
    /// Body size of the request, the body itself is handed over to the handler
    pub req_len: usize,
    /// When the request was decoded
    pub start: Instant,
}

impl RequestCtx {
    pub fn new(request: Packet, peer_addr: Arc<str>) -> Self {
        let response =
            Packet { seq: request.seq, err_code: 0, cmd: request.cmd, body: Vec::new() };
        let req_len = request.body.len();
        Self { request, response, peer_addr, req_len, start: Instant::now() }
    }

    #[inline]
    pub fn set_response(&mut self, err_code: u32, body: Vec<u8>) {
        self.response.err_code = err_code;
        self.response.body = body;
    }
}

pub trait Filter: Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: &'a mut RequestCtx, next: Next<'a>) -> BoxFuture<'a, ()>;
}

/// The rest of the chain after the current filter
#[derive(Clone, Copy)]
pub struct Next<'a> {
    filters: &'a [Arc<dyn Filter>],
    dispatcher: &'a Dispatcher,
}

impl<'a> Next<'a> {
    pub(crate) fn new(filters: &'a [Arc<dyn Filter>], dispatcher: &'a Dispatcher) -> Self {
        Self { filters, dispatcher }
    }

    pub fn handle<'b>(self, ctx: &'b mut RequestCtx) -> BoxFuture<'b, ()>
    where
        'a: 'b,
    {
        match self.filters.split_first() {
            Some((filter, rest)) => {
                filter.handle(ctx, Next { filters: rest, dispatcher: self.dispatcher })
            }
            None => self.dispatcher.dispatch(ctx),
        }
    }
}

/// One log line per request: peer, seq, cmd, code and latency
pub struct AccessLogFilter {
    logger: Arc<LogFilter>,
}

impl AccessLogFilter {
    pub fn new(logger: Arc<LogFilter>) -> Self {
        Self { logger }
    }
}

impl Filter for AccessLogFilter {
    fn handle<'a>(&'a self, ctx: &'a mut RequestCtx, next: Next<'a>) -> BoxFuture<'a, ()> {
        async move {
            next.handle(&mut *ctx).await;
            logger_info!(
                self.logger,
                "{} seq={} cmd={} code={} req={}B resp={}B cost={:?}",
                ctx.peer_addr,
                ctx.request.seq,
                ctx.request.cmd,
                ctx.response.err_code,
                ctx.req_len,
                ctx.response.body.len(),
                ctx.start.elapsed()
            );
        }
        .boxed()
    }
}

/// Reports every request to a [MetricsSink]
pub struct MetricsFilter<M: MetricsSink> {
    sink: Arc<M>,
}

impl<M: MetricsSink> MetricsFilter<M> {
    pub fn new(sink: Arc<M>) -> Self {
        Self { sink }
    }
}

impl<M: MetricsSink> Filter for MetricsFilter<M> {
    fn handle<'a>(&'a self, ctx: &'a mut RequestCtx, next: Next<'a>) -> BoxFuture<'a, ()> {
        async move {
            next.handle(&mut *ctx).await;
            self.sink.on_call(
                ctx.request.cmd,
                ctx.start.elapsed(),
                CallOutcome::Code(ctx.response.err_code),
            );
        }
        .boxed()
    }
}
