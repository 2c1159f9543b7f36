use super::filter::RequestCtx;
use crate::error::*;
use captains_log::LogFilter;
use futures::future::{BoxFuture, FutureExt};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A command handler, `body -> (status code, response body)`.
///
/// Implemented for every `Fn(Vec<u8>) -> impl Future<Output = (u32, Vec<u8>)>` closure.
///
/// # Example
///
/// ```no_compile,ignore
/// server.register(1, |body: Vec<u8>| async move { (code::OK, body) });
/// ```
pub trait Handler: Send + Sync + 'static {
    fn call(&self, body: Vec<u8>) -> BoxFuture<'static, (u32, Vec<u8>)>;
}

impl<H, F> Handler for H
where
    H: Fn(Vec<u8>) -> F + Send + Sync + 'static,
    F: Future<Output = (u32, Vec<u8>)> + Send + 'static,
{
    #[inline]
    fn call(&self, body: Vec<u8>) -> BoxFuture<'static, (u32, Vec<u8>)> {
        (self)(body).boxed()
    }
}

/// Render a panic payload for the log
pub(crate) fn panic_msg(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Maps command id to its handler, the terminal node of the filter chain.
///
/// Populated before the server starts, read-only afterwards.
pub struct Dispatcher {
    handlers: FxHashMap<u32, Arc<dyn Handler>>,
    logger: Arc<LogFilter>,
}

impl Dispatcher {
    pub fn new(logger: Arc<LogFilter>) -> Self {
        Self { handlers: FxHashMap::default(), logger }
    }

    /// Return false when `cmd` is already registered, the first registration is kept.
    pub fn register<H: Handler>(&mut self, cmd: u32, handler: H) -> bool {
        if self.handlers.contains_key(&cmd) {
            logger_warn!(self.logger, "cmd {} already registered, ignored", cmd);
            return false;
        }
        self.handlers.insert(cmd, Arc::new(handler));
        true
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Invoke the handler of `ctx.request.cmd` and fill `ctx.response`.
    ///
    /// Unknown command gets INVALID_PARAM, a panicking handler gets INTERNAL_SERVER_ERROR.
    pub fn dispatch<'a>(&'a self, ctx: &'a mut RequestCtx) -> BoxFuture<'a, ()> {
        async move {
            let cmd = ctx.request.cmd;
            let Some(handler) = self.handlers.get(&cmd) else {
                logger_debug!(
                    self.logger,
                    "{} seq={} unknown cmd {}",
                    ctx.peer_addr,
                    ctx.request.seq,
                    cmd
                );
                ctx.set_response(code::INVALID_PARAM, Vec::new());
                return;
            };
            let body = std::mem::take(&mut ctx.request.body);
            // The closure may panic before returning its future
            let res = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(body))) {
                Ok(f) => AssertUnwindSafe(f).catch_unwind().await,
                Err(e) => Err(e),
            };
            match res {
                Ok((err_code, resp)) => ctx.set_response(err_code, resp),
                Err(e) => {
                    logger_error!(
                        self.logger,
                        "{} seq={} cmd {} handler panic: {}",
                        ctx.peer_addr,
                        ctx.request.seq,
                        cmd,
                        panic_msg(e.as_ref())
                    );
                    ctx.set_response(code::INTERNAL_SERVER_ERROR, Vec::new());
                }
            }
        }
        .boxed()
    }
}
