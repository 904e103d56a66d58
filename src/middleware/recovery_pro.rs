//! Production panic recovery.
//!
//! # What happens on a panic
//!
//! 1. The panic is caught at this layer and classified. A disconnect ("broken
//!    pipe", "connection reset by peer") is not a bug: the client is gone.
//! 2. If a logger is configured, the request head is dumped with every
//!    `Authorization` header replaced by `Authorization: *`. Disconnects log
//!    the panic value and the headers; anything else also gets a timestamp and
//!    a stack trace.
//! 3. Disconnects are recorded with [`Context::error`], anything the
//!    handlers buffered is discarded, and the chain is aborted without
//!    writing a response. Anything else goes to the [`RecoveryFunc`]
//!    (default: discard, `500`, abort).
//!
//! # Where the stack trace comes from
//!
//! By the time `catch_unwind` returns, the frames that panicked are gone. So
//! the first `RecoveryPro` built installs a process-wide panic hook (chained
//! in front of the existing one) that records an unresolved backtrace, but
//! only while a `RecoveryPro` layer is polling its downstream future on the
//! current thread. Those panics are reported here instead of on stderr.
//! Panics anywhere else reach the previous hook untouched.
//!
//! The hook cannot tell which boundary will catch a panic. One raised under
//! a `RecoveryPro` but caught further down, by a nested
//! [`Recovery`](super::Recovery) or a handler's own `catch_unwind`, skips
//! the previous hook as well. `Recovery` reports its panics through
//! `tracing` and clears the recorded trace; a handler that catches panics
//! itself owns reporting them. A payload re-raised with
//! `std::panic::resume_unwind` does not run the hook, so it is reported with
//! the trace of the panic that was caught, or with a stack captured at the
//! recovery point when there is none.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{self, Poll};

use futures_util::FutureExt;
use http::StatusCode;

use crate::context::Context;
use crate::fault::Fault;
use crate::handler::{BoxFuture, Handler, HandlerResult};
use crate::log::{LogSink, TracingSink};
use crate::stack::{self, Trace};

/// Frames hidden when the stack has to be captured at the recovery point
/// rather than at the panic site: the formatter's caller, the unwind guard,
/// and this layer's future.
pub const GUARD_FRAMES: usize = 3;

/// Decides the response for a recovered panic that is not a disconnect.
pub type RecoveryFunc = Arc<dyn Fn(&mut Context, Fault) + Send + Sync>;

/// Drops whatever the failed handlers buffered, answers `500 Internal
/// Server Error`, then aborts.
pub fn default_handle_recovery(cx: &mut Context, _fault: Fault) {
    cx.response_mut().discard();
    cx.abort_with_status(StatusCode::INTERNAL_SERVER_ERROR);
}

/// Panic recovery with disconnect detection, redacted request dumps, stack
/// traces, and a pluggable response policy.
///
/// ```rust
/// use std::sync::Mutex;
///
/// use http::StatusCode;
/// use strata::Pipeline;
/// use strata::middleware::RecoveryPro;
///
/// let recovery = RecoveryPro::custom(|cx, fault| {
///     cx.response_mut().discard();
///     cx.set_status(StatusCode::SERVICE_UNAVAILABLE).text(format!("try again: {fault}"));
///     cx.abort();
/// })
/// .logger(Mutex::new(std::io::stderr()));
///
/// let pipeline = Pipeline::new().handler(recovery);
/// ```
#[derive(Clone)]
pub struct RecoveryPro {
    handle: RecoveryFunc,
    logger: Option<Arc<dyn LogSink>>,
}

impl RecoveryPro {
    /// Default policy, logging through `tracing`.
    pub fn new() -> Self {
        Self::custom(default_handle_recovery)
    }

    /// Custom response policy, logging through `tracing`.
    pub fn custom(handle: impl Fn(&mut Context, Fault) + Send + Sync + 'static) -> Self {
        install_panic_hook();
        Self { handle: Arc::new(handle), logger: Some(Arc::new(TracingSink)) }
    }

    /// Sends recovery reports to `sink` instead of `tracing`.
    pub fn logger(mut self, sink: impl LogSink + 'static) -> Self {
        self.logger = Some(Arc::new(sink));
        self
    }

    /// Recovers silently.
    pub fn without_logger(mut self) -> Self {
        self.logger = None;
        self
    }

    fn report(&self, cx: &Context, fault: &Fault, trace: Option<Trace>) {
        let Some(logger) = &self.logger else { return };
        let headers = sanitize_dump(&cx.request().dump());

        if fault.is_broken_pipe() {
            logger.write(&format!("{fault}\n{headers}"));
            return;
        }

        let stack = match trace {
            Some(trace) => trace.render_from_panic_site(0),
            None => stack::stack(GUARD_FRAMES),
        };
        logger.write(&format!(
            "[Recovery] {} panic recovered:\n{fault}\n{stack}\n{headers}",
            timestamp(),
        ));
    }
}

impl Default for RecoveryPro {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for RecoveryPro {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryPro")
            .field("logger", &self.logger.is_some())
            .finish_non_exhaustive()
    }
}

impl Handler for RecoveryPro {
    fn call<'a>(&'a self, cx: &'a mut Context) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            take_panic_trace();

            let downstream = Armed { inner: Box::pin(cx.next()) };
            let outcome = AssertUnwindSafe(downstream).catch_unwind().await;
            let trace = take_panic_trace();
            let Err(payload) = outcome else { return Ok(()) };

            let fault = Fault::new(payload);
            self.report(cx, &fault, trace);

            if fault.is_broken_pipe() {
                // the peer is gone: nothing buffered is worth sending
                cx.response_mut().discard();
                cx.error(fault.into_error());
                cx.abort();
            } else {
                (self.handle)(cx, fault);
            }
            Ok(())
        })
    }
}

/// Replaces the value of every `Authorization` line of a CRLF request dump
/// with `*`. The header name is matched ASCII case-insensitively.
pub fn sanitize_dump(dump: &str) -> String {
    dump.split("\r\n")
        .map(|line| {
            let name = line.split(':').next().unwrap_or(line);
            if name.eq_ignore_ascii_case("authorization") { "Authorization: *" } else { line }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y/%m/%d - %H:%M:%S").to_string()
}

// ── Panic-site capture ────────────────────────────────────────────────────────

thread_local! {
    /// Depth of `RecoveryPro` layers currently polling on this thread.
    static ARMED: Cell<usize> = const { Cell::new(0) };
    static PANIC_TRACE: RefCell<Option<Trace>> = const { RefCell::new(None) };
}

/// Empties this thread's trace slot, returning what the hook last recorded.
///
/// Inner recovery boundaries call this after catching so their panic's
/// trace is not reported for a later, unrelated fault.
pub(crate) fn take_panic_trace() -> Option<Trace> {
    PANIC_TRACE.try_with(|slot| slot.borrow_mut().take()).ok().flatten()
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if ARMED.try_with(Cell::get).unwrap_or(0) > 0 {
                let _ = PANIC_TRACE.try_with(|slot| *slot.borrow_mut() = Some(Trace::capture()));
            } else {
                previous(info);
            }
        }));
    });
}

/// Polls the downstream chain with the panic hook armed for this thread.
///
/// Arming per poll, not per request, keeps it correct when the runtime moves
/// the request between worker threads.
struct Armed<'a> {
    inner: BoxFuture<'a, ()>,
}

impl Future for Armed<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, task: &mut task::Context<'_>) -> Poll<()> {
        let _armed = ArmGuard::enter();
        self.inner.as_mut().poll(task)
    }
}

struct ArmGuard;

impl ArmGuard {
    fn enter() -> Self {
        ARMED.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for ArmGuard {
    fn drop(&mut self) {
        let _ = ARMED.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}
