//! Handler trait and type erasure.
//!
//! # How handlers are stored
//!
//! A pipeline holds handlers of *different* concrete types (closures, the
//! recovery middlewares, user structs) in one ordered list, so every handler
//! is erased behind `Arc<dyn Handler>` and the list is shared as
//! `Arc<[BoxedHandler]>` by every request.
//!
//! The chain from user code to the call at request time is:
//!
//! ```text
//! |cx| Box::pin(async move { cx.next().await; Ok(()) })   ← user writes this
//!        ↓ pipeline.handler_fn(..)
//! Arc::new(f) as BoxedHandler                              ← one allocation, at build time
//!        ↓ cx.next().await
//! handler.call(cx)                                         ← one vtable dispatch per hop
//! ```
//!
//! Handlers borrow the [`Context`] mutably for as long as their future runs.
//! That is what makes the onion work: a middleware holds `&mut Context`,
//! lends it to everything downstream through [`Context::next`], and gets it
//! back when `next` resolves.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::error::Error;

/// A heap-allocated, type-erased future borrowing from `'a`.
///
/// `Pin<Box<…>>` because the runtime polls it in place; `Send` so a request
/// can migrate between worker threads.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What every handler returns. `Err` is an observability signal only: the
/// executor logs it and carries on. Control flow belongs to
/// [`Context::next`] and [`Context::abort`].
pub type HandlerResult = Result<(), Error>;

/// A type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn Handler>;

/// One step of a pipeline.
///
/// Implemented automatically for closures of the form
/// `for<'a> Fn(&'a mut Context) -> BoxFuture<'a, HandlerResult>`; implement it
/// by hand for middleware that carries configuration.
///
/// ```rust
/// use strata::{BoxFuture, Context, Handler, HandlerResult};
///
/// struct Stamp(&'static str);
///
/// impl Handler for Stamp {
///     fn call<'a>(&'a self, cx: &'a mut Context) -> BoxFuture<'a, HandlerResult> {
///         Box::pin(async move {
///             cx.header("x-served-by", self.0);
///             cx.next().await;
///             Ok(())
///         })
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, cx: &'a mut Context) -> BoxFuture<'a, HandlerResult>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, cx: &'a mut Context) -> BoxFuture<'a, HandlerResult> {
        (self)(cx)
    }
}

/// Pins down the higher-ranked signature of a handler closure.
///
/// Closure signatures are only inferred from a direct `Fn` bound, not through
/// a trait impl, so wrap closures in `handler_fn` wherever an `impl Handler`
/// is expected:
///
/// ```rust
/// use strata::{Pipeline, handler_fn};
///
/// let pipeline = Pipeline::new().handler(handler_fn(|cx| Box::pin(async move {
///     cx.text("hello");
///     Ok(())
/// })));
/// ```
pub fn handler_fn<F>(f: F) -> F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
{
    f
}
