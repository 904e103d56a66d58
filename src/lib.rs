//! # strata
//!
//! The request-handling core of a small web framework: an onion of
//! middleware around one request/response exchange, and a recovery layer
//! that keeps a panicking handler from taking the process down.
//!
//! ## The contract
//!
//! strata runs handlers. It does not accept connections, terminate TLS, or
//! match routes. Plug [`Pipeline::dispatch`] into hyper (or anything that
//! speaks `http::Request`) and let it do what it does.
//!
//! What strata owns:
//!
//! - **Ordering**: handler *i* runs its code before `next()` ahead of every
//!   later handler, and its code after `next()` once they have all returned.
//! - **Short-circuiting**: [`Context::abort`] stops any handler not yet
//!   entered from running.
//! - **Containment**: a panic stops at the nearest
//!   [`Recovery`](middleware::Recovery) or
//!   [`RecoveryPro`](middleware::RecoveryPro) layer and becomes a response.
//! - **Diagnostics**: panic-site stack traces with `Authorization`
//!   redacted from the logged request.
//!
//! ## Quick start
//!
//! ```rust
//! use http::StatusCode;
//! use strata::{Pipeline, Request, handler_fn};
//! use strata::middleware::RecoveryPro;
//!
//! # async fn demo() {
//! let pipeline = Pipeline::new()
//!     .handler(RecoveryPro::new())
//!     .handler(handler_fn(|cx| Box::pin(async move {
//!         let started = std::time::Instant::now();
//!         cx.next().await;
//!         tracing::info!(elapsed = ?started.elapsed(), "done");
//!         Ok(())
//!     })))
//!     .handler(handler_fn(|cx| Box::pin(async move {
//!         if cx.request().header("authorization").is_none() {
//!             cx.abort_with_status(StatusCode::UNAUTHORIZED);
//!             return Ok(());
//!         }
//!         cx.next().await;
//!         Ok(())
//!     })))
//!     .handler(handler_fn(|cx| Box::pin(async move {
//!         cx.set_status(StatusCode::CREATED).json(&serde_json::json!({ "id": 42 }));
//!         Ok(())
//!     })));
//!
//! let request = http::Request::post("/users")
//!     .header("authorization", "Bearer abc123")
//!     .body(bytes::Bytes::new())
//!     .unwrap();
//! let response = pipeline.handle(Request::new(request)).await;
//! assert_eq!(response.status(), StatusCode::CREATED);
//! # }
//! ```

mod container;
mod context;
mod error;
mod fault;
mod handler;
mod log;
mod pipeline;
mod request;
mod response;

pub mod middleware;
pub mod stack;

pub use container::{Container, Instance, NewInstance, Param, ServiceProvider, ServiceState};
pub use context::Context;
pub use error::Error;
pub use fault::{Fault, FaultKind, is_broken_pipe_text};
pub use handler::{BoxFuture, BoxedHandler, Handler, HandlerResult, handler_fn};
pub use log::{LogSink, TracingSink};
pub use pipeline::Pipeline;
pub use request::Request;
pub use response::{ContentType, ResponseWriter};
