//! The handler chain shared by every request.
//!
//! Build a [`Pipeline`] once at startup, wrap it in an `Arc`, and hand each
//! request to it. Each request gets its own [`Context`]; the pipeline itself
//! is read-only after construction and needs no locking.
//!
//! # Serving with hyper
//!
//! [`Pipeline::dispatch`] has exactly the shape `hyper::service::service_fn`
//! expects:
//!
//! ```rust,ignore
//! let pipeline = Arc::new(pipeline);
//! let svc = service_fn(move |req| {
//!     let pipeline = Arc::clone(&pipeline);
//!     async move { pipeline.dispatch(req).await }
//! });
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use tracing::{debug, warn};

use crate::container::Container;
use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, BoxedHandler, Handler, HandlerResult};
use crate::middleware::Recovery;
use crate::request::Request;

/// An ordered, immutable list of handlers.
#[derive(Clone)]
pub struct Pipeline {
    handlers: Arc<[BoxedHandler]>,
    container: Option<Arc<Container>>,
}

impl Pipeline {
    /// An empty pipeline. Nothing contains panics until you add a recovery
    /// layer; see [`Pipeline::with_recovery`].
    pub fn new() -> Self {
        Self { handlers: Arc::new([]), container: None }
    }

    /// A pipeline whose first handler is [`Recovery`].
    pub fn with_recovery() -> Self {
        Self::new().handler(Recovery)
    }

    /// Appends a handler. Returns `self` for chaining.
    pub fn handler(mut self, handler: impl Handler) -> Self {
        let mut handlers = self.handlers.to_vec();
        handlers.push(Arc::new(handler));
        self.handlers = handlers.into();
        self
    }

    /// Appends a closure handler.
    pub fn handler_fn<F>(self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        self.handler(f)
    }

    /// Attaches the service container handlers resolve services from.
    pub fn container(mut self, container: Arc<Container>) -> Self {
        self.container = Some(container);
        self
    }

    pub fn len(&self) -> usize { self.handlers.len() }
    pub fn is_empty(&self) -> bool { self.handlers.is_empty() }

    /// A fresh context for `request` over this pipeline's handlers.
    pub fn context(&self, request: Request) -> Context {
        Context::new(request, Arc::clone(&self.handlers)).with_container(self.container.clone())
    }

    /// Runs the chain to completion on `cx`.
    ///
    /// Afterwards the context is exhausted: further `next()` calls do nothing.
    pub async fn run(&self, cx: &mut Context) {
        cx.next().await;
        cx.finish();
    }

    /// Runs `request` through the chain and produces the response.
    ///
    /// Errors recorded with [`Context::error`] are logged at `WARN` here, at
    /// the end of the chain.
    pub async fn handle(&self, request: Request) -> http::Response<Full<Bytes>> {
        let mut cx = self.context(request);
        self.run(&mut cx).await;

        let method = cx.request().method().clone();
        let path = cx.request().path().to_owned();
        for err in cx.take_errors() {
            warn!(%method, %path, error = %err, "request error");
        }
        if cx.is_aborted() {
            debug!(%method, %path, status = cx.response().status().as_u16(), "request aborted");
        }
        cx.into_response()
    }

    /// Buffers the body of a hyper request, then [`handle`](Pipeline::handle)s it.
    ///
    /// A body that fails to arrive is answered with `400 Bad Request` without
    /// entering the chain.
    pub async fn dispatch<B>(&self, req: http::Request<B>) -> Result<http::Response<Full<Bytes>>, Infallible>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let (head, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = Error::Body(e.to_string());
                warn!(method = %head.method, path = head.uri.path(), error = %err, "request body");
                let mut response = http::Response::new(Full::new(Bytes::new()));
                *response.status_mut() = StatusCode::BAD_REQUEST;
                return Ok(response);
            }
        };
        Ok(self.handle(Request::from_parts(head, body)).await)
    }
}

impl Default for Pipeline {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handlers.len())
            .field("container", &self.container.is_some())
            .finish()
    }
}
