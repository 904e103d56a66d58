//! Per-request state and the chain executor.
//!
//! A [`Context`] is created for every request, owns the request and the
//! response buffer, and walks the pipeline's handler list with a cursor.
//!
//! ```text
//!   cursor: 0          1          2          3 (exhausted)
//!           │          │          │          │
//!   handlers [recovery] [auth]    [endpoint]
//!
//!   recovery ─ pre ─┐                               ┌─ post ─▶ done
//!                   auth ─ pre ─┐       ┌─ post ───┘
//!                               endpoint
//! ```
//!
//! Each [`next`](Context::next) enters exactly one handler and resolves when
//! that handler (and everything it called) has returned.

use std::any::Any;
use std::sync::Arc;

use http::StatusCode;
use http::header::{HeaderName, HeaderValue};
use serde::Serialize;
use tracing::debug;

use crate::container::Container;
use crate::error::Error;
use crate::handler::BoxedHandler;
use crate::request::Request;
use crate::response::{ContentType, ResponseWriter};

/// Per-request state carrier.
pub struct Context {
    request: Request,
    response: ResponseWriter,
    handlers: Arc<[BoxedHandler]>,
    cursor: usize,
    aborted: bool,
    errors: Vec<Error>,
    container: Option<Arc<Container>>,
}

impl Context {
    pub fn new(request: Request, handlers: Arc<[BoxedHandler]>) -> Self {
        Self {
            request,
            response: ResponseWriter::new(),
            handlers,
            cursor: 0,
            aborted: false,
            errors: Vec::new(),
            container: None,
        }
    }

    pub(crate) fn with_container(mut self, container: Option<Arc<Container>>) -> Self {
        self.container = container;
        self
    }

    // ── Chain control ─────────────────────────────────────────────────────────

    /// Enters the next handler and waits until it returns.
    ///
    /// No-op once the context is aborted or every handler has been entered,
    /// including after the pipeline finished with this request.
    pub async fn next(&mut self) {
        if self.aborted {
            return;
        }
        let Some(handler) = self.handlers.get(self.cursor).cloned() else {
            return;
        };
        self.cursor += 1;
        let index = self.cursor - 1;

        if let Err(err) = handler.call(self).await {
            debug!(handler = index, error = %err, "handler returned an error");
        }
    }

    /// Stops the chain: no handler after the current one will be entered.
    ///
    /// Handlers that are already running still finish their own code after
    /// `next().await`.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    pub fn abort_with_status(&mut self, code: StatusCode) {
        self.set_status(code);
        self.abort();
    }

    pub fn is_aborted(&self) -> bool { self.aborted }

    /// Number of handlers entered so far.
    pub fn cursor(&self) -> usize { self.cursor }

    /// Marks every handler as entered so stray `next()` calls do nothing.
    pub(crate) fn finish(&mut self) {
        self.cursor = self.handlers.len();
    }

    // ── Errors ────────────────────────────────────────────────────────────────

    /// Records an error for end-of-chain reporting. Control flow is unchanged.
    pub fn error(&mut self, err: impl Into<Error>) -> &mut Self {
        self.errors.push(err.into());
        self
    }

    /// Every recorded error, oldest first.
    pub fn errors(&self) -> &[Error] { &self.errors }

    pub fn last_error(&self) -> Option<&Error> { self.errors.last() }

    pub(crate) fn take_errors(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.errors)
    }

    // ── Request / response ────────────────────────────────────────────────────

    pub fn request(&self) -> &Request { &self.request }
    pub fn response(&self) -> &ResponseWriter { &self.response }
    pub fn response_mut(&mut self) -> &mut ResponseWriter { &mut self.response }

    /// Sets the response status (first writer wins).
    pub fn set_status(&mut self, code: StatusCode) -> &mut Self {
        self.response.set_status(code);
        self
    }

    /// Sets a response header. Invalid names or values are recorded as errors.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.response.insert_header(name, value);
            }
            (Err(e), _) => {
                self.error(e);
            }
            (_, Err(e)) => {
                self.error(e);
            }
        }
        self
    }

    /// Serialises `value` as the JSON body. Serialisation failures are
    /// recorded as errors and leave the body untouched.
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> &mut Self {
        match serde_json::to_vec(value) {
            Ok(body) => self.response.write_typed(ContentType::Json, &body),
            Err(e) => {
                self.error(e);
            }
        }
        self
    }

    pub fn text(&mut self, body: impl AsRef<str>) -> &mut Self {
        self.response.write_typed(ContentType::Text, body.as_ref().as_bytes());
        self
    }

    pub fn bytes(&mut self, content_type: ContentType, body: &[u8]) -> &mut Self {
        self.response.write_typed(content_type, body);
        self
    }

    pub fn into_response(self) -> http::Response<http_body_util::Full<bytes::Bytes>> {
        self.response.into_response()
    }

    // ── Services ──────────────────────────────────────────────────────────────

    pub fn container(&self) -> Option<&Arc<Container>> { self.container.as_ref() }

    /// Resolves a named service from the pipeline's container.
    pub fn make<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, Error> {
        self.container.as_ref().ok_or(Error::NoContainer)?.make(name)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("cursor", &self.cursor)
            .field("handlers", &self.handlers.len())
            .field("aborted", &self.aborted)
            .field("errors", &self.errors.len())
            .finish()
    }
}
