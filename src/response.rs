//! Outgoing response buffer.
//!
//! Handlers never build a response value directly. They write into the
//! [`ResponseWriter`] owned by the request's [`Context`](crate::Context), and
//! the pipeline turns the writer into an `http::Response` once the chain has
//! unwound.
//!
//! # Write rules
//!
//! - **Status is first-writer-wins.** The first `set_status` call sticks;
//!   later calls are ignored. An inner handler that already chose `201` is
//!   not silently overridden by an outer layer.
//! - **The head commits on the first body write.** If no status was set by
//!   then it becomes `200`. Status or header writes after that point are a
//!   protocol violation: logged at `warn`, ignored.
//! - **Nothing reaches the wire before the chain finishes**, so a recovery
//!   layer may [`discard`](ResponseWriter::discard) a half-written response
//!   and start over.

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;
use tracing::{debug, warn};

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for [`Context::bytes`](crate::Context::bytes).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

/// Buffered response for one request.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    committed: bool,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status code if none has been chosen yet.
    ///
    /// Returns `true` when `code` became the response status.
    pub fn set_status(&mut self, code: StatusCode) -> bool {
        if self.committed {
            warn!(status = code.as_u16(), "status written after body; ignored");
            return false;
        }
        if let Some(current) = self.status {
            debug!(current = current.as_u16(), ignored = code.as_u16(), "status already set");
            return false;
        }
        self.status = Some(code);
        true
    }

    /// Inserts a header, replacing any previous value under the same name.
    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        if self.committed {
            warn!(header = %name, "header written after body; ignored");
            return false;
        }
        self.headers.insert(name, value);
        true
    }

    /// Appends to the body, committing the head on the first write.
    pub fn write(&mut self, chunk: &[u8]) {
        if !self.committed {
            self.status.get_or_insert(StatusCode::OK);
            self.committed = true;
        }
        self.body.extend_from_slice(chunk);
    }

    /// Sets the content type, then writes `body`.
    pub fn write_typed(&mut self, content_type: ContentType, body: &[u8]) {
        self.insert_header(CONTENT_TYPE, HeaderValue::from_static(content_type.as_str()));
        self.write(body);
    }

    /// Drops everything written so far: status, headers, and body.
    pub fn discard(&mut self) {
        *self = Self::default();
    }

    /// The effective status: whatever was set, or `200`.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn is_status_set(&self) -> bool { self.status.is_some() }
    pub fn is_committed(&self) -> bool { self.committed }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Converts into the response type hyper serves.
    pub fn into_response(self) -> http::Response<Full<Bytes>> {
        let status = self.status();
        let mut response = http::Response::new(Full::new(self.body.freeze()));
        *response.status_mut() = status;
        *response.headers_mut() = self.headers;
        response
    }
}
