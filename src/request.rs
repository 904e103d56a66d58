//! Incoming HTTP request type.

use std::fmt::Write;

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, Method, Uri, Version};

/// An incoming HTTP request with its body fully buffered.
///
/// Immutable for the lifetime of a [`Context`](crate::Context): handlers can
/// read it, never change it.
#[derive(Debug)]
pub struct Request {
    head: Parts,
    body: Bytes,
}

impl Request {
    pub fn new(req: http::Request<Bytes>) -> Self {
        let (head, body) = req.into_parts();
        Self { head, body }
    }

    pub fn from_parts(head: Parts, body: Bytes) -> Self {
        Self { head, body }
    }

    pub fn method(&self) -> &Method { &self.head.method }
    pub fn uri(&self) -> &Uri { &self.head.uri }
    pub fn path(&self) -> &str { self.head.uri.path() }
    pub fn version(&self) -> Version { self.head.version }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Case-insensitive header lookup. Non-UTF-8 values are skipped.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Renders the request head the way it appeared on the wire: request
    /// line, `Host`, then every header with a canonical name. Lines are
    /// CRLF-terminated and the dump ends with an empty line. The body is
    /// never included.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let target = self.head.uri.path_and_query().map_or("/", |pq| pq.as_str());
        // write! into a String cannot fail
        let _ = write!(out, "{} {} {:?}\r\n", self.head.method, target, self.head.version);

        let host = self.header("host").or_else(|| self.head.uri.authority().map(|a| a.as_str()));
        if let Some(host) = host {
            let _ = write!(out, "Host: {host}\r\n");
        }

        for (name, value) in &self.head.headers {
            if name == http::header::HOST {
                continue;
            }
            let value = String::from_utf8_lossy(value.as_bytes());
            let _ = write!(out, "{}: {value}\r\n", canonical_name(name.as_str()));
        }
        out.push_str("\r\n");
        out
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        Self::new(req)
    }
}

/// `x-request-id` → `X-Request-Id`.
fn canonical_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
