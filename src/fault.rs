//! Recovered panic payloads.
//!
//! A panic can carry any `Box<dyn Any + Send>`. In practice it is a `&str`
//! or `String` from `panic!`, or a typed value raised with
//! [`std::panic::panic_any`], typically an `io::Error` when a write to a
//! vanished client fails deep inside a handler. [`Fault`] keeps the payload,
//! renders it as text, and tells the recovery layers which kind of failure
//! they are looking at.

use std::any::Any;
use std::fmt;
use std::io;

use crate::error::Error;

/// How a recovered panic should be treated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultKind {
    /// The client connection is gone ("broken pipe", "connection reset by
    /// peer"). Expected operational noise: no stack, no response.
    BrokenPipe,
    /// Anything else: a genuine bug.
    Panic,
}

/// A panic caught at a recovery boundary.
pub struct Fault {
    payload: Box<dyn Any + Send>,
    message: String,
    kind: FaultKind,
}

impl Fault {
    pub fn new(payload: Box<dyn Any + Send>) -> Self {
        let message = describe(payload.as_ref());
        let kind = classify(payload.as_ref(), &message);
        Self { payload, message, kind }
    }

    pub fn message(&self) -> &str { &self.message }
    pub fn kind(&self) -> FaultKind { self.kind }
    pub fn is_broken_pipe(&self) -> bool { self.kind == FaultKind::BrokenPipe }

    /// The raw panic payload.
    pub fn payload(&self) -> &(dyn Any + Send) { self.payload.as_ref() }

    /// Converts the fault into an [`Error`] for [`Context::error`](crate::Context::error).
    ///
    /// Typed `io::Error` and [`Error`] payloads are handed over as-is;
    /// everything else becomes [`Error::Panic`].
    pub fn into_error(self) -> Error {
        let message = self.message;
        match self.payload.downcast::<io::Error>() {
            Ok(err) => Error::Io(*err),
            Err(payload) => match payload.downcast::<Error>() {
                Ok(err) => *err,
                Err(_) => Error::Panic(message),
            },
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

fn describe(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_owned();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    if let Some(err) = payload.downcast_ref::<io::Error>() {
        return with_sources(err);
    }
    if let Some(err) = payload.downcast_ref::<Error>() {
        return with_sources(err);
    }
    if let Some(err) = payload.downcast_ref::<Box<dyn std::error::Error + Send + Sync>>() {
        return with_sources(err.as_ref());
    }
    "non-string panic payload".to_owned()
}

/// `outer: inner: root`, skipping sources whose text the parent already shows.
fn with_sources(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

fn classify(payload: &(dyn Any + Send), message: &str) -> FaultKind {
    let io_kind = payload
        .downcast_ref::<io::Error>()
        .map(io::Error::kind)
        .or_else(|| match payload.downcast_ref::<Error>() {
            Some(Error::Io(e)) => Some(e.kind()),
            _ => None,
        });
    if matches!(io_kind, Some(io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset)) {
        return FaultKind::BrokenPipe;
    }
    if is_broken_pipe_text(message) {
        FaultKind::BrokenPipe
    } else {
        FaultKind::Panic
    }
}

/// Case-insensitive match on the two disconnect phrases.
pub fn is_broken_pipe_text(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("broken pipe") || text.contains("connection reset by peer")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(payload: impl Any + Send) -> Fault {
        Fault::new(Box::new(payload))
    }

    #[test]
    fn str_and_string_payloads() {
        assert_eq!(fault("boom").message(), "boom");
        assert_eq!(fault(String::from("boom")).message(), "boom");
        assert_eq!(fault(42_u8).message(), "non-string panic payload");
    }

    #[test]
    fn disconnect_phrases_any_case() {
        assert!(fault("write tcp: Broken Pipe").is_broken_pipe());
        assert!(fault("read: CONNECTION RESET BY PEER").is_broken_pipe());
        assert!(fault(String::from("broken pipe")).is_broken_pipe());
        assert_eq!(fault("divide by zero").kind(), FaultKind::Panic);
        assert_eq!(fault("connection refused").kind(), FaultKind::Panic);
    }

    #[test]
    fn io_error_kinds_are_disconnects() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        assert!(fault(reset).is_broken_pipe());

        let wrapped = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        assert!(fault(wrapped).is_broken_pipe());

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(!fault(other).is_broken_pipe());
    }

    #[test]
    fn wrapped_source_text_is_matched() {
        let inner = io::Error::new(io::ErrorKind::Other, "connection reset by peer");
        let outer = io::Error::new(io::ErrorKind::Other, Error::other(inner));
        let f = fault(outer);
        assert!(f.is_broken_pipe());
        assert!(f.message().contains("connection reset by peer"));
    }

    #[test]
    fn into_error_keeps_typed_payloads() {
        let err = fault(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).into_error();
        assert!(err.is_disconnect());

        let err = fault("boom").into_error();
        assert!(matches!(err, Error::Panic(ref m) if m == "boom"));
    }
}
