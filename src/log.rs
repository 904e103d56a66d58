//! Log sinks for recovery reports.
//!
//! [`RecoveryPro`](crate::middleware::RecoveryPro) renders one multi-line
//! record per recovered panic and hands it to a [`LogSink`] injected at
//! construction. Sinks are shared by every request, so they must tolerate
//! concurrent writes.

use std::io::Write;
use std::sync::Mutex;

use tracing::error;

/// Destination for pre-formatted recovery records.
pub trait LogSink: Send + Sync {
    fn write(&self, record: &str);
}

/// Forwards records to `tracing` at `ERROR` level. The default sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, record: &str) {
        error!(target: "strata::recovery", "{record}");
    }
}

/// Any writer behind a mutex: `Mutex<Vec<u8>>`, `Mutex<File>`, `Mutex<Stderr>`.
///
/// Each record is written as one line-terminated block. Write failures and a
/// poisoned lock are ignored: losing a log line must never fail a request.
impl<W: Write + Send> LogSink for Mutex<W> {
    fn write(&self, record: &str) {
        let mut out = match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(out, "{record}");
        let _ = out.flush();
    }
}

impl<S: LogSink + ?Sized> LogSink for std::sync::Arc<S> {
    fn write(&self, record: &str) {
        (**self).write(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_writer_appends_lines() {
        let sink = Mutex::new(Vec::<u8>::new());
        sink.write("first");
        sink.write("second\nrecord");

        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(text, "first\nsecond\nrecord\n");
    }
}
