//! Built-in middleware.
//!
//! Both recovery layers belong at the front of the pipeline: a panic is only
//! contained by a recovery layer that encloses the handler that raised it.
//!
//! - [`Recovery`]: catch, log through `tracing`, answer `500` with a JSON
//!   body. Enough for most services.
//! - [`RecoveryPro`]: tells disconnects apart from bugs, logs a stack trace
//!   with the `Authorization` header redacted, and lets you decide how the
//!   response is shaped.

mod recovery;
mod recovery_pro;

pub use recovery::Recovery;
pub use recovery_pro::{
    GUARD_FRAMES, RecoveryFunc, RecoveryPro, default_handle_recovery, sanitize_dump,
};
