//! Basic panic recovery.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use http::StatusCode;
use serde_json::json;
use tracing::error;

use crate::context::Context;
use crate::fault::Fault;
use crate::handler::{BoxFuture, Handler, HandlerResult};
use super::recovery_pro::take_panic_trace;

/// Catches any panic raised downstream and turns it into a `500`.
///
/// Whatever the failed handlers had buffered is discarded; the response
/// becomes `500 Internal Server Error` with body `{"error": "<panic message>"}`.
/// Every recovered panic is logged at `ERROR`. The panic never propagates
/// past this layer.
///
/// ```rust
/// use strata::Pipeline;
/// use strata::middleware::Recovery;
///
/// let pipeline = Pipeline::new().handler(Recovery);
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Recovery;

impl Handler for Recovery {
    fn call<'a>(&'a self, cx: &'a mut Context) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let outcome = AssertUnwindSafe(cx.next()).catch_unwind().await;
            if let Err(payload) = outcome {
                // an enclosing RecoveryPro must not report this panic's trace later
                take_panic_trace();
                let fault = Fault::new(payload);
                error!(panic = %fault, method = %cx.request().method(), path = cx.request().path(), "panic recovered");

                cx.response_mut().discard();
                cx.set_status(StatusCode::INTERNAL_SERVER_ERROR)
                    .json(&json!({ "error": fault.message() }));
            }
            Ok(())
        })
    }
}
