//! Integration tests for panic containment: both recovery layers, disconnect
//! handling, request redaction, and stack reporting.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use strata::middleware::{Recovery, RecoveryPro};
use strata::{Context, Fault, FaultKind, HandlerResult, Pipeline, Request, handler_fn};

type Log = Arc<Mutex<Vec<u8>>>;

fn get(path: &str) -> Request {
    http::Request::get(path)
        .header("host", "shop.local")
        .header("authorization", "Bearer abc123")
        .body(Bytes::new())
        .unwrap()
        .into()
}

async fn body_of(response: http::Response<Full<Bytes>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn text_of(log: &Log) -> String {
    String::from_utf8(log.lock().unwrap().clone()).unwrap()
}

/// Captures `tracing` output for the current thread while the guard lives.
fn capture_tracing() -> (Log, tracing::subscriber::DefaultGuard) {
    #[derive(Clone)]
    struct Sink(Log);

    impl io::Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> { Ok(()) }
    }

    let log = Log::default();
    let sink = Sink(Arc::clone(&log));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .finish();
    (log, tracing::subscriber::set_default(subscriber))
}

async fn explode(message: &str) -> HandlerResult {
    panic!("{message}")
}

fn divide(cx: &mut Context) {
    let zero = std::hint::black_box(0u32);
    cx.text((10 / zero).to_string());
}

async fn reset() -> HandlerResult {
    std::panic::panic_any(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
}

async fn sever() -> HandlerResult {
    std::panic::panic_any(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
}

// ── Recovery ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn recovery_turns_a_panic_into_500() {
    let (log, _guard) = capture_tracing();
    let pipeline = Pipeline::with_recovery().handler(handler_fn(|cx| Box::pin(async move {
        divide(cx);
        Ok(())
    })));

    let response = pipeline.handle(get("/quotient")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()["content-type"], "application/json");
    let body: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
    assert!(body["error"].as_str().unwrap().contains("divide by zero"));

    let logged = text_of(&log);
    assert!(logged.contains("panic recovered"), "{logged}");
    assert!(logged.contains("divide by zero"), "{logged}");
}

#[tokio::test]
async fn recovery_contains_panics_from_deep_in_the_chain() {
    let after = Arc::new(AtomicBool::new(false));
    let mid = {
        let after = Arc::clone(&after);
        handler_fn(move |cx| {
            let after = Arc::clone(&after);
            Box::pin(async move {
                cx.next().await;
                after.store(true, Ordering::SeqCst);
                Ok(())
            })
        })
    };
    let pipeline = Pipeline::with_recovery()
        .handler(mid)
        .handler(handler_fn(|_cx| Box::pin(explode("deep failure"))));

    let response = pipeline.handle(get("/")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    // the unwind skipped the rest of every frame between the panic and Recovery
    assert!(!after.load(Ordering::SeqCst));
}

#[tokio::test]
async fn recovery_discards_a_partial_response() {
    let pipeline = Pipeline::with_recovery().handler(handler_fn(|cx| Box::pin(async move {
        cx.header("x-partial", "1").text("half a page");
        explode("render failed").await
    })));

    let response = pipeline.handle(get("/")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get("x-partial").is_none());
    assert_eq!(body_of(response).await, r#"{"error":"render failed"}"#);
}

#[tokio::test]
async fn recovery_handles_panics_after_next() {
    let pipeline = Pipeline::with_recovery()
        .handler(handler_fn(|cx| Box::pin(async move {
            cx.next().await;
            explode("post-processing failed").await
        })))
        .handler(handler_fn(|cx| Box::pin(async move {
            cx.set_status(StatusCode::ACCEPTED);
            Ok(())
        })));

    let response = pipeline.handle(get("/")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

// ── RecoveryPro ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn disconnect_is_logged_without_stack_and_left_unanswered() {
    let log = Log::default();
    let handled = Arc::new(AtomicBool::new(false));
    let recovery = {
        let handled = Arc::clone(&handled);
        RecoveryPro::custom(move |cx, _fault| {
            handled.store(true, Ordering::SeqCst);
            cx.abort_with_status(StatusCode::INTERNAL_SERVER_ERROR);
        })
        .logger(Arc::clone(&log))
    };
    let pipeline = Pipeline::new()
        .handler(recovery)
        .handler(handler_fn(|_cx| Box::pin(reset())));

    let mut cx = pipeline.context(get("/stream"));
    pipeline.run(&mut cx).await;

    assert!(cx.is_aborted());
    assert!(!handled.load(Ordering::SeqCst));
    assert!(cx.last_error().is_some_and(strata::Error::is_disconnect));
    assert!(!cx.response().is_committed());
    assert!(cx.response().body().is_empty());

    let logged = text_of(&log);
    assert!(logged.starts_with("connection reset by peer\n"), "{logged}");
    assert!(logged.contains("Authorization: *"), "{logged}");
    assert!(!logged.contains("abc123"));
    assert!(!logged.contains("[Recovery]"));
    assert!(!logged.contains(" (0x"), "no stack expected: {logged}");
}

#[tokio::test]
async fn disconnect_drops_what_the_handler_buffered() {
    let pipeline = Pipeline::new()
        .handler(RecoveryPro::new().without_logger())
        .handler(handler_fn(|cx| Box::pin(async move {
            cx.header("x-partial", "1").text("partial");
            sever().await
        })));

    let mut cx = pipeline.context(get("/download"));
    pipeline.run(&mut cx).await;

    assert!(cx.is_aborted());
    assert!(cx.last_error().is_some_and(strata::Error::is_disconnect));
    assert!(!cx.response().is_committed());
    assert!(!cx.response().is_status_set());
    assert!(cx.response().headers().get("x-partial").is_none());
    assert!(cx.response().body().is_empty());
}

#[tokio::test]
async fn disconnect_is_recognised_from_the_message_alone() {
    let log = Log::default();
    let pipeline = Pipeline::new()
        .handler(RecoveryPro::new().logger(Arc::clone(&log)))
        .handler(handler_fn(|_cx| Box::pin(explode("write tcp 10.0.0.1:80: write: Broken Pipe"))));

    let mut cx = pipeline.context(get("/"));
    pipeline.run(&mut cx).await;

    assert!(cx.is_aborted());
    assert!(matches!(cx.last_error(), Some(strata::Error::Panic(_))));
    assert!(!text_of(&log).contains("[Recovery]"));
}

#[tokio::test]
async fn generic_fault_logs_timestamp_stack_and_redacted_request() {
    let log = Log::default();
    let pipeline = Pipeline::new()
        .handler(RecoveryPro::new().logger(Arc::clone(&log)))
        .handler(handler_fn(|_cx| Box::pin(explode("index out of range"))));

    let mut cx = pipeline.context(get("/orders?page=2"));
    pipeline.run(&mut cx).await;

    assert!(cx.is_aborted());
    assert_eq!(cx.response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(cx.response().body().is_empty());

    let logged = text_of(&log);
    assert!(logged.starts_with("[Recovery] "), "{logged}");
    assert!(logged.contains(" panic recovered:\nindex out of range\n"), "{logged}");
    assert!(logged.contains(" (0x"), "stack expected: {logged}");
    assert!(logged.contains("GET /orders?page=2 HTTP/1.1\r\n"), "{logged}");
    assert!(logged.contains("Authorization: *"));
    assert!(!logged.contains("abc123"));
}

#[tokio::test]
async fn default_policy_overrides_an_earlier_status() {
    let pipeline = Pipeline::new()
        .handler(RecoveryPro::new().without_logger())
        .handler(handler_fn(|cx| Box::pin(async move {
            cx.set_status(StatusCode::CREATED);
            explode("after choosing a status").await
        })));

    let response = pipeline.handle(get("/")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn default_policy_discards_a_partial_body() {
    let pipeline = Pipeline::new()
        .handler(RecoveryPro::new().without_logger())
        .handler(handler_fn(|cx| Box::pin(async move {
            cx.header("x-partial", "1").text("partial secret");
            explode("halfway through the body").await
        })));

    let response = pipeline.handle(get("/")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get("x-partial").is_none());
    assert!(body_of(response).await.is_empty());
}

#[tokio::test]
async fn custom_handle_decides_the_response() {
    let seen = Arc::new(Mutex::new(None::<(FaultKind, String)>));
    let recovery = {
        let seen = Arc::clone(&seen);
        RecoveryPro::custom(move |cx, fault: Fault| {
            *seen.lock().unwrap() = Some((fault.kind(), fault.message().to_owned()));
            cx.response_mut().discard();
            cx.set_status(StatusCode::SERVICE_UNAVAILABLE).text("try again later");
            cx.abort();
        })
        .without_logger()
    };
    let pipeline = Pipeline::new()
        .handler(recovery)
        .handler(handler_fn(|cx| Box::pin(async move {
            cx.text("partial");
            explode("pool exhausted").await
        })));

    let response = pipeline.handle(get("/")).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_of(response).await, "try again later");
    assert_eq!(
        seen.lock().unwrap().clone(),
        Some((FaultKind::Panic, "pool exhausted".to_owned())),
    );
}

#[tokio::test]
async fn silent_recovery_still_answers() {
    let pipeline = Pipeline::new()
        .handler(RecoveryPro::new().without_logger())
        .handler(handler_fn(|_cx| Box::pin(explode("quiet"))));

    let response = pipeline.handle(get("/")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn innermost_recovery_wins() {
    let log = Log::default();
    let pipeline = Pipeline::new()
        .handler(RecoveryPro::new().logger(Arc::clone(&log)))
        .handler(Recovery)
        .handler(handler_fn(|_cx| Box::pin(explode("inner"))));

    let response = pipeline.handle(get("/")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_of(response).await, r#"{"error":"inner"}"#);
    assert!(text_of(&log).is_empty());
}

#[tokio::test]
async fn panic_in_code_after_next_is_recovered() {
    let log = Log::default();
    let pipeline = Pipeline::new()
        .handler(RecoveryPro::new().logger(Arc::clone(&log)))
        .handler(handler_fn(|cx| Box::pin(async move {
            cx.next().await;
            explode("after next").await
        })))
        .handler(handler_fn(|_cx| Box::pin(async move { Ok(()) })));

    let response = pipeline.handle(get("/")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(text_of(&log).contains("\nafter next\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_recover_independently() {
    let log = Log::default();
    let pipeline = Arc::new(
        Pipeline::new()
            .handler(RecoveryPro::new().logger(Arc::clone(&log)))
            .handler(handler_fn(|cx| Box::pin(async move {
                tokio::task::yield_now().await;
                if cx.request().path().ends_with("/boom") {
                    return explode("boom").await;
                }
                cx.text("fine");
                Ok(())
            }))),
    );

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..32 {
        let pipeline = Arc::clone(&pipeline);
        tasks.spawn(async move {
            let path = if i % 2 == 0 { format!("/{i}/boom") } else { format!("/{i}/ok") };
            let response = pipeline.handle(get(&path)).await;
            (i, response.status())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (i, status) = joined.unwrap();
        let expected = if i % 2 == 0 { StatusCode::INTERNAL_SERVER_ERROR } else { StatusCode::OK };
        assert_eq!(status, expected, "request {i}");
    }
    assert_eq!(text_of(&log).matches("[Recovery]").count(), 16);
}
