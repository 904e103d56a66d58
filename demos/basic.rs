//! Minimal strata example: a recovering pipeline served by hyper.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/hello
//!   curl -i http://localhost:3000/boom -H 'authorization: Bearer abc123'
//!   curl -i http://localhost:3000/motd
//!
//! `/boom` panics; the recovery layer logs the redacted request with a stack
//! trace and answers `500`. The server keeps running.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http::StatusCode;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use strata::middleware::RecoveryPro;
use strata::{Container, Error, NewInstance, Param, Pipeline, ServiceProvider, handler_fn};
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let container = Arc::new(Container::new());
    container.bind(Motd)?;

    let pipeline = Pipeline::new()
        .container(container)
        .handler(RecoveryPro::new())
        .handler(handler_fn(|cx| Box::pin(async move {
            let started = Instant::now();
            cx.next().await;
            info!(
                method = %cx.request().method(),
                path = cx.request().path(),
                status = cx.response().status().as_u16(),
                elapsed = ?started.elapsed(),
                "request",
            );
            Ok(())
        })))
        .handler(handler_fn(|cx| Box::pin(async move {
            let path = cx.request().path().to_owned();
            match path.as_str() {
                "/hello" => {
                    cx.text("hello, world");
                }
                "/motd" => {
                    let motd = cx.make::<String>("motd")?;
                    cx.json(&serde_json::json!({ "motd": motd.as_str() }));
                }
                "/boom" => {
                    let items: Vec<u32> = Vec::new();
                    let index = std::hint::black_box(3);
                    cx.text(items[index].to_string());
                }
                _ => {
                    cx.abort_with_status(StatusCode::NOT_FOUND);
                }
            }
            Ok(())
        })));

    serve("0.0.0.0:3000".parse::<SocketAddr>().map_err(Error::other)?, pipeline).await
}

/// Accepts connections until a shutdown signal, then drains in-flight ones.
async fn serve(addr: SocketAddr, pipeline: Pipeline) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;

    // One pipeline for every connection. It is immutable after construction,
    // so sharing it needs an Arc and nothing else.
    let pipeline = Arc::new(pipeline);

    info!(%addr, "strata demo listening");

    // Connection tasks live in a JoinSet so shutdown can wait for them.
    let mut tasks = tokio::task::JoinSet::new();

    // Polled by reference on every turn of the loop, hence pinned once here.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Check the signal before accepting, so a queued connection
            // cannot delay shutdown.
            biased;

            () = &mut shutdown => {
                info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, remote_addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let pipeline = Arc::clone(&pipeline);
                let io = TokioIo::new(stream);

                tasks.spawn(async move {
                    // Called per request, not per connection. A panic inside
                    // the handlers stops at RecoveryPro, so this future
                    // always resolves to a response.
                    let svc = service_fn(move |req| {
                        let pipeline = Arc::clone(&pipeline);
                        async move { pipeline.dispatch(req).await }
                    });

                    // HTTP/1.1 or HTTP/2, whichever the client speaks.
                    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection(io, svc)
                        .await
                    {
                        error!(peer = %remote_addr, "connection error: {e}");
                    }
                });
            }

            // Reap finished connections as we go.
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    // No new connections from here on; let the open ones finish.
    while tasks.join_next().await.is_some() {}

    info!("strata demo stopped");
    Ok(())
}

/// Resolves on SIGTERM or Ctrl-C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

/// Message of the day, built the first time a handler asks for it.
struct Motd;

impl ServiceProvider for Motd {
    fn register(&self, _container: &Container) -> NewInstance {
        Box::new(|_params: &[Param]| -> Result<strata::Instance, Box<dyn std::error::Error + Send + Sync>> {
            Ok(Arc::new(String::from("panics are contained, not fatal")) as strata::Instance)
        })
    }

    fn boot(&self, _container: &Container) -> Result<(), Error> { Ok(()) }
    fn is_defer(&self) -> bool { true }
    fn params(&self, _container: &Container) -> Vec<Param> { Vec::new() }
    fn name(&self) -> &str { "motd" }
}
