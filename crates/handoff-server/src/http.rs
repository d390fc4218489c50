//! HTTP surface and per-connection serving.
//!
//! The router is served over each accepted connection with hyper-util's auto
//! (HTTP/1 + HTTP/2) builder. When the runtime starts draining, connections
//! finish the request in flight and close instead of idling until the drain
//! deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Request,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use handoff::{Connection, ConnectionHandler};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use serde_json::json;
use tokio::sync::Notify;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::telemetry;

/// Body returned by `GET /hello`.
pub const HELLO_BODY: &str = "hello world233333";

/// Response header naming the process that served the request.
pub const PID_HEADER: &str = "x-handoff-pid";

/// How long a connection accepted just before draining gets to send its
/// first request before it is closed.
const FIRST_REQUEST_GRACE: Duration = Duration::from_secs(5);

pub fn create_router() -> Router {
    Router::new()
        .route("/hello", get(hello))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
}

async fn hello() -> impl IntoResponse {
    telemetry::metrics::hello_requests().add(1, &[]);
    ([(PID_HEADER, std::process::id().to_string())], HELLO_BODY)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "handoff-server",
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serves the router on every connection the runtime accepts.
#[derive(Clone)]
pub struct HttpHandler {
    router: Router,
}

impl HttpHandler {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

impl ConnectionHandler for HttpHandler {
    fn handle(&self, conn: Connection) -> impl Future<Output = ()> + Send {
        serve_connection(self.router.clone(), conn)
    }
}

async fn serve_connection(router: Router, conn: Connection) {
    let draining = conn.draining();
    let peer = conn.peer;
    let io = TokioIo::new(conn.stream);

    let requests_seen = Arc::new(Notify::new());
    let service = {
        let requests_seen = Arc::clone(&requests_seen);
        hyper::service::service_fn(move |request: Request<Incoming>| {
            requests_seen.notify_one();
            router.clone().oneshot(request)
        })
    };

    let builder = Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(io, service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Connection ended with error");
            }
            return;
        }
        _ = draining.cancelled() => {}
    }

    // Draining: a connection accepted just before the listener stopped may
    // not have sent its request yet. Wait for it (bounded) so it is answered.
    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Connection ended with error");
            }
            return;
        }
        _ = requests_seen.notified() => {}
        _ = tokio::time::sleep(FIRST_REQUEST_GRACE) => {}
    }

    debug!(peer = %peer, "Draining, closing connection after in-flight request");
    connection.as_mut().graceful_shutdown();
    if let Err(e) = connection.await {
        debug!(peer = %peer, error = %e, "Connection ended with error");
    }
}
