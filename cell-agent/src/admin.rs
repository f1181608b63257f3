//! The agent's admin server: health, metrics, and the runtime switch for
//! logging denied packets.

use futures::future;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Limited};
use netpol_policy_server_http::Body;
use prometheus_client::{encoding::text, registry::Registry};
use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tracing::info;

const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";
const LOGGING_PATH: &str = "/iptables-c2c-logging";

/// Whether the planner emits LOG rules ahead of each drop.
#[derive(Clone, Debug, Default)]
pub struct LoggingState(Arc<AtomicBool>);

#[derive(Clone)]
pub(crate) struct Admin {
    registry: Arc<Registry>,
    logging: LoggingState,
    ready: Arc<AtomicBool>,
}

#[derive(Debug, Deserialize, Serialize)]
struct LoggingJson {
    enabled: bool,
}

// === impl LoggingState ===

impl LoggingState {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Release);
    }
}

// === impl Admin ===

impl Admin {
    pub(crate) fn new(registry: Registry, logging: LoggingState) -> Self {
        Self {
            registry: Arc::new(registry),
            logging,
            ready: Default::default(),
        }
    }

    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    async fn handle<B>(self, req: Request<B>) -> Response<Body>
    where
        B: http_body::Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        match (&parts.method, parts.uri.path()) {
            (&Method::GET, "/live") => plain(StatusCode::OK, "live\n"),
            (&Method::GET, "/ready") if self.ready.load(Ordering::Acquire) => {
                plain(StatusCode::OK, "ready\n")
            }
            (&Method::GET, "/ready") => plain(StatusCode::SERVICE_UNAVAILABLE, "not ready\n"),
            (&Method::GET, "/metrics") => self.metrics(),
            (&Method::GET, LOGGING_PATH) => json(
                StatusCode::OK,
                &LoggingJson {
                    enabled: self.logging.enabled(),
                },
            ),
            (&Method::PUT, LOGGING_PATH) => self.set_logging(body).await,
            (_, "/live" | "/ready" | "/metrics" | LOGGING_PATH) => {
                plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n")
            }
            _ => plain(StatusCode::NOT_FOUND, "not found\n"),
        }
    }

    async fn set_logging<B>(&self, body: B) -> Response<Body>
    where
        B: http_body::Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let bytes = match Limited::new(body, 1024).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                return json(
                    StatusCode::BAD_REQUEST,
                    &serde_json::json!({ "error": format!("failed to read request body: {error}") }),
                )
            }
        };
        let req = match serde_json::from_slice::<LoggingJson>(&bytes) {
            Ok(req) => req,
            Err(error) => {
                return json(
                    StatusCode::BAD_REQUEST,
                    &serde_json::json!({ "error": format!("invalid request body: {error}") }),
                )
            }
        };
        self.logging.set(req.enabled);
        info!(enabled = req.enabled, "Changed denied packet logging");
        json(StatusCode::OK, &req)
    }

    fn metrics(&self) -> Response<Body> {
        let mut buf = String::new();
        if let Err(error) = text::encode(&mut buf, &self.registry) {
            tracing::error!(%error, "Failed to encode metrics");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n");
        }
        let mut rsp = Response::new(Body::from(buf));
        rsp.headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(OPENMETRICS));
        rsp
    }
}

impl<B> tower::Service<Request<B>> for Admin
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let admin = self.clone();
        Box::pin(async move { Ok(admin.handle(req).await) })
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = status;
    rsp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    rsp
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut rsp = Response::new(Body::from(bytes));
            *rsp.status_mut() = status;
            rsp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            rsp
        }
        Err(error) => {
            tracing::error!(%error, "Failed to encode response");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode response\n")
        }
    }
}
