use crate::{
    error, external::Health, json_response, method_not_allowed,
    metrics::HttpMetrics,
    not_found, query_filter, read_json,
    routes::{self, Recognized, Route},
    wire::TagJson,
    ApiVersion, Body,
};
use futures::future;
use http::{Request, Response, StatusCode};
use netpol_policy_server_core::{GroupKind, PolicyStore, Result, TagWidth};
use std::{convert::Infallible, sync::Arc};
use tokio::time::Instant;

/// Serves policy snapshots and tag registration to cell agents.
///
/// Callers are authenticated by the TLS layer, not by this service.
#[derive(Clone)]
pub struct InternalApi {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn PolicyStore>,
    tag_width: TagWidth,
    metrics: HttpMetrics,
    started: Instant,
}

// === impl InternalApi ===

impl InternalApi {
    pub fn new(store: Arc<dyn PolicyStore>, tag_width: TagWidth, metrics: HttpMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                tag_width,
                metrics,
                started: Instant::now(),
            }),
        }
    }

    async fn handle<B>(self, req: Request<B>) -> Response<Body>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let (label, rsp) = match routes::recognize(routes::INTERNAL, &parts.method, parts.uri.path())
        {
            Recognized::Found { route, .. } => {
                let rsp = match route {
                    Route::Health => Ok(json_response(
                        StatusCode::OK,
                        &Health {
                            uptime_seconds: self.inner.started.elapsed().as_secs(),
                        },
                    )),
                    Route::InternalPolicies => self.policies(parts.uri.query()).await,
                    Route::InternalCreateTag => self.create_tag(body).await,
                    _ => Err(not_found()),
                };
                (route.name(), rsp.unwrap_or_else(|e| error::response(&e)))
            }
            Recognized::MethodNotAllowed => ("unknown", method_not_allowed()),
            Recognized::NotFound => ("unknown", error::response(&not_found())),
        };
        self.inner.metrics.record("internal", label, rsp.status());
        rsp
    }

    async fn policies(&self, query: Option<&str>) -> Result<Response<Body>> {
        let snapshot = self.inner.store.snapshot(query_filter(query)).await?;
        let rsp = ApiVersion::V1.encode_tagged(&snapshot, self.inner.tag_width)?;
        Ok(json_response(StatusCode::OK, &rsp))
    }

    async fn create_tag<B>(&self, body: B) -> Result<Response<Body>>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let req = read_json::<_, TagJson>(body).await?;
        let kind = req.kind.parse::<GroupKind>()?;
        let group = self.inner.store.ensure_tag(req.id, kind).await?;
        tracing::info!(key = %group.key, tag = %group.tag, %kind, "Registered group");
        Ok(json_response(
            StatusCode::OK,
            &TagJson::from_group(&group, self.inner.tag_width),
        ))
    }
}

impl<B> tower::Service<Request<B>> for InternalApi
where
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Infallible>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let api = self.clone();
        Box::pin(async move { Ok(api.handle(req).await) })
    }
}
