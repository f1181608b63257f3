use crate::{
    auth::{Authenticator, Role, Subject, ADMIN_SCOPE},
    error, headers, json_response, method_not_allowed,
    metrics::HttpMetrics,
    not_found, query_filter, read_json,
    routes::{self, Recognized, Route},
    wire::{PoliciesRequest, TagJson, TagsResponse},
    ApiVersion, Body, Cors,
};
use futures::future;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use netpol_policy_server_core::{
    Error, Inventory, Policy, PolicyStore, Result, StaleCleanup, TagWidth, UpstreamError,
};
use std::{collections::BTreeSet, convert::Infallible, sync::Arc};
use tokio::time::Instant;

/// The operator-facing policy API.
#[derive(Clone)]
pub struct ExternalApi {
    inner: Arc<Inner>,
}

#[derive(Clone, Debug)]
pub struct ExternalConfig {
    pub tag_width: TagWidth,
    /// Caps the policies a write-scoped caller may attach to one source.
    pub max_policies_per_source: usize,
    /// Whether the listener terminates TLS.
    pub tls: bool,
}

struct Inner {
    store: Arc<dyn PolicyStore>,
    inventory: Arc<dyn Inventory>,
    cleanup: Arc<dyn StaleCleanup>,
    auth: Authenticator,
    cors: Cors,
    config: ExternalConfig,
    metrics: HttpMetrics,
    started: Instant,
}

#[derive(serde::Serialize)]
struct Empty {}

#[derive(serde::Serialize)]
struct Whoami<'a> {
    user_name: &'a str,
}

#[derive(serde::Serialize)]
pub(crate) struct Health {
    pub(crate) uptime_seconds: u64,
}

// === impl ExternalApi ===

impl ExternalApi {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        inventory: Arc<dyn Inventory>,
        cleanup: Arc<dyn StaleCleanup>,
        auth: Authenticator,
        cors: Cors,
        config: ExternalConfig,
        metrics: HttpMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                inventory,
                cleanup,
                auth,
                cors,
                config,
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
        let path = parts.uri.path().to_string();

        let (label, mut rsp) = if parts.method == Method::OPTIONS {
            let rsp = self
                .inner
                .cors
                .preflight(routes::EXTERNAL, &path, &parts.headers);
            ("preflight", rsp)
        } else {
            match routes::recognize(routes::EXTERNAL, &parts.method, &path) {
                Recognized::Found { route, version } => {
                    let rsp = self
                        .dispatch(route, version, &parts, body)
                        .await
                        .unwrap_or_else(|e| error::response(&e));
                    (route.name(), rsp)
                }
                Recognized::MethodNotAllowed => ("unknown", method_not_allowed()),
                Recognized::NotFound => ("unknown", error::response(&not_found())),
            }
        };

        self.inner.cors.apply(&parts.headers, &mut rsp);
        headers::secure(&mut rsp, self.inner.config.tls);
        self.inner.metrics.record("external", label, rsp.status());
        tracing::debug!(method = %parts.method, %path, status = %rsp.status(), "Handled request");
        rsp
    }

    async fn dispatch<B>(
        &self,
        route: Route,
        version: Option<&str>,
        parts: &http::request::Parts,
        body: B,
    ) -> Result<Response<Body>>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match route {
            Route::Root => return Ok(self.root()),
            Route::Health => return Ok(self.health()),
            _ => {}
        }

        let version = version.ok_or_else(not_found)?.parse::<ApiVersion>()?;
        let subject = self.inner.auth.authenticate(&parts.headers).await?;
        tracing::debug!(user = %subject.token.user_name, role = ?subject.role, "Authenticated");

        match route {
            Route::ListPolicies => self.list(version, &subject, parts.uri.query()).await,
            Route::CreatePolicies => {
                let req = read_json::<_, PoliciesRequest>(body).await?;
                self.create(version, &subject, req).await
            }
            Route::DeletePolicies => {
                let req = read_json::<_, PoliciesRequest>(body).await?;
                self.delete(version, &subject, req).await
            }
            Route::Cleanup => self.cleanup(version, &subject).await,
            Route::Tags => self.tags(&subject).await,
            Route::Whoami => Ok(json_response(
                StatusCode::OK,
                &Whoami {
                    user_name: &subject.token.user_name,
                },
            )),
            Route::Root
            | Route::Health
            | Route::InternalPolicies
            | Route::InternalCreateTag => Err(not_found()),
        }
    }

    fn root(&self) -> Response<Body> {
        let uptime = self.inner.started.elapsed().as_secs();
        let mut rsp = Response::new(Body::from(format!(
            "Network policy server, up for {uptime}s\n"
        )));
        rsp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        rsp
    }

    fn health(&self) -> Response<Body> {
        json_response(
            StatusCode::OK,
            &Health {
                uptime_seconds: self.inner.started.elapsed().as_secs(),
            },
        )
    }

    async fn list(
        &self,
        version: ApiVersion,
        subject: &Subject,
        query: Option<&str>,
    ) -> Result<Response<Body>> {
        let mut policies = self.inner.store.list(query_filter(query)).await?;
        if subject.role == Role::Write {
            let visible = self
                .space_check(subject, policies.iter().map(|p| &p.policy))
                .await?;
            let mut visible = visible.into_iter();
            policies.retain(|_| visible.next().unwrap_or(false));
        }
        let rsp = version.encode_tagged(&policies, self.inner.config.tag_width)?;
        Ok(json_response(StatusCode::OK, &rsp))
    }

    async fn create(
        &self,
        version: ApiVersion,
        subject: &Subject,
        req: PoliciesRequest,
    ) -> Result<Response<Body>> {
        let policies = version.decode_all(req.policies)?;
        let quota = match subject.role {
            Role::Admin => None,
            Role::Write => {
                self.authorize(subject, &policies).await?;
                Some(self.inner.config.max_policies_per_source)
            }
        };
        let n = policies.len();
        self.inner.store.create(policies, quota).await?;
        tracing::info!(user = %subject.token.user_name, policies = n, "Created policies");
        Ok(json_response(StatusCode::OK, &Empty {}))
    }

    async fn delete(
        &self,
        version: ApiVersion,
        subject: &Subject,
        req: PoliciesRequest,
    ) -> Result<Response<Body>> {
        let policies = version.decode_all(req.policies)?;
        if subject.role == Role::Write {
            self.authorize(subject, &policies).await?;
        }
        let deleted = self.inner.store.delete(policies).await?;
        tracing::info!(user = %subject.token.user_name, policies = deleted.len(), "Deleted policies");
        Ok(json_response(StatusCode::OK, &Empty {}))
    }

    async fn cleanup(&self, version: ApiVersion, subject: &Subject) -> Result<Response<Body>> {
        require_admin(subject)?;
        let deleted = self.inner.cleanup.delete_stale().await.map_err(|error| {
            Error::Upstream(UpstreamError::retryable("cleanup", format!("{error:#}")))
        })?;
        tracing::info!(user = %subject.token.user_name, policies = deleted.len(), "Cleaned up stale policies");
        let rsp = version.encode_untagged(&deleted)?;
        Ok(json_response(StatusCode::OK, &rsp))
    }

    async fn tags(&self, subject: &Subject) -> Result<Response<Body>> {
        require_admin(subject)?;
        let width = self.inner.config.tag_width;
        let tags = self
            .inner
            .store
            .groups()
            .await?
            .iter()
            .map(|g| TagJson::from_group(g, width))
            .collect();
        Ok(json_response(StatusCode::OK, &TagsResponse { tags }))
    }

    /// Fails unless every policy has an endpoint in one of the subject's
    /// developer spaces.
    async fn authorize(&self, subject: &Subject, policies: &[Policy]) -> Result<()> {
        let permitted = self.space_check(subject, policies.iter()).await?;
        if permitted.into_iter().all(|ok| ok) {
            return Ok(());
        }
        Err(Error::Forbidden(
            "one or more applications cannot be found or accessed".to_string(),
        ))
    }

    /// For each policy, reports whether its source or destination belongs
    /// to a space where the subject is a developer.
    async fn space_check<'p>(
        &self,
        subject: &Subject,
        policies: impl Iterator<Item = &'p Policy> + Clone,
    ) -> Result<Vec<bool>> {
        let keys = policies
            .clone()
            .flat_map(|p| [p.source.clone(), p.destination.clone()])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let spaces = self.inner.inventory.app_spaces(&keys).await?;
        let developer = self
            .inner
            .inventory
            .developer_spaces(&subject.token.user_id)
            .await?;
        let in_developer_space =
            |key: &str| spaces.get(key).is_some_and(|space| developer.contains(space));
        Ok(policies
            .map(|p| in_developer_space(&p.source) || in_developer_space(&p.destination))
            .collect())
    }
}

impl<B> tower::Service<Request<B>> for ExternalApi
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

fn require_admin(subject: &Subject) -> Result<()> {
    if subject.role == Role::Admin {
        return Ok(());
    }
    Err(Error::Forbidden(format!("{ADMIN_SCOPE} scope required")))
}
