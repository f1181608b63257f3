use crate::{routes, Body};
use http::{header, HeaderMap, HeaderValue, Response, StatusCode};

const ALLOWED_HEADERS: &str = "authorization, content-type";
const PREFLIGHT_MAX_AGE: &str = "600";
const STRICT_TRANSPORT_SECURITY: &str = "max-age=31536000";

/// Cross-origin policy for browser clients.
#[derive(Clone, Debug, Default)]
pub struct Cors {
    origins: Vec<String>,
}

// === impl Cors ===

impl Cors {
    /// Allows the given origins. A `*` entry allows every origin.
    pub fn new(origins: impl IntoIterator<Item = String>) -> Self {
        Self {
            origins: origins
                .into_iter()
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }

    fn allowed_origin(&self, headers: &HeaderMap) -> Option<HeaderValue> {
        let origin = headers.get(header::ORIGIN)?;
        let value = origin.to_str().ok()?;
        self.origins
            .iter()
            .any(|o| o == "*" || o == value)
            .then(|| origin.clone())
    }

    /// Adds the allow-origin header to `rsp` if the request's origin is
    /// allowed.
    pub(crate) fn apply(&self, request: &HeaderMap, rsp: &mut Response<Body>) {
        if let Some(origin) = self.allowed_origin(request) {
            let headers = rsp.headers_mut();
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            headers.append(header::VARY, HeaderValue::from_static("origin"));
        }
    }

    /// Answers an `OPTIONS` request from the route table.
    pub(crate) fn preflight(
        &self,
        table: &[routes::Entry],
        path: &str,
        request: &HeaderMap,
    ) -> Response<Body> {
        let methods = routes::allowed_methods(table, path);
        if methods.is_empty() {
            let mut rsp = Response::new(Body::default());
            *rsp.status_mut() = StatusCode::NOT_FOUND;
            return rsp;
        }

        let allow = methods
            .into_iter()
            .chain(Some("OPTIONS"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut rsp = Response::new(Body::default());
        let headers = rsp.headers_mut();
        if let Ok(allow) = HeaderValue::from_str(&allow) {
            headers.insert(header::ALLOW, allow.clone());
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, allow);
        }
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        );
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(PREFLIGHT_MAX_AGE),
        );
        self.apply(request, &mut rsp);
        rsp
    }
}

pub(crate) fn secure(rsp: &mut Response<Body>, tls: bool) {
    let headers = rsp.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("0"));
    if tls {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(STRICT_TRANSPORT_SECURITY),
        );
    }
}
