//! HTTP surfaces of the policy server.
//!
//! The external API serves operators and is authenticated with bearer tokens;
//! the internal API serves cell agents over mutually-authenticated TLS.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod auth;
mod error;
mod external;
mod headers;
mod internal;
pub mod metrics;
mod routes;
mod server;
mod wire;


pub use self::{
    auth::{Authenticator, Role, Subject, ADMIN_SCOPE, WRITE_SCOPE},
    external::{ExternalApi, ExternalConfig},
    headers::Cors,
    internal::InternalApi,
    server::{serve, TlsConfig},
    wire::ApiVersion,
};

pub type Body = http_body_util::Full<bytes::Bytes>;

/// Request bodies larger than this are rejected.
const MAX_BODY_BYTES: usize = 1024 * 1024;

fn json_response<T: serde::Serialize>(status: http::StatusCode, value: &T) -> http::Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut rsp = http::Response::new(Body::from(bytes));
            *rsp.status_mut() = status;
            rsp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            rsp
        }
        Err(error) => {
            tracing::error!(%error, "Failed to encode response");
            let mut rsp = http::Response::new(Body::default());
            *rsp.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
            rsp
        }
    }
}

async fn read_json<B, T>(body: B) -> netpol_policy_server_core::Result<T>
where
    B: http_body::Body + Send,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: serde::de::DeserializeOwned,
{
    use http_body_util::BodyExt;

    let bytes = http_body_util::Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|error| {
            netpol_policy_server_core::Error::bad_request(format!(
                "failed to read request body: {error}"
            ))
        })?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|error| {
        netpol_policy_server_core::Error::bad_request(format!("invalid request body: {error}"))
    })
}

/// Reads the `id` query parameter as a comma-separated list of group keys.
///
/// An absent parameter matches every policy.
fn query_filter(query: Option<&str>) -> netpol_policy_server_core::Filter {
    let values = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .filter(|(k, _)| k == "id")
                .map(|(_, v)| v.into_owned())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if values.is_empty() {
        return netpol_policy_server_core::Filter::any();
    }
    netpol_policy_server_core::Filter::keys(
        values
            .iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>(),
    )
}

fn not_found() -> netpol_policy_server_core::Error {
    netpol_policy_server_core::Error::NotFound("not found".to_string())
}

fn method_not_allowed() -> http::Response<Body> {
    #[derive(serde::Serialize)]
    struct ErrorBody {
        error: &'static str,
    }
    json_response(
        http::StatusCode::METHOD_NOT_ALLOWED,
        &ErrorBody {
            error: "method not allowed",
        },
    )
}
