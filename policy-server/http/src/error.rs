use crate::{json_response, Body};
use http::StatusCode;
use netpol_policy_server_core::Error;

#[derive(serde::Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub(crate) fn status(error: &Error) -> StatusCode {
    match error {
        Error::BadRequest(_) | Error::UnsupportedByClientVersion(_) => StatusCode::BAD_REQUEST,
        Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) | Error::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::TagSpaceExhausted { .. } | Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub(crate) fn response(error: &Error) -> http::Response<Body> {
    let status = status(error);
    if status.is_server_error() {
        tracing::warn!(%error, %status, "Request failed");
    } else {
        tracing::debug!(%error, %status, "Request rejected");
    }
    json_response(
        status,
        &ErrorBody {
            error: &error.to_string(),
        },
    )
}
