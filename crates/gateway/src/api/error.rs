//! Maps [`ad_domain::error::Error`] onto the HTTP error body spec.md §4.9
//! defines: `{error, detail?, validation_errors?}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use ad_domain::error::Error;

/// One entry in a body-validation failure list, mirroring spec.md §4.9's
/// `{loc, msg, type}` shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationDetail {
    pub loc: Vec<String>,
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Wraps [`Error`] so handlers can `?`-propagate it straight into an HTTP
/// response via [`IntoResponse`], mirroring the teacher's per-handler
/// inline `(StatusCode, Json(...))` pattern but in one place.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

fn body(message: impl Into<String>, detail: Option<String>) -> serde_json::Value {
    let mut obj = serde_json::json!({ "error": message.into() });
    if let Some(detail) = detail {
        obj["detail"] = serde_json::Value::String(detail);
    }
    obj
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, payload) = match &self.0 {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, body("not found", Some(msg.clone()))),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, body("validation error", Some(msg.clone()))),
            Error::Denied(msg) => (StatusCode::FORBIDDEN, body("denied", Some(msg.clone()))),
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, body("configuration error", Some(msg.clone()))),
            Error::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, body("timeout", Some(msg.clone()))),
            Error::Provider { provider, message } => (
                StatusCode::BAD_GATEWAY,
                body("provider error", Some(format!("{provider}: {message}"))),
            ),
            other => (StatusCode::INTERNAL_SERVER_ERROR, body("internal error", Some(other.to_string()))),
        };
        (status, Json(payload)).into_response()
    }
}

/// 422-class failure: the request body parsed as JSON but failed
/// field-level validation before any store was touched.
pub fn validation_failed(details: Vec<ValidationDetail>) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({ "error": "validation error", "validation_errors": details })),
    )
        .into_response()
}

/// Plain `{error: message}` response at an arbitrary status — used for
/// request-shape errors that aren't naturally an [`Error`] variant (name
/// collisions, duplicate keys), mirroring the teacher's `api_error` helper.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(body(message, None))).into_response()
}
