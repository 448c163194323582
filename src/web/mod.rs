//! HTTP surface of the admission controller
//!
//! [`admission_gate`] is an axum middleware: mount it with
//! `axum::middleware::from_fn_with_state(controller, admission_gate)`. It
//! reads the caller's [`SessionContext`] from the request extensions, which
//! an outer layer (cookie or auth middleware) is expected to insert.

use crate::admission::{Admission, AdmissionController, BusyNotice, SessionContext};
use crate::core::DbError;
use axum::Json;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Data-access failure surfaced to an HTTP client
#[derive(Debug)]
pub struct WebError(pub DbError);

impl From<DbError> for WebError {
    fn from(err: DbError) -> Self {
        WebError(err)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            DbError::PoolExhausted { .. }
            | DbError::PoolUnavailable { .. }
            | DbError::PoolClosed
            | DbError::ConnectionLost(_) => (StatusCode::SERVICE_UNAVAILABLE, "database_unavailable"),
            DbError::CapacityCheckFailed(_) => (StatusCode::SERVICE_UNAVAILABLE, "capacity_unknown"),
            DbError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "misconfigured"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
        };

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WebError>;

/// 503 response carrying a [`BusyNotice`]
///
/// Rendered as JSON for clients that accept it, otherwise as an HTML page
/// that counts down and reloads after `retry_after_secs`.
#[derive(Debug, Clone)]
pub struct BusyResponse {
    pub notice: BusyNotice,
    pub json: bool,
}

impl BusyResponse {
    pub fn for_request(notice: BusyNotice, headers: &HeaderMap) -> Self {
        Self {
            notice,
            json: accepts_json(headers),
        }
    }
}

impl IntoResponse for BusyResponse {
    fn into_response(self) -> Response {
        let retry_after = HeaderValue::from(self.notice.retry_after_secs);
        let body = if self.json {
            Json(self.notice).into_response()
        } else {
            Html(render_busy_page(&self.notice)).into_response()
        };

        (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, retry_after)],
            body,
        )
            .into_response()
    }
}

/// Turn requests away with a [`BusyResponse`] while the site is at capacity
pub async fn admission_gate(
    State(controller): State<Arc<AdmissionController>>,
    request: Request,
    next: Next,
) -> Response {
    let session = request.extensions().get::<SessionContext>().cloned();

    match controller.admit(session.as_ref()).await {
        Admission::Admitted => next.run(request).await,
        Admission::Busy(notice) => BusyResponse::for_request(notice, request.headers()).into_response(),
    }
}

fn accepts_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}

fn render_busy_page(notice: &BusyNotice) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>We're at capacity</title>
<meta http-equiv="refresh" content="{retry}">
</head>
<body>
<main>
<h1>We're a little busy right now</h1>
<p>{active} of {max} places are taken. Please try again in <span id="countdown">{retry}</span> seconds.</p>
<p><a href="">Try again now</a></p>
</main>
<script>
let remaining = {retry};
const label = document.getElementById("countdown");
setInterval(() => {{
  remaining = Math.max(remaining - 1, 0);
  label.textContent = remaining;
  if (remaining === 0) window.location.reload();
}}, 1000);
</script>
</body>
</html>
"#,
        active = notice.active_users,
        max = notice.max_users,
        retry = notice.retry_after_secs,
    )
}
