// REST error rendering: every failure becomes `{"detail": "..."}` with the
// matching status code.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    (status, Json(json!({ "detail": message }))).into_response()
}

pub fn bad_request(message: impl Into<String>) -> Response {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub fn not_found(message: impl Into<String>) -> Response {
    error_response(StatusCode::NOT_FOUND, message)
}

pub fn internal_error(err: anyhow::Error) -> Response {
    // Store failures carry paths and SQL details; keep those out of bodies.
    tracing::error!(error = %err, "internal error");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    #[tokio::test]
    async fn error_body_is_a_flat_detail_string() {
        let response = not_found("gateway not found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let payload: Value = serde_json::from_slice(&body).expect("parse body");
        assert_eq!(payload, json!({ "detail": "gateway not found" }));
    }

    #[tokio::test]
    async fn internal_error_hides_the_cause() {
        let response = internal_error(anyhow::anyhow!("/var/db/secret path busted"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let payload: Value = serde_json::from_slice(&body).expect("parse body");
        assert_eq!(payload["detail"], "internal error");
    }
}
