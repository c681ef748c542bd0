use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::HubError;

/// Structured API error that serializes to JSON.
#[derive(Debug)]
pub enum ApiError {
    RoomNotFound(String),
    InternalError(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::RoomNotFound(code) => (
                StatusCode::NOT_FOUND,
                "ROOM_NOT_FOUND",
                format!("Room not found: {code}"),
            ),
            ApiError::InternalError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::RoomNotFound(code) => ApiError::RoomNotFound(code),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn error_to_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        (status, json)
    }

    #[tokio::test]
    async fn room_not_found_returns_404() {
        let (status, json) = error_to_json(ApiError::RoomNotFound("ABC123".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "ROOM_NOT_FOUND");
        assert_eq!(json["error"]["message"], "Room not found: ABC123");
    }

    #[tokio::test]
    async fn internal_error_returns_500() {
        let (status, json) = error_to_json(ApiError::InternalError("oops".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["code"], "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn hub_error_converts_to_api_error() {
        let (status, json) = error_to_json(HubError::RoomNotFound("ZZZ999".into()).into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "ROOM_NOT_FOUND");

        let (status, _) = error_to_json(HubError::HubClosed.into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
