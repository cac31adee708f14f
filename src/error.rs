//! API error type and its HTTP mapping.

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::response::{ApiResponse, respond};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    PayloadTooLarge(String),
    UnsupportedMediaType(String),
    /// `public` goes to the client, `detail` only to the log.
    Internal {
        public: &'static str,
        detail: String,
    },
    TooManyRequests(u64),
    MissingClientAddr,
}

impl ApiError {
    pub fn internal(public: &'static str, detail: impl ToString) -> Self {
        ApiError::Internal {
            public,
            detail: detail.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Internal { .. } | ApiError::MissingClientAddr => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ApiError::BadRequest(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::UnsupportedMediaType(msg) => respond(status, ApiResponse::failure(msg)),
            ApiError::Internal { public, detail } => {
                error!(error = %detail, "{public}");
                respond(status, ApiResponse::failure(public))
            }
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (status, headers, "too many requests").into_response()
            }
            ApiError::MissingClientAddr => (status, "internal server error").into_response(),
        }
    }
}
