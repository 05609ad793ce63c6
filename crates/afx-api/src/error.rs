//! Control-plane error envelope.
//!
//! Business rejections surface to the caller with a stable error code;
//! infrastructure failures collapse to 503 without leaking internals.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use afx_client::ClientError;
use afx_store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid caller identity")]
    Unauthorized,

    #[error("admin access required")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("plan limit exceeded: {0}")]
    PlanLimitExceeded(String),

    #[error("platform rejected the request: {0}")]
    Platform(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::PlanLimitExceeded(_) => "plan_limit_exceeded",
            ApiError::Platform(_) => "platform_error",
            ApiError::Unavailable(_) => "system_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden | ApiError::PlanLimitExceeded(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Platform(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Conflict(what) => ApiError::Conflict(what),
            StoreError::Unavailable(e) => ApiError::Unavailable(e.to_string()),
            StoreError::Corrupt(what) => ApiError::Unavailable(what),
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Platform(pe) => ApiError::Platform(pe.to_string()),
            ClientError::SessionNotOpen(id) => {
                ApiError::Conflict(format!("session {id} is not connected"))
            }
            ClientError::SessionNotUsable(id) => {
                ApiError::Conflict(format!("session {id} is not authorized"))
            }
            ClientError::Store(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
