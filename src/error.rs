//! 统一错误处理
//!
//! - 各层用 thiserror 定义自己的错误枚举，并实现 [`ErrorCode`] 给出稳定的机器码
//! - `ApiError` 实现 `IntoResponse`，只用于传输层错误（401/404/400）
//! - 业务失败以 `{success:false, error}` 形式返回，不走 HTTP 错误码

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::domain::remote::ErrorInfo;

/// 带机器码的错误
pub trait ErrorCode: std::error::Error {
    /// 稳定的错误标识（snake_case）
    fn code(&self) -> &'static str;

    /// 诊断信息（日志、inspect 输出等）
    fn details(&self) -> Option<String> {
        None
    }

    fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            error: self.code().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

/// 传输层错误（业务失败不走这里）
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid or missing API key")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl ErrorCode for ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_error_info())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
