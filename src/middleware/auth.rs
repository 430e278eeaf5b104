//! API Key 认证
//!
//! `RequireApiKey` extractor：除 /health 外的所有端点都要求 `x-api-key`

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// API Key 认证 Extractor
#[derive(Debug, Clone)]
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        verify_api_key(&parts.headers, &state.api_key)
    }
}

pub fn verify_api_key(headers: &HeaderMap, expected: &str) -> Result<RequireApiKey, ApiError> {
    match headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(key) if !expected.is_empty() && key == expected => Ok(RequireApiKey),
        Some(_) => {
            tracing::warn!("Rejected request with invalid API key");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::debug!("Rejected request without x-api-key header");
            Err(ApiError::unauthorized())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(key: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(key));
        headers
    }

    #[test]
    fn test_matching_key_accepted() {
        assert!(verify_api_key(&headers("k1"), "k1").is_ok());
    }

    #[test]
    fn test_wrong_or_missing_key_rejected() {
        assert!(verify_api_key(&headers("k2"), "k1").is_err());
        assert!(verify_api_key(&HeaderMap::new(), "k1").is_err());
    }

    #[test]
    fn test_empty_expected_key_rejects_everything() {
        assert!(verify_api_key(&headers(""), "").is_err());
    }
}
