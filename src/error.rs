/**
 * Error Types and Response Envelope
 *
 * This module defines the error taxonomy used across the delivery core and
 * the `{success, data, error}` envelope every handler responds with.
 *
 * # Error Codes
 *
 * Errors carry a stable string code (e.g. `INVALID_TOKEN`, `RATE_LIMIT`)
 * that clients switch on. The HTTP status is derived from the code. Each
 * outer handler wraps its body so unhandled failures surface as
 * `INTERNAL_SERVER_ERROR` with HTTP 500 while the original error goes to
 * the logs.
 */

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Stable error codes carried in API responses and close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Input
    IncorrectData,
    IncorrectFormat,
    InvalidCursor,
    InvalidToken,
    InvalidTokenFormat,
    InvalidSignature,
    ExpiredToken,
    DecodeError,
    // AuthN / AuthZ
    Unauthorized,
    Forbidden,
    IncorrectPassword,
    UsernameExists,
    UserAlreadyExists,
    UserDoesNotExist,
    AlreadyVerified,
    EmailHasChanged,
    // Not found
    PostDoesNotExist,
    CommentDoesNotExist,
    TagDoesNotExist,
    ContextNotFound,
    MessageNotFound,
    NoMorePosts,
    NoMoreComments,
    NoMoreFavorites,
    // Limits
    RateLimit,
    MaxCountExceed,
    // Operational
    InternalServerError,
}

impl ErrorCode {
    /// The wire form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IncorrectData => "INCORRECT_DATA",
            Self::IncorrectFormat => "INCORRECT_FORMAT",
            Self::InvalidCursor => "INVALID_CURSOR",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::InvalidTokenFormat => "INVALID_TOKEN_FORMAT",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::ExpiredToken => "EXPIRED_TOKEN",
            Self::DecodeError => "DECODE_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::IncorrectPassword => "INCORRECT_PASSWORD",
            Self::UsernameExists => "USERNAME_EXISTS",
            Self::UserAlreadyExists => "USER_ALREADY_EXISTS",
            Self::UserDoesNotExist => "USER_DOES_NOT_EXIST",
            Self::AlreadyVerified => "ALREADY_VERIFIED",
            Self::EmailHasChanged => "EMAIL_HAS_CHANGED",
            Self::PostDoesNotExist => "POST_DOES_NOT_EXIST",
            Self::CommentDoesNotExist => "COMMENT_DOES_NOT_EXIST",
            Self::TagDoesNotExist => "TAG_DOES_NOT_EXIST",
            Self::ContextNotFound => "CONTEXT_NOT_FOUND",
            Self::MessageNotFound => "MESSAGE_NOT_FOUND",
            Self::NoMorePosts => "NO_MORE_POSTS",
            Self::NoMoreComments => "NO_MORE_COMMENTS",
            Self::NoMoreFavorites => "NO_MORE_FAVORITES",
            Self::RateLimit => "RATE_LIMIT",
            Self::MaxCountExceed => "MAX_COUNT_EXCEED",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }

    /// HTTP status associated with the code.
    pub fn status(self) -> StatusCode {
        match self {
            Self::IncorrectData
            | Self::IncorrectFormat
            | Self::InvalidCursor
            | Self::InvalidTokenFormat
            | Self::DecodeError
            | Self::MaxCountExceed => StatusCode::BAD_REQUEST,
            Self::InvalidToken
            | Self::InvalidSignature
            | Self::ExpiredToken
            | Self::Unauthorized
            | Self::IncorrectPassword => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::UsernameExists | Self::UserAlreadyExists | Self::AlreadyVerified => {
                StatusCode::CONFLICT
            }
            Self::UserDoesNotExist
            | Self::EmailHasChanged
            | Self::PostDoesNotExist
            | Self::CommentDoesNotExist
            | Self::TagDoesNotExist
            | Self::ContextNotFound
            | Self::MessageNotFound
            | Self::NoMorePosts
            | Self::NoMoreComments
            | Self::NoMoreFavorites => StatusCode::NOT_FOUND,
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// API error: a code plus optional human message and structured data.
///
/// Handlers return `Result<Json<ApiResponse<T>>, ApiError>`; the error side
/// renders as the same envelope with `success: false`.
#[derive(Debug, Error)]
#[error("{}: {}", self.code.as_str(), self.message.as_deref().unwrap_or("-"))]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl ApiError {
    /// Create an error with just a code.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
            data: None,
        }
    }

    /// Create an error with a code and a message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Create an error with a code and structured data.
    pub fn with_data(code: ErrorCode, data: Value) -> Self {
        Self {
            code,
            message: None,
            data: Some(data),
        }
    }

    /// Shortcut for `INTERNAL_SERVER_ERROR`, logging the original cause.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        tracing::error!("Internal error: {cause}");
        Self::new(ErrorCode::InternalServerError)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        // Unique-constraint violations surface as domain conflicts; the
        // constraint name tells us which resource collided.
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                let constraint = db_err.constraint().unwrap_or_default();
                if constraint.contains("email") {
                    return Self::new(ErrorCode::UserAlreadyExists);
                }
                if constraint.contains("username") {
                    return Self::new(ErrorCode::UsernameExists);
                }
            }
        }
        Self::internal(err)
    }
}

impl From<redis::RedisError> for ApiError {
    fn from(err: redis::RedisError) -> Self {
        Self::internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        let body = ApiResponse::<Value> {
            success: false,
            data: self.data,
            error: Some(self.code.as_str().to_string()),
        };
        (status, Json(body)).into_response()
    }
}

/// Uniform response envelope: `{success, data?, error?}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Successful envelope with a payload.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<Value> {
    /// Successful envelope with no payload.
    pub fn empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::RateLimit.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ErrorCode::UserAlreadyExists.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorCode::InternalServerError.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(ErrorCode::RateLimit.as_str(), "RATE_LIMIT");
        assert_eq!(ErrorCode::InvalidTokenFormat.as_str(), "INVALID_TOKEN_FORMAT");
        assert_eq!(ErrorCode::NoMoreFavorites.as_str(), "NO_MORE_FAVORITES");
    }

    #[test]
    fn test_envelope_serialization() {
        let ok = ApiResponse::ok(serde_json::json!({"id": 1}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["id"], 1);
        assert!(json.get("error").is_none());

        let err = ApiError::with_data(
            ErrorCode::RateLimit,
            serde_json::json!({"limit": 5, "reset": 42}),
        );
        let response_body = ApiResponse::<Value> {
            success: false,
            data: err.data.clone(),
            error: Some(err.code.as_str().to_string()),
        };
        let json = serde_json::to_value(&response_body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "RATE_LIMIT");
        assert_eq!(json["data"]["limit"], 5);
    }
}
