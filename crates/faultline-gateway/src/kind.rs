//! Failure kinds and their HTTP status codes.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

/// Closed set of failure kinds a handler can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    BadRequest,
    Forbidden,
    Conflict,
    TooManyRequests,
    UnprocessableEntity,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    RequestTimeout,
    MethodNotAllowed,
    Gone,
    NotImplemented,
    PayloadTooLarge,
    UnsupportedMediaType,
    Internal,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 17] = [
        Self::NotFound,
        Self::Unauthorized,
        Self::BadRequest,
        Self::Forbidden,
        Self::Conflict,
        Self::TooManyRequests,
        Self::UnprocessableEntity,
        Self::BadGateway,
        Self::ServiceUnavailable,
        Self::GatewayTimeout,
        Self::RequestTimeout,
        Self::MethodNotAllowed,
        Self::Gone,
        Self::NotImplemented,
        Self::PayloadTooLarge,
        Self::UnsupportedMediaType,
        Self::Internal,
    ];

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Conflict => StatusCode::CONFLICT,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::UnprocessableEntity => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadGateway => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Gone => StatusCode::GONE,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Type name recorded on occurrences raised directly from a kind.
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::BadRequest => "BadRequest",
            Self::Forbidden => "Forbidden",
            Self::Conflict => "Conflict",
            Self::TooManyRequests => "TooManyRequests",
            Self::UnprocessableEntity => "UnprocessableEntity",
            Self::BadGateway => "BadGateway",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::GatewayTimeout => "GatewayTimeout",
            Self::RequestTimeout => "RequestTimeout",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::Gone => "Gone",
            Self::NotImplemented => "NotImplemented",
            Self::PayloadTooLarge => "PayloadTooLarge",
            Self::UnsupportedMediaType => "UnsupportedMediaType",
            Self::Internal => "Internal",
        }
    }

    /// First declared kind with this status, or [`ErrorKind::Internal`].
    pub fn from_status(status: StatusCode) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.status_code() == status)
            .unwrap_or(Self::Internal)
    }

    /// Like [`ErrorKind::from_status`], but an unmapped 4xx stays a client
    /// error ([`ErrorKind::BadRequest`]) instead of becoming `Internal`.
    pub fn from_response_status(status: StatusCode) -> Self {
        match Self::from_status(status) {
            Self::Internal if status.is_client_error() => Self::BadRequest,
            kind => kind,
        }
    }

    pub const fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::BadGateway | Self::ServiceUnavailable | Self::GatewayTimeout
        )
    }
}
