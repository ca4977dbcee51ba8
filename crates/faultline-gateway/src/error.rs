//! Handler-level error type and the uniform client payload.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::kind::ErrorKind;

/// Message sent to clients in place of internal failure details.
pub const INTERNAL_MESSAGE: &str = "Internal server error";

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub status_code: u16,
    pub trace_id: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, status: StatusCode, trace_id: Option<String>) -> Self {
        Self {
            error: error.into(),
            status_code: status.as_u16(),
            trace_id,
        }
    }
}

/// Failure details attached to a response as an extension so the
/// interceptor can record them after the handler has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub error_type: String,
    pub stack_trace: Option<String>,
}

impl CapturedFailure {
    /// The message a client may see.
    pub fn public_message(&self) -> &str {
        match self.kind {
            ErrorKind::Internal => INTERNAL_MESSAGE,
            _ => &self.message,
        }
    }
}

/// Error returned by handlers.
///
/// Constructors are `#[track_caller]`: the construction site becomes the
/// first application frame of the recorded stack trace.
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    error_type: String,
    location: &'static Location<'static>,
    backtrace: Option<String>,
}

impl ApiError {
    #[track_caller]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_type: kind.error_type().to_owned(),
            location: Location::caller(),
            backtrace: capture_backtrace(),
        }
    }

    /// Wrap another error, recording its type name for grouping.
    #[track_caller]
    pub fn from_source<E>(kind: ErrorKind, err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        Self {
            kind,
            message: err.to_string(),
            error_type: std::any::type_name::<E>().to_owned(),
            location: Location::caller(),
            backtrace: capture_backtrace(),
        }
    }

    #[track_caller]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[track_caller]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    #[track_caller]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    #[track_caller]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    #[track_caller]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    #[track_caller]
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    #[track_caller]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    #[must_use]
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    pub const fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Construction site followed by the captured backtrace, if any.
    pub fn stack_trace(&self) -> String {
        let mut trace = format!(
            "at {}:{}:{}",
            self.location.file(),
            self.location.line(),
            self.location.column()
        );
        if let Some(backtrace) = &self.backtrace {
            trace.push('\n');
            trace.push_str(backtrace);
        }
        trace
    }

    pub fn captured(&self) -> CapturedFailure {
        CapturedFailure {
            kind: self.kind,
            message: self.message.clone(),
            error_type: self.error_type.clone(),
            stack_trace: Some(self.stack_trace()),
        }
    }
}

fn capture_backtrace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

impl fmt::Debug for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("error_type", &self.error_type)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<std::io::Error> for ApiError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_source(ErrorKind::Internal, &err)
    }
}

impl From<serde_json::Error> for ApiError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_source(ErrorKind::BadRequest, &err)
    }
}

impl From<JsonRejection> for ApiError {
    #[track_caller]
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            ErrorKind::from_response_status(rejection.status()),
            rejection.body_text(),
        )
            .with_error_type("JsonRejection")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        let captured = self.captured();
        let body = ErrorBody::new(captured.public_message(), status, None);

        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(captured);
        response
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[test]
    fn records_construction_site() {
        let err = ApiError::not_found("Widget 42 not found");
        assert_eq!(err.location().file(), file!());
        assert!(err.stack_trace().starts_with(&format!("at {}:", file!())));
        assert_eq!(err.error_type(), "NotFound");
    }

    #[test]
    fn wrapped_source_keeps_type_name() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = ApiError::from(io);
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.error_type(), "std::io::error::Error");
        assert_eq!(err.message(), "disk on fire");
    }

    #[test]
    fn internal_message_is_hidden() {
        let captured = ApiError::internal("connection string postgres://secret").captured();
        assert_eq!(captured.public_message(), INTERNAL_MESSAGE);

        let captured = ApiError::service_unavailable("upstream down").captured();
        assert_eq!(captured.public_message(), "upstream down");
    }

    #[tokio::test]
    async fn json_rejection_keeps_client_status() {
        use axum::extract::FromRequest;

        let req = axum::http::Request::post("/api/widgets")
            .body(axum::body::Body::from(r#"{"name":"gear"}"#))
            .unwrap();
        let rejection = Json::<serde_json::Value>::from_request(req, &())
            .await
            .unwrap_err();

        let err = ApiError::from(rejection);
        assert_eq!(err.kind(), ErrorKind::UnsupportedMediaType);
        assert_eq!(err.error_type(), "JsonRejection");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_ne!(body["error"], INTERNAL_MESSAGE);
        assert_eq!(body["statusCode"], 415);
    }

    #[tokio::test]
    async fn response_carries_payload_and_extension() {
        let response = ApiError::not_found("Widget 42 not found").into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let captured = response.extensions().get::<CapturedFailure>().cloned();
        assert_eq!(captured.map(|c| c.kind), Some(ErrorKind::NotFound));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Widget 42 not found");
        assert_eq!(body["statusCode"], 404);
        assert!(body["traceId"].is_null());
    }
}
