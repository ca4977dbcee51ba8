//! Tower layer that turns failures into the uniform error payload and
//! reports them.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, HttpBody as _};
use axum::extract::{ConnectInfo, MatchedPath};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use bytes::{Bytes, BytesMut};
use faultline_state::{CallerIdentity, ClientInfo, ErrorOccurrence, ErrorSource};
use futures::{FutureExt, StreamExt};
use http::request::Parts;
use http_body_util::BodyExt;
use metrics::{counter, histogram};
use tower::{Layer, Service};

use crate::client::{forwarded_ip, header_value, parse_user_agent};
use crate::error::{ApiError, CapturedFailure, ErrorBody};
use crate::kind::ErrorKind;
use crate::process;
use crate::reporter::ErrorReporter;

pub const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_TRACE_ID_LEN: usize = 128;

pub const DEFAULT_CORRELATION_HEADER: &str = "x-session-id";
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Trace id assigned to the request, available to handlers as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(pub String);

#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    /// Header linking a request to an external analytics session.
    pub correlation_header: String,
    /// Largest request body buffered for capture. Larger or unsized bodies
    /// are streamed through uncaptured.
    pub max_capture_bytes: usize,
    pub source: ErrorSource,
    pub environment: Option<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            correlation_header: DEFAULT_CORRELATION_HEADER.to_owned(),
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            source: ErrorSource::Api,
            environment: None,
        }
    }
}

/// Tower layer wrapping a router with error interception.
#[derive(Clone, Default)]
pub struct ErrorInterceptorLayer {
    config: Arc<InterceptorConfig>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl ErrorInterceptorLayer {
    pub fn new(config: InterceptorConfig) -> Self {
        Self {
            config: Arc::new(config),
            reporter: None,
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }
}

impl std::fmt::Debug for ErrorInterceptorLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorInterceptorLayer")
            .field("config", &self.config)
            .field("reporter", &self.reporter.is_some())
            .finish()
    }
}

impl<S> Layer<S> for ErrorInterceptorLayer {
    type Service = ErrorInterceptor<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorInterceptor {
            inner,
            config: Arc::clone(&self.config),
            reporter: self.reporter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ErrorInterceptor<S> {
    inner: S,
    config: Arc<InterceptorConfig>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl<S> Service<Request<Body>> for ErrorInterceptor<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // The clone may not be ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = Arc::clone(&self.config);
        let reporter = self.reporter.clone();

        Box::pin(async move {
            let started = Instant::now();
            let trace_id = resolve_trace_id(req.headers());

            let (mut parts, body) = req.into_parts();
            parts.extensions.insert(TraceId(trace_id.clone()));
            let snapshot = RequestSnapshot::capture(&parts, &config);

            let mut request_body = None;
            let buffered = buffer_body(&parts.headers, body, config.max_capture_bytes).await;
            let outcome = match buffered {
                Ok((body, captured)) => {
                    request_body = captured;
                    let req = Request::from_parts(parts, body);
                    AssertUnwindSafe(async move { inner.call(req).await })
                        .catch_unwind()
                        .await
                }
                Err(err) => Ok(Ok(axum::response::IntoResponse::into_response(err))),
            };

            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(e),
                Err(panic) => panic_response(panic.as_ref(), &trace_id, &snapshot.path),
            };

            let status = response.status();
            let captured = response.extensions().get::<CapturedFailure>().cloned();
            let is_failure = status.is_client_error() || status.is_server_error();

            let (failure, response) = match captured {
                Some(failure) => (failure, response),
                None if is_failure => failure_from_plain_response(response, config.max_capture_bytes).await,
                None => return Ok(with_trace_header(response, &trace_id)),
            };

            let elapsed = started.elapsed();
            histogram!(
                "faultline.request.failed.duration",
                "status" => status.as_u16().to_string()
            )
            .record(elapsed.as_secs_f64());

            if status.is_server_error() {
                tracing::warn!(
                    trace_id = %trace_id,
                    status = status.as_u16(),
                    path = %snapshot.path,
                    error_type = %failure.error_type,
                    error = %failure.message,
                    "Request failed"
                );
            } else {
                tracing::debug!(
                    trace_id = %trace_id,
                    status = status.as_u16(),
                    path = %snapshot.path,
                    error = %failure.message,
                    "Request rejected"
                );
            }

            let body = ErrorBody::new(failure.public_message(), status, Some(trace_id.clone()));
            let payload = serde_json::to_string(&body).unwrap_or_else(|_| {
                format!(
                    r#"{{"error":"{}","statusCode":{},"traceId":"{}"}}"#,
                    crate::error::INTERNAL_MESSAGE,
                    status.as_u16(),
                    trace_id
                )
            });

            let caller = response
                .extensions()
                .get::<CallerIdentity>()
                .cloned()
                .unwrap_or_else(|| snapshot.caller.clone());
            let response = rewrite_response(response, payload.clone(), &trace_id);

            if let Some(reporter) = reporter {
                let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
                let occurrence = snapshot.into_occurrence(
                    &failure,
                    status,
                    caller,
                    &trace_id,
                    request_body,
                    payload,
                    elapsed_ms,
                    &config,
                );

                // Detached: the client may disconnect before reporting finishes.
                tokio::spawn(async move {
                    if let Err(e) = reporter.report(occurrence).await {
                        counter!("faultline.reporter.failures").increment(1);
                        tracing::warn!(error = %e, "Failed to report error occurrence");
                    }
                });
            }

            Ok(response)
        })
    }
}

/// Request details captured before the body is handed to the inner service.
#[derive(Debug, Clone)]
struct RequestSnapshot {
    method: String,
    path: String,
    route: String,
    headers: BTreeMap<String, String>,
    caller: CallerIdentity,
    ip_address: Option<String>,
    user_agent: Option<String>,
    correlation_id: Option<String>,
}

impl RequestSnapshot {
    fn capture(parts: &Parts, config: &InterceptorConfig) -> Self {
        let path = parts.uri.path().to_owned();
        let route = parts
            .extensions
            .get::<MatchedPath>()
            .map_or_else(|| path.clone(), |m| m.as_str().to_owned());

        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            method: parts.method.as_str().to_owned(),
            path,
            route,
            headers,
            caller: parts
                .extensions
                .get::<CallerIdentity>()
                .cloned()
                .unwrap_or_default(),
            ip_address: client_ip(parts),
            user_agent: header_value(&parts.headers, USER_AGENT.as_str()),
            correlation_id: header_value(&parts.headers, &config.correlation_header),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn into_occurrence(
        self,
        failure: &CapturedFailure,
        status: StatusCode,
        caller: CallerIdentity,
        trace_id: &str,
        request_body: Option<Bytes>,
        response_body: String,
        elapsed_ms: f64,
        config: &InterceptorConfig,
    ) -> ErrorOccurrence {
        let ua = self.user_agent.as_deref().map(parse_user_agent);

        let mut occurrence = ErrorOccurrence::new(
            failure.message.clone(),
            failure.error_type.clone(),
            status.as_u16(),
            self.path,
        )
        .with_route(self.route)
        .with_method(self.method)
        .with_source(config.source);

        occurrence.stack_trace.clone_from(&failure.stack_trace);
        occurrence.request_body = request_body
            .filter(|b| !b.is_empty())
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        occurrence.response_body = Some(response_body);
        occurrence.headers = Some(self.headers);
        occurrence.caller = caller;
        occurrence.client = ClientInfo {
            ip_address: self.ip_address,
            browser: ua.as_ref().and_then(|u| u.browser.clone()),
            os: ua.as_ref().and_then(|u| u.os.clone()),
            device: ua.as_ref().map(|u| u.device.to_string()),
            user_agent: self.user_agent,
        };
        occurrence.correlation_id = self.correlation_id;
        occurrence.trace_id = Some(trace_id.to_owned());
        occurrence.environment.clone_from(&config.environment);
        occurrence.performance = process::sample(elapsed_ms);
        occurrence
    }
}

fn client_ip(parts: &Parts) -> Option<String> {
    forwarded_ip(&parts.headers).or_else(|| {
        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}

/// Incoming `x-request-id` when well formed, otherwise a fresh id.
fn resolve_trace_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_valid_trace_id(id))
        .map_or_else(|| uuid::Uuid::new_v4().simple().to_string(), str::to_owned)
}

fn is_valid_trace_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_TRACE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Buffers the body for capture when it fits in `max_capture_bytes`.
///
/// A declared size comes from `Content-Length` or the body's exact size
/// hint. Unsized (chunked) bodies are read frame by frame; once they pass the
/// cap the prefix is stitched back onto the remaining stream uncaptured.
async fn buffer_body(
    headers: &HeaderMap,
    body: Body,
    max_capture_bytes: usize,
) -> Result<(Body, Option<Bytes>), ApiError> {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .or_else(|| {
            body.size_hint()
                .exact()
                .and_then(|n| usize::try_from(n).ok())
        });

    match declared {
        Some(0) => Ok((body, None)),
        Some(len) if len > max_capture_bytes => Ok((body, None)),
        Some(_) => {
            let bytes = body
                .collect()
                .await
                .map_err(|e| ApiError::bad_request(format!("Failed to read request body: {e}")))?
                .to_bytes();
            Ok((Body::from(bytes.clone()), Some(bytes)))
        }
        None => buffer_unsized(body, max_capture_bytes).await,
    }
}

async fn buffer_unsized(
    mut body: Body,
    max_capture_bytes: usize,
) -> Result<(Body, Option<Bytes>), ApiError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame =
            frame.map_err(|e| ApiError::bad_request(format!("Failed to read request body: {e}")))?;
        // Trailers are not captured.
        let Ok(data) = frame.into_data() else {
            continue;
        };
        buf.extend_from_slice(&data);
        if buf.len() > max_capture_bytes {
            let head = buf.freeze();
            let rest = futures::stream::once(async move { Ok::<_, axum::Error>(head) })
                .chain(body.into_data_stream());
            return Ok((Body::from_stream(rest), None));
        }
    }

    if buf.is_empty() {
        return Ok((Body::empty(), None));
    }
    let bytes = buf.freeze();
    Ok((Body::from(bytes.clone()), Some(bytes)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_owned())
}

fn panic_response(panic: &(dyn Any + Send), trace_id: &str, path: &str) -> Response<Body> {
    let message = panic_message(panic);
    tracing::error!(trace_id = %trace_id, path = %path, panic = %message, "Handler panicked");

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.extensions_mut().insert(CapturedFailure {
        kind: ErrorKind::Internal,
        message,
        error_type: "panic".to_owned(),
        stack_trace: None,
    });
    response
}

/// Describe an error response that did not come from [`ApiError`], such as
/// a routing 404 or an extractor rejection.
async fn failure_from_plain_response(
    response: Response<Body>,
    max_bytes: usize,
) -> (CapturedFailure, Response<Body>) {
    let (parts, body) = response.into_parts();
    let kind = ErrorKind::from_response_status(parts.status);
    let fallback = parts
        .status
        .canonical_reason()
        .unwrap_or("Request failed")
        .to_owned();

    let message = match axum::body::to_bytes(body, max_bytes).await {
        Ok(bytes) => message_from_body(&bytes).unwrap_or(fallback),
        Err(_) => fallback,
    };

    let failure = CapturedFailure {
        kind,
        message,
        error_type: kind.error_type().to_owned(),
        stack_trace: None,
    };
    (failure, Response::from_parts(parts, Body::empty()))
}

fn message_from_body(bytes: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
        return value
            .get("error")
            .or_else(|| value.get("message"))
            .and_then(|v| v.as_str())
            .map(str::to_owned);
    }
    std::str::from_utf8(bytes)
        .ok()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn rewrite_response(response: Response<Body>, payload: String, trace_id: &str) -> Response<Body> {
    let (mut parts, _) = response.into_parts();
    parts.headers.remove(CONTENT_LENGTH);
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    with_trace_header(Response::from_parts(parts, Body::from(payload)), trace_id)
}

fn with_trace_header(mut response: Response<Body>, trace_id: &str) -> Response<Body> {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::*;
    use crate::reporter::ReportError;

    struct ChannelReporter(mpsc::UnboundedSender<ErrorOccurrence>);

    #[async_trait]
    impl ErrorReporter for ChannelReporter {
        async fn report(&self, occurrence: ErrorOccurrence) -> Result<(), ReportError> {
            self.0
                .send(occurrence)
                .map_err(|e| ReportError::Backend(e.to_string()))
        }
    }

    struct FailingReporter;

    #[async_trait]
    impl ErrorReporter for FailingReporter {
        async fn report(&self, _occurrence: ErrorOccurrence) -> Result<(), ReportError> {
            Err(ReportError::Backend("store unavailable".into()))
        }
    }

    fn layer_with_channel() -> (ErrorInterceptorLayer, mpsc::UnboundedReceiver<ErrorOccurrence>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let layer = ErrorInterceptorLayer::new(InterceptorConfig {
            environment: Some("test".into()),
            ..Default::default()
        })
        .with_reporter(Arc::new(ChannelReporter(tx)));
        (layer, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ErrorOccurrence>) -> ErrorOccurrence {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn widget_not_found(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
        Ok(axum::response::IntoResponse::into_response(
            ApiError::not_found("Widget 42 not found"),
        ))
    }

    #[tokio::test]
    async fn domain_error_becomes_uniform_payload() {
        let (layer, mut rx) = layer_with_channel();
        let service = layer.layer(tower::service_fn(widget_not_found));

        let req = Request::builder()
            .method("GET")
            .uri("/api/widgets/42?expand=true")
            .header(USER_AGENT, "curl/8.4.0")
            .body(Body::empty())
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let header_trace = response
            .headers()
            .get(TRACE_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();

        let body = json_body(response).await;
        assert_eq!(body["error"], "Widget 42 not found");
        assert_eq!(body["statusCode"], 404);
        assert_eq!(body["traceId"], header_trace.as_str());

        let occurrence = next(&mut rx).await;
        assert_eq!(occurrence.status_code, 404);
        assert_eq!(occurrence.message, "Widget 42 not found");
        assert_eq!(occurrence.error_type, "NotFound");
        assert_eq!(occurrence.endpoint, "/api/widgets/42");
        assert_eq!(occurrence.http_method.as_deref(), Some("GET"));
        assert_eq!(occurrence.trace_id.as_deref(), Some(header_trace.as_str()));
        assert_eq!(occurrence.environment.as_deref(), Some("test"));
        assert_eq!(occurrence.client.device.as_deref(), Some("bot"));
        assert!(occurrence
            .stack_trace
            .as_deref()
            .unwrap()
            .starts_with(&format!("at {}:", file!())));
    }

    #[tokio::test]
    async fn internal_details_are_not_leaked() {
        let (layer, mut rx) = layer_with_channel();
        let service = layer.layer(tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(axum::response::IntoResponse::into_response(
                ApiError::internal("pool timed out connecting to db-primary:5432"),
            ))
        }));

        let response = service
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Internal server error");
        assert!(!body.to_string().contains("db-primary"));

        let occurrence = next(&mut rx).await;
        assert!(occurrence.message.contains("db-primary"));
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let (layer, mut rx) = layer_with_channel();
        let service = layer.layer(tower::service_fn(|_req: Request<Body>| async {
            if true {
                panic!("index out of bounds");
            }
            Ok::<Response<Body>, Infallible>(Response::new(Body::empty()))
        }));

        let response = service
            .oneshot(Request::builder().uri("/panic").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["statusCode"], 500);

        let occurrence = next(&mut rx).await;
        assert_eq!(occurrence.error_type, "panic");
        assert_eq!(occurrence.message, "index out of bounds");
    }

    #[tokio::test]
    async fn success_passes_through_unreported() {
        let (layer, mut rx) = layer_with_channel();
        let service = layer.layer(tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("ok")))
        }));

        let req = Request::builder()
            .uri("/fine")
            .header(REQUEST_ID_HEADER, "req-123")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(TRACE_ID_HEADER).unwrap(), "req-123");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reporter_failure_does_not_reach_client() {
        let layer = ErrorInterceptorLayer::default().with_reporter(Arc::new(FailingReporter));
        let service = layer.layer(tower::service_fn(widget_not_found));

        let response = service
            .oneshot(Request::builder().uri("/api/widgets/1").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "Widget 42 not found");
    }

    #[tokio::test]
    async fn plain_error_responses_are_normalised() {
        let (layer, mut rx) = layer_with_channel();
        let service = layer.layer(tower::service_fn(|_req: Request<Body>| async {
            let mut response = Response::new(Body::from("missing field `name`"));
            *response.status_mut() = StatusCode::UNPROCESSABLE_ENTITY;
            Ok::<_, Infallible>(response)
        }));

        let response = service
            .oneshot(Request::builder().uri("/api/widgets").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["error"], "missing field `name`");
        assert_eq!(body["statusCode"], 422);

        let occurrence = next(&mut rx).await;
        assert_eq!(occurrence.error_type, "UnprocessableEntity");
    }

    #[tokio::test]
    async fn request_body_and_client_ip_are_captured() {
        let (layer, mut rx) = layer_with_channel();
        let service = layer.layer(tower::service_fn(|req: Request<Body>| async move {
            // The handler still sees the full body.
            let bytes = req.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&bytes[..], br#"{"name":"gear"}"#);
            Ok::<_, Infallible>(axum::response::IntoResponse::into_response(
                ApiError::conflict("Widget already exists"),
            ))
        }));

        let payload = r#"{"name":"gear"}"#;
        let req = Request::builder()
            .method("POST")
            .uri("/api/widgets")
            .header(CONTENT_LENGTH, payload.len())
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .header(DEFAULT_CORRELATION_HEADER, "sess-1")
            .body(Body::from(payload))
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let occurrence = next(&mut rx).await;
        assert_eq!(occurrence.request_body.as_deref(), Some(payload));
        assert_eq!(occurrence.client.ip_address.as_deref(), Some("203.0.113.9"));
        assert_eq!(occurrence.correlation_id.as_deref(), Some("sess-1"));
        assert!(occurrence.response_body.unwrap().contains("Widget already exists"));
    }

    async fn echo_conflict(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let bytes = req.into_body().collect().await.unwrap().to_bytes();
        Ok(axum::response::IntoResponse::into_response(
            ApiError::conflict(format!("rejected {} bytes", bytes.len())),
        ))
    }

    #[tokio::test]
    async fn body_without_content_length_is_captured() {
        let (layer, mut rx) = layer_with_channel();
        let service = layer.layer(tower::service_fn(echo_conflict));

        let payload = r#"{"name":"gear"}"#;
        let req = Request::builder()
            .method("POST")
            .uri("/api/widgets")
            .body(Body::from(payload))
            .unwrap();
        assert!(req.headers().get(CONTENT_LENGTH).is_none());

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(json_body(response).await["error"], "rejected 15 bytes");
        let occurrence = next(&mut rx).await;
        assert_eq!(occurrence.request_body.as_deref(), Some(payload));
    }

    #[tokio::test]
    async fn chunked_body_is_captured_under_cap() {
        let (layer, mut rx) = layer_with_channel();
        let service = layer.layer(tower::service_fn(echo_conflict));

        let chunks = futures::stream::iter(["{\"name\":", "\"gear\"}"])
            .map(|chunk| Ok::<_, Infallible>(Bytes::from_static(chunk.as_bytes())));
        let req = Request::builder()
            .method("POST")
            .uri("/api/widgets")
            .body(Body::from_stream(chunks))
            .unwrap();

        service.oneshot(req).await.unwrap();
        let occurrence = next(&mut rx).await;
        assert_eq!(occurrence.request_body.as_deref(), Some(r#"{"name":"gear"}"#));
    }

    #[tokio::test]
    async fn chunked_body_over_cap_is_forwarded_uncaptured() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let layer = ErrorInterceptorLayer::new(InterceptorConfig {
            max_capture_bytes: 8,
            ..Default::default()
        })
        .with_reporter(Arc::new(ChannelReporter(tx)));
        let service = layer.layer(tower::service_fn(echo_conflict));

        let chunks = futures::stream::iter(["0123456", "789abc", "def"])
            .map(|chunk| Ok::<_, Infallible>(Bytes::from_static(chunk.as_bytes())));
        let req = Request::builder()
            .method("POST")
            .uri("/api/widgets")
            .body(Body::from_stream(chunks))
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        // The handler still received every byte.
        assert_eq!(json_body(response).await["error"], "rejected 16 bytes");
        let occurrence = next(&mut rx).await;
        assert!(occurrence.request_body.is_none());
    }

    #[rstest::rstest]
    #[case(StatusCode::UNSUPPORTED_MEDIA_TYPE, "UnsupportedMediaType")]
    #[case(StatusCode::PAYLOAD_TOO_LARGE, "PayloadTooLarge")]
    #[case(StatusCode::IM_A_TEAPOT, "BadRequest")]
    #[tokio::test]
    async fn plain_client_errors_keep_their_message(
        #[case] status: StatusCode,
        #[case] error_type: &str,
    ) {
        let (layer, mut rx) = layer_with_channel();
        let service = layer.layer(tower::service_fn(move |_req: Request<Body>| async move {
            let mut response = Response::new(Body::from("Expected request with JSON body"));
            *response.status_mut() = status;
            Ok::<_, Infallible>(response)
        }));

        let response = service
            .oneshot(Request::builder().uri("/api/widgets").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), status);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Expected request with JSON body");
        assert_eq!(body["statusCode"], status.as_u16());

        let occurrence = next(&mut rx).await;
        assert_eq!(occurrence.status_code, status.as_u16());
        assert_eq!(occurrence.error_type, error_type);
    }

    #[test]
    fn rejects_malformed_request_ids() {
        assert!(is_valid_trace_id("abc-123_DEF"));
        assert!(!is_valid_trace_id(""));
        assert!(!is_valid_trace_id("has space"));
        assert!(!is_valid_trace_id(&"a".repeat(MAX_TRACE_ID_LEN + 1)));
    }
}
