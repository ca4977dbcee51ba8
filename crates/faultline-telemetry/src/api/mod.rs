//! HTTP surface of the Faultline service.
//!
//! ```text
//! GET  /health, /ready
//! /api/errors/groups...       admin (bearer token when configured)
//! /api/errors/occurrences...  admin
//! /api/errors/purge|stats|settings  admin
//! /api/errors/live[/{group}]  admin, WebSocket
//! /api/errors/client[/config] public
//! ```
//!
//! The whole router runs inside the error interceptor with the recorder as
//! its reporter, so the service tracks its own failures too.

pub mod admin;
pub mod client;
pub mod live;

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, Uri},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use faultline_gateway::{ApiError, ErrorInterceptorLayer, ErrorReporter, InterceptorConfig};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;

use crate::ErrorRecorder;

/// Query parameter accepted in place of the bearer header on live routes.
/// Browsers cannot set headers on WebSocket upgrades.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub recorder: Arc<ErrorRecorder>,
    admin_token: Option<Arc<[u8; 32]>>,
}

impl AppState {
    pub fn new(recorder: Arc<ErrorRecorder>, admin_token: Option<&str>) -> Self {
        Self {
            recorder,
            admin_token: admin_token
                .filter(|t| !t.is_empty())
                .map(|t| Arc::new(token_digest(t))),
        }
    }

    pub const fn requires_token(&self) -> bool {
        self.admin_token.is_some()
    }

    fn accepts(&self, presented: Option<&str>) -> bool {
        match (&self.admin_token, presented) {
            (None, _) => true,
            (Some(expected), Some(token)) => token_digest(token) == **expected,
            (Some(_), None) => false,
        }
    }
}

/// Build the service router.
pub fn router(state: AppState, interceptor: InterceptorConfig) -> Router {
    let reporter: Arc<dyn ErrorReporter> = state.recorder.clone();

    let admin = admin::routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_admin,
    ));
    let live = live::routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_live_access,
    ));

    let api = Router::new()
        .merge(admin)
        .merge(live)
        .merge(client::routes());

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .nest("/api/errors", api)
        .with_state(state)
        .layer(ErrorInterceptorLayer::new(interceptor).with_reporter(reporter))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Ready once the store answers.
async fn ready(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    state.recorder.stats().await.map_err(|e| {
        tracing::warn!(error = %e, "store not ready");
        ApiError::service_unavailable("Error store unavailable")
    })?;
    Ok(Json(HealthResponse { status: "ready" }))
}

async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.accepts(bearer_token(req.headers())) {
        Ok(next.run(req).await)
    } else {
        Err(ApiError::unauthorized("Missing or invalid admin token"))
    }
}

async fn require_live_access(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let query_token = query_token(req.uri());
    let presented = bearer_token(req.headers()).or(query_token.as_deref());
    if state.accepts(presented) {
        Ok(next.run(req).await)
    } else {
        Err(ApiError::unauthorized("Missing or invalid admin token"))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn query_token(uri: &Uri) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == ACCESS_TOKEN_PARAM).then(|| value.to_owned())
    })
}

fn token_digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}
