//! HTTP server for signaling, stream listings and health checks
//!
//! Viewer routes identify the caller by the `connection_id` cookie handed
//! out by `POST /connect`. Capture endpoint routes live under `/internal`.

use crate::config::IceServerConfig;
use crate::rtc::Signal;
use crate::stream::{ConnectionEvent, NewStreamBody, StreamError, StreamListing};
use crate::web::shared::SharedState;
use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

pub const VIEWER_COOKIE: &str = "connection_id";

/// Viewer id taken from the `connection_id` cookie
pub struct ViewerId(pub String);

impl<S> FromRequestParts<S> for ViewerId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        CookieJar::from_headers(&parts.headers)
            .get(VIEWER_COOKIE)
            .map(|cookie| cookie.value().to_string())
            .filter(|id| !id.is_empty())
            .map(ViewerId)
            .ok_or((StatusCode::BAD_REQUEST, "missing connection_id cookie"))
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        match self {
            StreamError::StreamNotFound(id) => {
                debug!("Request for unknown stream {}", id);
                (StatusCode::NOT_FOUND, "stream not found").into_response()
            }
            StreamError::Rtc(e) => {
                warn!("Signaling request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

/// Build the application router
pub fn build_router(state: Arc<SharedState>) -> Router {
    let cors = cors_layer(state.config.http.cors_origin.as_deref());

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/connect", post(connect_handler))
        .route("/signal/{stream_id}", get(viewer_poll_handler).post(viewer_signal_handler))
        .route("/snapshot/{stream_id}", get(snapshot_handler))
        .route("/ice-config", get(ice_config_handler))
        .route("/streams", get(list_streams_handler))
        .route("/connect/{stream_id}/internal", post(capture_connect_handler))
        .route(
            "/signal/{stream_id}/internal",
            get(capture_poll_handler).post(capture_signal_handler),
        )
        .route("/snapshot/{stream_id}/internal", post(capture_snapshot_handler))
        .route("/conn-evt/{stream_id}/internal", post(connection_event_handler))
        .with_state(state);

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(origin: Option<&str>) -> Option<CorsLayer> {
    let origin = origin?;
    if origin == "*" {
        return Some(CorsLayer::permissive());
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => Some(
            CorsLayer::new()
                .allow_origin(value)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE])
                .allow_credentials(true),
        ),
        Err(e) => {
            warn!("Ignoring invalid CORS origin {:?}: {}", origin, e);
            None
        }
    }
}

/// Run the HTTP server on the configured address
pub async fn run_http_server(state: Arc<SharedState>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);
    serve(listener, state).await
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<SharedState>) -> Result<(), Box<dyn std::error::Error>> {
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
    Ok(())
}

/// Health check handler
async fn health_handler(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.uptime().as_secs_f64(),
        "streams": state.streams.stream_count(),
        "run_id": state.streams.run_id(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Metrics handler (Prometheus format)
async fn metrics_handler(State(state): State<Arc<SharedState>>) -> Response {
    match state.metrics.render(&state.streams) {
        Ok((content_type, body)) => ([(header::CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Issue a viewer id as the `connection_id` cookie
async fn connect_handler(jar: CookieJar) -> (CookieJar, String) {
    let viewer_id = new_viewer_id();
    info!("Viewer {} connected", viewer_id);
    let cookie = Cookie::build((VIEWER_COOKIE, viewer_id.clone())).path("/");
    (jar.add(cookie), viewer_id)
}

fn new_viewer_id() -> String {
    uuid::Uuid::new_v4().as_bytes()[..5]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

async fn viewer_poll_handler(
    State(state): State<Arc<SharedState>>,
    Path(stream_id): Path<String>,
    ViewerId(viewer_id): ViewerId,
) -> Result<Json<Vec<Signal>>, StreamError> {
    let stream = state.streams.require_available_stream(&stream_id)?;
    Ok(Json(stream.drain_for_viewer(&viewer_id).await))
}

async fn viewer_signal_handler(
    State(state): State<Arc<SharedState>>,
    Path(stream_id): Path<String>,
    ViewerId(viewer_id): ViewerId,
    Json(signals): Json<Vec<Signal>>,
) -> Result<&'static str, StreamError> {
    let stream = state.streams.require_available_stream(&stream_id)?;
    state.metrics.record_signals("viewer", signals.len());
    stream.signal_from_viewer(&viewer_id, signals).await?;
    Ok("OK")
}

async fn snapshot_handler(State(state): State<Arc<SharedState>>, Path(stream_id): Path<String>) -> Response {
    match state.streams.get_stream(&stream_id).and_then(|s| s.snapshot()) {
        Some(jpeg) => ([(header::CONTENT_TYPE, "image/jpg")], jpeg).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ice_config_handler(State(state): State<Arc<SharedState>>) -> Json<Vec<IceServerConfig>> {
    Json(state.config.ice_servers.clone())
}

async fn list_streams_handler(State(state): State<Arc<SharedState>>) -> Json<Vec<StreamListing>> {
    Json(state.streams.list_streams())
}

async fn capture_connect_handler(
    State(state): State<Arc<SharedState>>,
    Path(stream_id): Path<String>,
    body: Bytes,
) -> Response {
    let request = if body.is_empty() {
        NewStreamBody {
            is_direct_connect: state.config.signaling.direct_connect,
            is_private: false,
        }
    } else {
        match serde_json::from_slice::<NewStreamBody>(&body) {
            Ok(request) => request,
            Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid body: {}", e)).into_response(),
        }
    };

    state
        .streams
        .new_stream(&stream_id, request.is_direct_connect, request.is_private)
        .await;
    "OK".into_response()
}

async fn capture_poll_handler(
    State(state): State<Arc<SharedState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<Vec<Signal>>, StreamError> {
    let stream = state.streams.require_stream(&stream_id)?;
    Ok(Json(stream.drain_for_capture().await))
}

async fn capture_signal_handler(
    State(state): State<Arc<SharedState>>,
    Path(stream_id): Path<String>,
    Json(signals): Json<Vec<Signal>>,
) -> Result<&'static str, StreamError> {
    let stream = state.streams.require_stream(&stream_id)?;
    state.metrics.record_signals("capture", signals.len());
    stream.signal_from_capture(signals).await;
    Ok("OK")
}

async fn capture_snapshot_handler(
    State(state): State<Arc<SharedState>>,
    Path(stream_id): Path<String>,
    body: Bytes,
) -> Result<&'static str, StreamError> {
    state.streams.require_stream(&stream_id)?.set_snapshot(body);
    Ok("OK")
}

async fn connection_event_handler(
    State(state): State<Arc<SharedState>>,
    Path(stream_id): Path<String>,
    Json(event): Json<ConnectionEvent>,
) -> Result<&'static str, StreamError> {
    state.streams.require_stream(&stream_id)?.record_connection_event(&event);
    Ok("OK")
}
