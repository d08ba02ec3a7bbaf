//! HTTP routes for the Relay server.
//!
//! `/app/:key` upgrades to a WebSocket and hands the socket to the
//! transport gateway. Everything under `/apps/:app_id` is the signed REST
//! surface used by application backends.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_protocol::{ErrorCode, OutgoingMessage, Version};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tenvis_relay_core::dashboard::{self, LogDetails, LogEventType};
use tenvis_relay_core::{
    auth, Application, ChannelKind, ChannelManager, Dispatcher, Hub, SocketId, Statistic,
    StatsSink,
};
use tenvis_relay_transport::{reject, websocket, Gateway};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::metrics::{self, ServerStats, TrafficMetrics};
use crate::rest_auth::{self, RestAuthError};

/// How often channel gauges are refreshed.
const METRICS_SAMPLE_PERIOD: Duration = Duration::from_secs(5);

/// Length of a statistics reporting window.
const STATS_REPORT_PERIOD: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    pub hub: Hub,
    pub gateway: Gateway,
    pub channels: Arc<ChannelManager>,
    pub stats: Arc<ServerStats>,
}

impl AppState {
    /// Wire up the registry, channel manager, hub and gateway.
    ///
    /// Returns the state and the hub actor's task, which ends once
    /// `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured applications are invalid.
    pub fn new(
        config: &Config,
        shutdown: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let registry = Arc::new(config.registry()?);
        let channels = Arc::new(ChannelManager::new(registry));
        let stats = Arc::new(ServerStats::new());

        let (hub, hub_task) = Hub::spawn(Arc::clone(&channels), stats.clone(), shutdown);
        let dispatcher = Dispatcher::new(Arc::clone(&channels), stats.clone());
        let gateway = Gateway::new(hub.clone(), dispatcher, config.session())
            .with_observer(Arc::new(TrafficMetrics));

        let state = Arc::new(Self {
            hub,
            gateway,
            channels,
            stats,
        });
        Ok((state, hub_task))
    }

    fn find_app(&self, app_id: &str) -> Result<Arc<Application>, ApiError> {
        self.channels
            .app_registry()
            .find_by_id(app_id)
            .ok_or(ApiError::AppNotFound)
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/app/:key", get(ws_handler))
        .route("/apps/:app_id/events", post(trigger_handler))
        .route("/apps/:app_id/channels", get(channels_handler))
        .route("/apps/:app_id/channels/:channel", get(channel_handler))
        .route("/apps/:app_id/auth", post(auth_handler))
        .route("/apps/:app_id/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let (state, hub_task) = AppState::new(&config, shutdown.clone())?;

    tokio::spawn(metrics::report_statistics(
        Arc::clone(&state.stats),
        Arc::clone(&state.channels),
        STATS_REPORT_PERIOD,
        shutdown.clone(),
    ));

    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => {
                tokio::spawn(metrics::sample_channels(
                    Arc::clone(&state.channels),
                    METRICS_SAMPLE_PERIOD,
                    shutdown.clone(),
                ));
            }
            Err(e) => error!(error = %e, "Failed to start metrics server"),
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(%addr, apps = config.apps.len(), "Relay server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = hub_task.await {
        error!(error = %e, "Hub task failed");
    }
    info!("Relay server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
        () = shutdown.cancelled() => {}
    }
    info!("Shutting down");
    // Closes every connection through the hub.
    shutdown.cancel();
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(app) = state.channels.app_registry().find_by_key(&key) else {
        warn!(key = %key, "Connection for unknown app key");
        return StatusCode::FORBIDDEN.into_response();
    };

    let unsupported = params
        .get("protocol")
        .filter(|raw| !Version::parse(raw).is_some_and(|v| v.is_supported()))
        .cloned();

    let gateway = state.gateway.clone();
    let limit = gateway.config().max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| async move {
            let (reader, mut writer) = websocket::split(socket);

            if let Some(raw) = unsupported {
                warn!(app_id = %app.id(), protocol = %raw, "Unsupported protocol version");
                let message = OutgoingMessage::error(
                    format!("Unsupported protocol version {raw}"),
                    Some(ErrorCode::UnsupportedProtocol),
                );
                reject(&mut writer, &message, gateway.config().write_wait).await;
                return;
            }

            gateway.serve(app, reader, writer).await;
        })
}

/// REST failures.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unknown application")]
    AppNotFound,

    #[error(transparent)]
    Unauthorized(#[from] RestAuthError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::AppNotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Resolve the application and check the request signature.
fn authorize(
    state: &AppState,
    app_id: &str,
    method: &Method,
    uri: &Uri,
    params: &[(String, String)],
) -> Result<Arc<Application>, ApiError> {
    let app = state.find_app(app_id)?;
    if let Err(e) = rest_auth::verify_request(&app, method.as_str(), uri.path(), params) {
        warn!(app_id, path = %uri.path(), error = %e, "Rejected REST request");
        metrics::record_auth_failure("rest");
        return Err(e.into());
    }
    Ok(app)
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Body of a trigger request.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    /// Event name.
    pub name: String,
    /// Payload, relayed untouched.
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    /// Connection to leave out of the broadcast.
    #[serde(default)]
    pub socket_id: Option<String>,
}

impl TriggerRequest {
    /// Every targeted channel, once each, in request order.
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = Vec::new();
        for name in self.channel.iter().chain(self.channels.iter()) {
            if !targets.contains(&name.as_str()) {
                targets.push(name);
            }
        }
        targets
    }
}

/// Publish a triggered event to every existing target channel.
///
/// Returns the number of connections reached.
pub fn trigger(state: &AppState, app_id: &str, request: &TriggerRequest) -> usize {
    let excluded = request.socket_id.as_deref().map(SocketId::from);
    let mut delivered = 0;

    for name in request.targets() {
        let Some(channel) = state.channels.find_channel(app_id, name) else {
            debug!(app_id, channel = %name, "Trigger for channel without subscribers");
            continue;
        };

        let message = OutgoingMessage::event(name, request.name.as_str(), request.data.clone());
        let recipients = match &excluded {
            Some(socket_id) => channel.broadcast_except(&message, socket_id),
            None => channel.broadcast(&message),
        };
        trace!(app_id, channel = %name, recipients, "Triggered event");
        delivered += recipients;

        dashboard::log_event(
            &state.channels,
            LogEventType::ApiMessage,
            LogDetails::new(app_id)
                .channel(name)
                .event(request.name.as_str())
                .payload(request.data.clone()),
        );
    }

    state.stats.on_api_message(app_id);
    delivered
}

/// `POST /apps/:app_id/events`
async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params)?;
    let request: TriggerRequest = parse_body(&body)?;
    if request.name.is_empty() {
        return Err(ApiError::BadRequest("Event name is required".to_string()));
    }

    trigger(&state, app.id(), &request);
    Ok(Json(json!({})))
}

/// Occupancy of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub subscription_count: usize,
}

/// Occupied channels of an application, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelList {
    pub channels: BTreeMap<String, ChannelInfo>,
}

/// State of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub occupied: bool,
    pub subscription_count: usize,
}

/// List the occupied channels of an application whose names start with `prefix`.
#[must_use]
pub fn list_channels(channels: &ChannelManager, app_id: &str, prefix: &str) -> ChannelList {
    let channels = channels
        .all_channels(app_id)
        .into_iter()
        .filter(|channel| channel.name().starts_with(prefix))
        .filter_map(|channel| {
            let subscription_count = channel.subscriber_count();
            (subscription_count > 0)
                .then(|| (channel.name().to_string(), ChannelInfo { subscription_count }))
        })
        .collect();
    ChannelList { channels }
}

/// `GET /apps/:app_id/channels`
async fn channels_handler(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<ChannelList>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params)?;
    let prefix = params
        .iter()
        .find(|(k, _)| k == "filter_by_prefix")
        .map_or("", |(_, v)| v.as_str());

    Ok(Json(list_channels(&state.channels, app.id(), prefix)))
}

/// `GET /apps/:app_id/channels/:channel`
async fn channel_handler(
    State(state): State<Arc<AppState>>,
    Path((app_id, channel)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<ChannelStatus>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params)?;
    let subscription_count = state
        .channels
        .find_channel(app.id(), &channel)
        .map_or(0, |channel| channel.subscriber_count());

    Ok(Json(ChannelStatus {
        occupied: subscription_count > 0,
        subscription_count,
    }))
}

/// Body of a private channel authorization request.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthRequest {
    pub socket_id: String,
    pub channel_name: String,
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// Token a client presents with `pusher:subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResponse {
    pub auth: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

/// Sign a subscription for `request` on behalf of `app`.
///
/// # Errors
///
/// Returns [`ApiError::BadRequest`] unless the channel is private and a
/// socket id is given.
pub fn authorize_channel(
    app: &Application,
    request: AuthRequest,
) -> Result<AuthResponse, ApiError> {
    if request.socket_id.is_empty() {
        return Err(ApiError::BadRequest("socket_id is required".to_string()));
    }
    if !ChannelKind::from_name(&request.channel_name).requires_auth() {
        return Err(ApiError::BadRequest(format!(
            "{} is not a private channel",
            request.channel_name
        )));
    }

    let auth = auth::channel_token(
        app,
        &request.socket_id,
        &request.channel_name,
        request.channel_data.as_deref(),
    )
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(AuthResponse {
        auth,
        channel_data: request.channel_data,
    })
}

/// `POST /apps/:app_id/auth`
async fn auth_handler(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Json<AuthResponse>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params)?;
    let request: AuthRequest = parse_body(&body)?;
    Ok(Json(authorize_channel(&app, request)?))
}

/// `GET /apps/:app_id/stats`
async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    method: Method,
    uri: Uri,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Statistic>, ApiError> {
    let app = authorize(&state, &app_id, &method, &uri, &params)?;
    Ok(Json(state.stats.snapshot(app.id())))
}
