//! HTTP and websocket surface for the operator UI.
//!
//! The server is a thin shell over the pipeline's [`UiBridge`]: REST
//! endpoints read status/config and poke the two reconfiguration sinks,
//! `/ws` streams every UI message as a text frame, and the `/detector` and
//! `/simplon` routes proxy to the detector control API. The browser assets
//! themselves live elsewhere; `/` serves a minimal placeholder page.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{AppResult, StxmError};
use crate::pipeline::{UiBridge, UiMessage};
use crate::simplon;

const WRITE_WAIT: Duration = Duration::from_secs(10);
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping at 90 % of the pong deadline.
const PING_EVERY: Duration = Duration::from_millis(PONG_WAIT.as_millis() as u64 * 9 / 10);
/// Grace period for open connections after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const INDEX_HTML: &str = "<!doctype html>\n<title>stxm-map</title>\n<p>stxm-map acquisition daemon. UI assets are deployed separately; \nsee <a href=\"/status\">/status</a> and <a href=\"/config\">/config</a>.</p>\n";

#[derive(Clone)]
struct AppState {
    bridge: Arc<UiBridge>,
    api_version: String,
    broadcast: broadcast::Sender<String>,
    token: CancellationToken,
}

impl AppState {
    fn simplon_base_url(&self) -> String {
        self.bridge.shared.endpoint_update().simplon_base_url
    }
}

/// Run the server until cancellation, forwarding UI messages to every
/// connected websocket client.
pub async fn run(
    cfg: &AppConfig,
    bridge: Arc<UiBridge>,
    mut ui_rx: mpsc::Receiver<UiMessage>,
    token: CancellationToken,
) -> AppResult<()> {
    let (broadcast_tx, _) = broadcast::channel::<String>(32);

    // Fan UI messages out to websocket subscribers as serialized text.
    let forward_tx = broadcast_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(message) = ui_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    let _ = forward_tx.send(text);
                }
                Err(err) => debug!(error = %err, "ui message serialization failed"),
            }
        }
    });

    let state = AppState {
        bridge,
        api_version: cfg.api_version.clone(),
        broadcast: broadcast_tx,
        token: token.clone(),
    };

    let app = Router::new()
        .route("/", get(|| async { Html(INDEX_HTML) }))
        .route("/healthz", get(|| async { "ok" }))
        .route("/config", get(handle_config))
        .route("/status", get(handle_status))
        .route("/ui/grid", put(handle_grid))
        .route("/ui/endpoint", put(handle_endpoint))
        .route("/detector/command/:command", post(handle_detector_command))
        .route("/detector/config/:param", put(handle_detector_config))
        .route("/simplon/:module/:kind/*param", any(handle_simplon))
        .route("/ws", get(handle_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .map_err(|e| StxmError::Transport(format!("bind port {}: {e}", cfg.port)))?;
    info!(port = cfg.port, "web ui listening");

    let shutdown_token = token.clone();
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await });

    let result = tokio::select! {
        res = serve => res.map_err(|e| StxmError::Transport(format!("server: {e}"))),
        _ = async {
            token.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("server shutdown grace expired, abandoning open connections");
            Ok(())
        }
    };
    forwarder.abort();
    result
}

async fn handle_config(State(state): State<AppState>) -> Json<Value> {
    Json(state.bridge.config_json())
}

async fn handle_status(State(state): State<AppState>) -> Json<Value> {
    let mut status = state.bridge.status_json();
    let clients = state.broadcast.receiver_count();
    match status.get_mut("metrics").and_then(Value::as_object_mut) {
        Some(metrics) => {
            metrics.insert("ws_clients".into(), json!(clients));
        }
        None => {
            status["ws_clients"] = json!(clients);
        }
    }
    Json(status)
}

/// Loose integer coercion for request bodies (numbers may arrive as
/// floats from JS clients).
fn loose_u64(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn bad_request(error: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"ok": false, "error": error.to_string()})),
    )
        .into_response()
}

async fn handle_grid(State(state): State<AppState>, body: Option<Json<Value>>) -> Response {
    let Some(Json(body)) = body else {
        return bad_request("invalid json body");
    };
    let Some(grid_x) = loose_u64(body.get("grid_x")).filter(|x| *x >= 1) else {
        return bad_request("invalid grid_x");
    };
    let Some(grid_y) = loose_u64(body.get("grid_y")).filter(|y| *y >= 1) else {
        return bad_request("invalid grid_y");
    };
    match state.bridge.request_grid(grid_x as usize, grid_y as usize) {
        Ok(()) => Json(json!({
            "ok": true,
            "status": 200,
            "grid_x": grid_x,
            "grid_y": grid_y,
        }))
        .into_response(),
        Err(err) => bad_request(err),
    }
}

async fn handle_endpoint(State(state): State<AppState>, body: Option<Json<Value>>) -> Response {
    let Some(Json(body)) = body else {
        return bad_request("invalid json body");
    };
    let Some(detector_ip) = body.get("detector_ip").and_then(Value::as_str) else {
        return bad_request("missing detector_ip");
    };
    let Some(zmq_port) = loose_u64(body.get("zmq_port")).filter(|p| (1..=65535).contains(p)) else {
        return bad_request("invalid zmq_port");
    };
    let Some(api_port) = loose_u64(body.get("api_port")).filter(|p| (1..=65535).contains(p)) else {
        return bad_request("invalid api_port");
    };
    match state
        .bridge
        .request_endpoint(detector_ip, zmq_port as u16, api_port as u16)
    {
        Ok(()) => Json(json!({
            "ok": true,
            "status": 200,
            "detector_ip": detector_ip,
            "zmq_port": zmq_port,
            "api_port": api_port,
        }))
        .into_response(),
        Err(err) => bad_request(err),
    }
}

async fn handle_detector_command(
    State(state): State<AppState>,
    Path(command): Path<String>,
) -> Response {
    match command.as_str() {
        "initialize" | "arm" | "trigger" | "disarm" => {}
        _ => return bad_request("unsupported command"),
    }
    let base_url = state.simplon_base_url();
    if base_url.is_empty() {
        return bad_request("simplon base url not configured");
    }
    simplon::command_async(&base_url, &state.api_version, "detector", &command);
    (
        StatusCode::ACCEPTED,
        Json(json!({"ok": true, "status": 202, "command": command})),
    )
        .into_response()
}

async fn handle_detector_config(
    State(state): State<AppState>,
    Path(param): Path<String>,
    body: Option<Json<Value>>,
) -> Response {
    if param.is_empty() {
        return bad_request("missing parameter");
    }
    let base_url = state.simplon_base_url();
    if base_url.is_empty() {
        return bad_request("simplon base url not configured");
    }
    let Some(Json(body)) = body else {
        return bad_request("invalid json body");
    };
    let Some(value) = body.get("value") else {
        return bad_request("missing value");
    };
    let (code, body) =
        simplon::config_set(&base_url, &state.api_version, "detector", &param, value).await;
    proxied_json(code, &param, body)
}

fn proxied_json(code: u16, param: &str, body: String) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
    (
        status,
        Json(json!({
            "ok": (200..300).contains(&code),
            "status": code,
            "param": param,
            "body": body,
        })),
    )
        .into_response()
}

async fn handle_simplon(
    State(state): State<AppState>,
    method: Method,
    Path((module, kind, param)): Path<(String, String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    body: Option<Json<Value>>,
) -> Response {
    if param.is_empty() {
        return bad_request("missing parameter");
    }
    let base_url = state.simplon_base_url();
    if base_url.is_empty() {
        return bad_request("simplon base url not configured");
    }

    match kind.as_str() {
        "command" => {
            if method != Method::POST {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            simplon::command_async(&base_url, &state.api_version, &module, &param);
            (
                StatusCode::ACCEPTED,
                Json(json!({"ok": true, "status": 202, "param": param})),
            )
                .into_response()
        }
        "config" => {
            if method == Method::PUT {
                let Some(Json(body)) = body else {
                    return bad_request("invalid json body");
                };
                let Some(value) = body.get("value") else {
                    return bad_request("missing value");
                };
                let (code, body) =
                    simplon::config_set(&base_url, &state.api_version, &module, &param, value)
                        .await;
                proxied_json(code, &param, body)
            } else if method == Method::GET {
                let (code, body) =
                    simplon::config_get(&base_url, &state.api_version, &module, &param).await;
                proxied_json(code, &param, body)
            } else {
                StatusCode::METHOD_NOT_ALLOWED.into_response()
            }
        }
        "status" => {
            if method != Method::GET {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            let (code, body) =
                simplon::status_get(&base_url, &state.api_version, &module, &param).await;
            proxied_json(code, &param, body)
        }
        "images" => {
            if method != Method::GET {
                return StatusCode::METHOD_NOT_ALLOWED.into_response();
            }
            proxy_images(&state, &module, &param, &query).await
        }
        _ => bad_request("unsupported operation"),
    }
}

/// Raw pass-through for monitor images: first non-404 candidate wins,
/// headers and body copied verbatim.
async fn proxy_images(
    state: &AppState,
    module: &str,
    param: &str,
    query: &[(String, String)],
) -> Response {
    let base_url = state.simplon_base_url();
    let paths = simplon::candidate_paths(&base_url, &state.api_version, module, "images", param);
    if paths.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(err) => return bad_request(err),
    };
    for path in paths {
        let response = match client.get(&path).query(query).send().await {
            Ok(response) => response,
            Err(_) => continue,
        };
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            continue;
        }
        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        for (name, value) in response.headers() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let body = response.bytes().await.unwrap_or_default();
        return builder
            .body(axum::body::Body::from(body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    }
    StatusCode::NOT_FOUND.into_response()
}

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

/// One websocket client: config envelope on connect, snapshot replies on
/// request, broadcast forwarding, ping/pong liveness.
async fn client_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let greeting = state.bridge.config_json().to_string();
    if send_text(&mut sink, greeting).await.is_err() {
        return;
    }

    let mut feed = state.broadcast.subscribe();
    let mut ping = tokio::time::interval(PING_EVERY);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = state.token.cancelled() => break,
            incoming = stream.next() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Text(text))) => {
                        let request: Value = match serde_json::from_str(&text) {
                            Ok(request) => request,
                            Err(_) => continue,
                        };
                        if request.get("type").and_then(Value::as_str) == Some("snapshot_request") {
                            let Some(snapshot) = state.bridge.latest_snapshot() else {
                                continue;
                            };
                            let Ok(text) = serde_json::to_string(&snapshot) else {
                                continue;
                            };
                            if send_text(&mut sink, text).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
            broadcasted = feed.recv() => {
                match broadcasted {
                    Ok(text) => {
                        if send_text(&mut sink, text).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "websocket client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > PONG_WAIT {
                    debug!("websocket pong deadline missed");
                    break;
                }
                let ping_sent = tokio::time::timeout(
                    WRITE_WAIT,
                    sink.send(Message::Ping(Vec::new())),
                )
                .await;
                if !matches!(ping_sent, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn send_text(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    text: String,
) -> Result<(), ()> {
    match tokio::time::timeout(WRITE_WAIT, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}
