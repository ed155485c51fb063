//! HTTP API server: device linking, bulk sends and the push-event sockets.
//!
//! Every endpoint takes an optional `session` query parameter selecting the
//! link session (default `default`). Errors are returned as
//! `{"error": "...", "kind": "..."}` with a status derived from the kind.
//!
//! Push events are served twice: as socket.io events `qr`, `ready` and
//! `auth_failure` on the default namespace (what browser UIs connect to),
//! and as JSON frames on the plain WebSocket at `/events`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use socketioxide::{extract::SocketRef, SocketIo};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast::error::RecvError, Notify};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use wasend_channels::qr::generate_qr_image;
use wasend_core::{
    config::ApiConfig,
    error::{ErrorKind, WasendError},
    link::{LinkSnapshot, LinkState, PushEvent, DEFAULT_SESSION_ID},
};

use crate::dispatch::DispatchService;
use crate::session::{LinkSession, SessionRegistry};

type ApiError = (StatusCode, Json<Value>);

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    sessions: Arc<SessionRegistry>,
    dispatch: Arc<DispatchService>,
    api_key: Option<String>,
    uptime: Instant,
}

impl ApiState {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        dispatch: Arc<DispatchService>,
        config: &ApiConfig,
    ) -> Self {
        let api_key = if config.api_key.is_empty() {
            None
        } else {
            Some(config.api_key.clone())
        };
        Self {
            sessions,
            dispatch,
            api_key,
            uptime: Instant::now(),
        }
    }

    async fn session(&self, query: &SessionQuery) -> Result<Arc<LinkSession>, ApiError> {
        self.sessions
            .get_or_create(query.session_id())
            .await
            .map_err(|e| error_response(&e))
    }
}

/// Query parameters shared by all endpoints.
#[derive(Debug, Default, Deserialize)]
struct SessionQuery {
    session: Option<String>,
    /// Bearer token for clients that cannot set headers (browser WebSockets).
    token: Option<String>,
}

impl SessionQuery {
    fn session_id(&self) -> &str {
        self.session.as_deref().unwrap_or(DEFAULT_SESSION_ID)
    }
}

/// HTTP status for an error kind.
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::NotLinked | ErrorKind::DispatchBusy => StatusCode::CONFLICT,
        ErrorKind::MalformedSpreadsheet => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::LinkFailed | ErrorKind::SendFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::Config | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &WasendError) -> ApiError {
    let kind = err.kind();
    let mut body = json!({
        "error": err.to_string(),
        "kind": kind,
    });
    if let Some(report) = err.report() {
        body["report"] = json!(report);
    }
    (status_for(kind), Json(body))
}

fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": message, "kind": ErrorKind::Unauthorized})),
    )
}

/// Constant-time string comparison to prevent timing attacks on API token validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check bearer token auth. Returns `None` if authorized, `Some(response)` if rejected.
///
/// A `token` query parameter is accepted in place of the header.
fn check_auth(
    headers: &HeaderMap,
    query_token: Option<&str>,
    api_key: &Option<String>,
) -> Option<ApiError> {
    let key = api_key.as_ref()?;

    if let Some(token) = query_token {
        return if constant_time_eq(token, key) {
            None
        } else {
            Some(unauthorized("invalid token"))
        };
    }

    let Some(header) = headers.get("authorization") else {
        return Some(unauthorized("missing Authorization header"));
    };
    let Ok(value) = header.to_str() else {
        return Some(unauthorized("invalid Authorization header"));
    };

    match value.strip_prefix("Bearer ") {
        Some(token) if constant_time_eq(token, key) => None,
        _ => Some(unauthorized("invalid token")),
    }
}

/// `GET /health`: uptime and number of known sessions.
async fn health(
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    State(state): State<ApiState>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, query.token.as_deref(), &state.api_key) {
        return Err(err);
    }

    Ok(Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime.elapsed().as_secs(),
        "sessions": state.sessions.count().await,
    })))
}

/// `GET /link-device`: start (or resume) linking the session's device.
async fn link_device(
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    State(state): State<ApiState>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, query.token.as_deref(), &state.api_key) {
        return Err(err);
    }

    let session = state.session(&query).await?;
    let ack = session.initiate_link().await.map_err(|e| {
        error!(session = %session.id(), "device linking failed: {e}");
        error_response(&e)
    })?;
    Ok(Json(json!(ack)))
}

/// `POST /unlink-device`: log the device out and forget its credentials.
async fn unlink_device(
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    State(state): State<ApiState>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, query.token.as_deref(), &state.api_key) {
        return Err(err);
    }

    let session = state.session(&query).await?;
    let ack = session.unlink().await.map_err(|e| {
        error!(session = %session.id(), "device unlink failed: {e}");
        error_response(&e)
    })?;
    Ok(Json(json!(ack)))
}

/// `GET /state`: current link snapshot.
async fn link_state(
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    State(state): State<ApiState>,
) -> Result<Json<LinkSnapshot>, ApiError> {
    if let Some(err) = check_auth(&headers, query.token.as_deref(), &state.api_key) {
        return Err(err);
    }

    let session = state.session(&query).await?;
    Ok(Json(session.snapshot().await))
}

/// `GET /qr`: the pending QR code, raw and as a base64 PNG.
async fn qr_code(
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    State(state): State<ApiState>,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, query.token.as_deref(), &state.api_key) {
        return Err(err);
    }

    let session = state.session(&query).await?;
    let Some(qr) = session.snapshot().await.qr else {
        return Err(error_response(&WasendError::NotFound(
            "no QR code pending for this session".into(),
        )));
    };

    let png = generate_qr_image(&qr).map_err(|e| {
        error!("QR image generation failed: {e}");
        error_response(&e)
    })?;

    Ok(Json(json!({
        "qr": qr,
        "qr_png_base64": BASE64.encode(&png),
    })))
}

/// Fields of a `/send-messages` upload.
#[derive(Default)]
struct SendForm {
    message: String,
    file: Vec<u8>,
    session: Option<String>,
}

async fn read_send_form(mut multipart: Multipart) -> Result<SendForm, WasendError> {
    let bad = |e: axum::extract::multipart::MultipartError| {
        WasendError::InvalidInput(format!("invalid multipart body: {e}"))
    };

    let mut form = SendForm::default();
    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("message") => form.message = field.text().await.map_err(bad)?,
            Some("file") => form.file = field.bytes().await.map_err(bad)?.to_vec(),
            Some("session") => form.session = Some(field.text().await.map_err(bad)?),
            other => debug!(field = ?other, "ignoring unknown multipart field"),
        }
    }
    Ok(form)
}

/// `POST /send-messages`: send a templated message to every spreadsheet row.
async fn send_messages(
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    State(state): State<ApiState>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    if let Some(err) = check_auth(&headers, query.token.as_deref(), &state.api_key) {
        return Err(err);
    }

    let form = read_send_form(multipart)
        .await
        .map_err(|e| error_response(&e))?;

    let session = match form.session {
        Some(id) => state
            .sessions
            .get_or_create(&id)
            .await
            .map_err(|e| error_response(&e))?,
        None => state.session(&query).await?,
    };

    match state
        .dispatch
        .submit(&session, &form.message, form.file)
        .await
    {
        Ok(report) => Ok(Json(json!({
            "message": report.summary(),
            "report": report,
        }))),
        Err(e) => {
            warn!(session = %session.id(), "bulk send rejected: {e}");
            Err(error_response(&e))
        }
    }
}

/// `GET /events`: WebSocket push channel for link events.
async fn events(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<SessionQuery>,
    State(state): State<ApiState>,
) -> Result<Response, ApiError> {
    if let Some(err) = check_auth(&headers, query.token.as_deref(), &state.api_key) {
        return Err(err);
    }

    let session = state.session(&query).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, session)))
}

fn state_frame(snapshot: &LinkSnapshot) -> String {
    json!({"event": "state", "data": snapshot}).to_string()
}

/// Forward one session's push events to a WebSocket until either side closes.
async fn handle_socket(socket: WebSocket, session: Arc<LinkSession>) {
    let mut subscription = session.subscribe().await;
    info!(session = %session.id(), "push subscriber connected");

    let (mut sink, mut stream) = socket.split();

    if sink
        .send(Message::Text(state_frame(&subscription.snapshot).into()))
        .await
        .is_err()
    {
        return;
    }

    let sender_session = Arc::clone(&session);
    let send_task = tokio::spawn(async move {
        loop {
            let frame = match subscription.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("push event serialization failed: {e}");
                        continue;
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %sender_session.id(), skipped, "push subscriber lagged, resyncing");
                    state_frame(&sender_session.snapshot().await)
                }
                Err(RecvError::Closed) => break,
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                debug!(session = %sender_session.id(), "push socket closed");
                break;
            }
        }
        subscription.cancel();
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session = %session.id(), error = %e, "push socket receive error");
                break;
            }
        }
    }

    send_task.abort();
    info!(session = %session.id(), "push subscriber disconnected");
}

/// Emit one push event to a socket.io client. Returns false once the
/// socket is gone.
fn emit_push(socket: &SocketRef, event: &PushEvent) -> bool {
    let result = match event.payload() {
        Some(payload) => socket.emit(event.name(), payload),
        None => socket.emit(event.name(), &()),
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            debug!(socket = %socket.id, "socket.io emit failed: {e}");
            false
        }
    }
}

fn emit_state(socket: &SocketRef, snapshot: &LinkSnapshot) -> bool {
    match socket.emit("state", snapshot) {
        Ok(()) => true,
        Err(e) => {
            debug!(socket = %socket.id, "socket.io emit failed: {e}");
            false
        }
    }
}

/// A socket.io client joined the default namespace.
///
/// Auth and session selection come from the handshake request, exactly as
/// for `/events`. The client gets a `state` event, the pending QR code if a
/// scan is awaited, and then every push event of the session.
async fn on_socket_io_connect(socket: SocketRef, state: ApiState) {
    let parts = socket.req_parts();
    let query = Query::<SessionQuery>::try_from_uri(&parts.uri)
        .map(|Query(q)| q)
        .unwrap_or_default();

    let session = match check_auth(&parts.headers, query.token.as_deref(), &state.api_key) {
        Some(_) => Err("invalid token".to_string()),
        None => state
            .session(&query)
            .await
            .map_err(|(_, Json(body))| body["error"].as_str().unwrap_or_default().to_string()),
    };
    let session = match session {
        Ok(session) => session,
        Err(reason) => {
            warn!(socket = %socket.id, "socket.io client rejected: {reason}");
            if let Err(e) = socket.disconnect() {
                debug!("socket.io disconnect failed: {e}");
            }
            return;
        }
    };

    let mut subscription = session.subscribe().await;
    info!(session = %session.id(), socket = %socket.id, "socket.io subscriber connected");

    let snapshot = &subscription.snapshot;
    if !emit_state(&socket, snapshot) {
        return;
    }
    if let (LinkState::AwaitingScan, Some(qr)) = (snapshot.state, snapshot.qr.clone()) {
        if !emit_push(&socket, &PushEvent::Qr(qr)) {
            return;
        }
    }

    let closed = Arc::new(Notify::new());
    let on_close = Arc::clone(&closed);
    socket.on_disconnect(move |_: SocketRef| on_close.notify_one());

    loop {
        let delivered = tokio::select! {
            _ = closed.notified() => break,
            received = subscription.recv() => match received {
                Ok(event) => emit_push(&socket, &event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session = %session.id(), skipped, "socket.io subscriber lagged, resyncing");
                    emit_state(&socket, &session.snapshot().await)
                }
                Err(RecvError::Closed) => break,
            },
        };
        if !delivered {
            break;
        }
    }

    subscription.cancel();
    info!(session = %session.id(), socket = %socket.id, "socket.io subscriber disconnected");
}

/// CORS: any origin when none are configured, otherwise the configured list.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    if config.cors_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(origin) => Some(origin),
            Err(e) => {
                warn!("ignoring invalid CORS origin '{o}': {e}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// Build the axum router with shared state.
pub fn build_router(state: ApiState, config: &ApiConfig) -> Router {
    let (socket_io, io) = SocketIo::new_layer();
    let sio_state = state.clone();
    io.ns("/", move |socket: SocketRef| {
        tokio::spawn(on_socket_io_connect(socket, sio_state.clone()));
    });

    Router::new()
        .route("/health", get(health))
        .route("/link-device", get(link_device))
        .route("/unlink-device", post(unlink_device))
        .route("/state", get(link_state))
        .route("/qr", get(qr_code))
        .route("/send-messages", post(send_messages))
        .route("/events", get(events))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(socket_io)
        .layer(build_cors_layer(config))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Start the API server and run until Ctrl-C.
pub async fn serve(
    config: &ApiConfig,
    sessions: Arc<SessionRegistry>,
    dispatch: Arc<DispatchService>,
) -> anyhow::Result<()> {
    let state = ApiState::new(sessions, dispatch, config);
    let app = build_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("API server failed to bind to {addr}: {e}"))?;

    info!("API server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests;
