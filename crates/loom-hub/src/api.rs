use crate::bus::ControlBus;
use crate::session::{SessionError, SessionInfo, SessionRegistry};
use crate::workspace::{browse, BrowseListing, FileError, Workspace, WorkspaceInfo};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path as UrlPath, Query, Request, State,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use loom_core::{
    control::{decode_client_message, encode_message, MAX_CLIENT_FRAME_BYTES},
    ClientMessage, ControlMessage, PendingReview, SessionId, Subscription, WorkspaceError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::Io { .. } => ApiError::Internal(err.to_string()),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        match &err {
            FileError::Path(_) => ApiError::BadRequest(err.to_string()),
            _ if err.is_not_found() => ApiError::NotFound(err.to_string()),
            FileError::Io { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidCwd(_) => ApiError::BadRequest(err.to_string()),
            SessionError::Spawn { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Shared state behind every route.
pub struct Hub {
    config: HubConfig,
    bus: ControlBus,
    sessions: SessionRegistry,
    workspace: Workspace,
    primary: Mutex<Option<SessionId>>,
    _exit_notices: Subscription,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        bus: ControlBus,
        sessions: SessionRegistry,
        workspace: Workspace,
    ) -> Arc<Self> {
        let notices = bus.clone();
        let exit_notices = sessions.on_any_exit(move |exit| {
            notices.publish(ControlMessage::SessionExited {
                session_id: exit.id,
                exit_code: exit.exit_code,
            });
        });
        Arc::new(Self {
            config,
            bus,
            sessions,
            workspace,
            primary: Mutex::new(None),
            _exit_notices: exit_notices,
        })
    }

    pub fn set_primary(&self, id: SessionId) {
        *self.primary.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    /// The single-terminal target, while it is still alive.
    pub fn primary(&self) -> Option<SessionId> {
        let id = (*self.primary.lock().unwrap_or_else(PoisonError::into_inner))?;
        self.sessions.contains(id).then_some(id)
    }

    fn handle_client_message(&self, raw: &[u8], conn: u64) {
        let msg = match decode_client_message(raw, MAX_CLIENT_FRAME_BYTES) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(event = "control_message_invalid", subscriber = conn, error = %err);
                return;
            }
        };
        match msg {
            ClientMessage::ResizeRequest {
                session_id,
                cols,
                rows,
            } => match session_id.or_else(|| self.primary()) {
                Some(id) => {
                    debug!(event = "resize_request", subscriber = conn, id = id, cols = cols, rows = rows);
                    self.sessions.resize(id, cols, rows);
                }
                None => debug!(event = "resize_without_target", subscriber = conn),
            },
        }
    }

    async fn handle_control(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let mut sub = self.bus.subscribe();
        let conn = sub.id();
        info!(event = "control_connect", subscriber = conn, remote = %remote);

        let write_timeout = self.config.write_timeout;
        let mut write_task = tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                let text = match encode_message(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = "control_encode_error", subscriber = conn, error = %err);
                        continue;
                    }
                };
                let send = ws_sender.send(Message::Text(text));
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(event = "control_write_error", subscriber = conn, error = %err);
                        return;
                    }
                    Err(_) => {
                        warn!(event = "control_write_timeout", subscriber = conn);
                        return;
                    }
                }
            }
        });

        loop {
            let incoming = tokio::select! {
                incoming = ws_receiver.next() => incoming,
                _ = &mut write_task => break,
            };
            let data = match incoming {
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(bytes))) => bytes,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    warn!(event = "control_read_error", subscriber = conn, error = %err);
                    break;
                }
            };
            self.handle_client_message(&data, conn);
        }

        write_task.abort();
        info!(event = "control_disconnect", subscriber = conn);
    }

    async fn handle_pty(self: Arc<Self>, socket: WebSocket, id: SessionId) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<PtyFrame>();

        let data_tx = tx.clone();
        let data_sub = self.sessions.on_data(id, move |bytes| {
            let _ = data_tx.send(PtyFrame::Output(bytes.to_vec()));
        });
        let exit_sub = self.sessions.on_exit(id, move |exit| {
            let _ = tx.send(PtyFrame::Exit(exit.exit_code));
        });
        let (Some(data_sub), Some(exit_sub)) = (data_sub, exit_sub) else {
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: 4404,
                    reason: format!("no session {id}").into(),
                })))
                .await;
            return;
        };
        info!(event = "pty_attach", id = id);

        let write_timeout = self.config.write_timeout;
        let mut write_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let msg = match frame {
                    PtyFrame::Output(bytes) => Message::Binary(bytes),
                    PtyFrame::Exit(code) => {
                        let _ = ws_sender
                            .send(Message::Close(Some(CloseFrame {
                                code: 1000,
                                reason: format!("exited {}", code.map_or(-1, i64::from)).into(),
                            })))
                            .await;
                        return;
                    }
                };
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        });

        loop {
            let incoming = tokio::select! {
                incoming = ws_receiver.next() => incoming,
                _ = &mut write_task => break,
            };
            match incoming {
                Some(Ok(Message::Text(text))) => self.sessions.write(id, text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => self.sessions.write(id, &bytes),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(event = "pty_read_error", id = id, error = %err);
                    break;
                }
            }
        }

        data_sub.detach();
        exit_sub.detach();
        write_task.abort();
        info!(event = "pty_detach", id = id);
    }
}

enum PtyFrame {
    Output(Vec<u8>),
    Exit(Option<u32>),
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws/control", get(control_ws))
        .route("/ws/pty", get(primary_pty_ws))
        .route("/ws/pty/:id", get(pty_ws))
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(spawn_session))
        .route("/api/sessions/:id", axum::routing::delete(kill_session))
        .route("/api/sessions/:id/write", post(write_session))
        .route("/api/sessions/:id/resize", post(resize_session))
        .route("/api/workspace", get(current_workspace))
        .route("/api/workspace/open", post(open_workspace))
        .route("/api/workspace/recent", get(recent_workspaces))
        .route("/api/workspace/browse", get(browse_workspace))
        .route("/api/reviews", get(list_reviews))
        .route("/api/reviews/accept", post(accept_review))
        .route("/api/reviews/reject", post(reject_review))
        .route("/api/reviews/accept-all", post(accept_all_reviews))
        .route("/api/reviews/reject-all", post(reject_all_reviews))
        .route("/api/files/content", get(read_file).put(write_file))
        .layer(middleware::from_fn(loopback_only))
        .with_state(hub)
}

async fn loopback_only(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !addr.ip().is_loopback() {
        warn!(event = "non_loopback_rejected", remote = %addr);
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

async fn control_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        hub.handle_control(socket, addr).await;
    })
}

async fn primary_pty_ws(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    match hub.primary() {
        Some(id) => ws
            .on_upgrade(move |socket| async move { hub.handle_pty(socket, id).await })
            .into_response(),
        None => ApiError::NotFound("no primary session".to_string()).into_response(),
    }
}

async fn pty_ws(
    ws: WebSocketUpgrade,
    UrlPath(id): UrlPath<SessionId>,
    State(hub): State<Arc<Hub>>,
) -> Response {
    if !hub.sessions.contains(id) {
        return ApiError::NotFound(format!("no session {id}")).into_response();
    }
    ws.on_upgrade(move |socket| async move { hub.handle_pty(socket, id).await })
        .into_response()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SpawnRequest {
    cols: Option<u16>,
    rows: Option<u16>,
    cwd: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct SpawnResponse {
    id: SessionId,
}

async fn spawn_session(
    State(hub): State<Arc<Hub>>,
    body: Option<Json<SpawnRequest>>,
) -> ApiResult<SpawnResponse> {
    let Json(req) = body.unwrap_or_default();
    let id = hub.sessions.spawn(
        req.cols.unwrap_or(DEFAULT_COLS),
        req.rows.unwrap_or(DEFAULT_ROWS),
        req.cwd,
    )?;
    Ok(Json(SpawnResponse { id }))
}

async fn list_sessions(State(hub): State<Arc<Hub>>) -> Json<Vec<SessionInfo>> {
    Json(hub.sessions.list())
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    data: String,
}

async fn write_session(
    State(hub): State<Arc<Hub>>,
    UrlPath(id): UrlPath<SessionId>,
    Json(req): Json<WriteRequest>,
) -> ApiResult<Value> {
    if !hub.sessions.contains(id) {
        return Err(ApiError::NotFound(format!("no session {id}")));
    }
    hub.sessions.write(id, req.data.as_bytes());
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    cols: u16,
    rows: u16,
}

async fn resize_session(
    State(hub): State<Arc<Hub>>,
    UrlPath(id): UrlPath<SessionId>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<Value> {
    if !hub.sessions.contains(id) {
        return Err(ApiError::NotFound(format!("no session {id}")));
    }
    hub.sessions.resize(id, req.cols, req.rows);
    Ok(Json(json!({ "ok": true })))
}

async fn kill_session(State(hub): State<Arc<Hub>>, UrlPath(id): UrlPath<SessionId>) -> Json<Value> {
    let killed = hub.sessions.kill(id);
    Json(json!({ "ok": true, "killed": killed }))
}

async fn current_workspace(State(hub): State<Arc<Hub>>) -> Json<WorkspaceInfo> {
    Json(hub.workspace.info())
}

#[derive(Debug, Deserialize)]
pub struct OpenRequest {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenResponse {
    ok: bool,
    path: PathBuf,
    project_name: String,
}

async fn open_workspace(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<OpenRequest>,
) -> ApiResult<OpenResponse> {
    if req.path.trim().is_empty() {
        return Err(ApiError::BadRequest("path required".to_string()));
    }
    let info = hub.workspace.open(req.path.trim())?;
    Ok(Json(OpenResponse {
        ok: true,
        path: info.path,
        project_name: info.project_name,
    }))
}

async fn recent_workspaces(State(hub): State<Arc<Hub>>) -> Json<Vec<PathBuf>> {
    Json(hub.workspace.recent())
}

#[derive(Debug, Deserialize)]
pub struct BrowseQuery {
    dir: Option<String>,
}

async fn browse_workspace(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<BrowseQuery>,
) -> ApiResult<BrowseListing> {
    let dir = match query.dir.filter(|dir| !dir.trim().is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => hub.workspace.root(),
    };
    Ok(Json(browse(&dir).await?))
}

async fn list_reviews(State(hub): State<Arc<Hub>>) -> Json<Vec<PendingReview>> {
    Json(hub.workspace.reviews())
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    path: String,
}

async fn accept_review(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<ReviewRequest>,
) -> ApiResult<Value> {
    let resolved = hub.workspace.accept(&req.path)?;
    Ok(Json(json!({ "ok": true, "resolved": resolved })))
}

async fn reject_review(
    State(hub): State<Arc<Hub>>,
    Json(req): Json<ReviewRequest>,
) -> ApiResult<Value> {
    let resolved = hub.workspace.reject(&req.path).await?;
    Ok(Json(json!({ "ok": true, "resolved": resolved })))
}

async fn accept_all_reviews(State(hub): State<Arc<Hub>>) -> Json<Value> {
    let count = hub.workspace.accept_all();
    Json(json!({ "ok": true, "count": count }))
}

async fn reject_all_reviews(State(hub): State<Arc<Hub>>) -> Json<Value> {
    let count = hub.workspace.reject_all().await;
    Json(json!({ "ok": true, "count": count }))
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileBody {
    path: String,
    content: String,
}

async fn read_file(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<FileQuery>,
) -> ApiResult<FileBody> {
    let content = hub.workspace.read_file(&query.path).await?;
    Ok(Json(FileBody {
        path: query.path,
        content,
    }))
}

async fn write_file(State(hub): State<Arc<Hub>>, Json(body): Json<FileBody>) -> ApiResult<Value> {
    hub.workspace.write_file(&body.path, body.content).await?;
    Ok(Json(json!({ "ok": true })))
}
