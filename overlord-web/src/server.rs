//! Web server module for Overlord.
//!
//! Provides the HTTPS UI, authentication, and the HTTP/WebSocket front end
//! that maps onto `overlord_core::Overlord`'s primitives (spec.md §6): agent
//! listing, monitor subscriptions, and per-mode session routes that attach a
//! user-side `ByteDuplex` and let the core bridge it against the matching
//! agent-originated connection.
//!
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{
        Multipart, Path, Query, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::{CookieJar, cookie::Cookie};
use axum_server::tls_rustls::RustlsConfig;
use base64::{Engine as _, engine::general_purpose};
use dashmap::DashMap;
use overlord_core::{CoreConfig, Overlord, UserAttachOutcome};
use overlord_proto::mode::SpawnParams;
use overlord_proto::otp::MyOtp;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::{
    config::CONFIG,
    duplex::{HttpDownloadDuplex, HttpUploadDuplex, WsDuplex},
    html::{INDEX_PAGE, LOGIN_PAGE, setup_2fa},
};

/// Shared application state: the core multiplexer plus the web layer's own
/// bookkeeping (download filenames aren't part of the core's rendezvous
/// contract, so they're tracked here against the session-id).
pub(crate) struct AppState {
    pub(crate) overlord: Arc<Overlord>,
    downloads: DashMap<Uuid, String>,
}

/// Start the agent-ingress listener, LAN discovery broadcast, and the HTTPS
/// axum server.
pub async fn run() {
    let core_tls = if CONFIG.agent_tls {
        match overlord_core::tls::load_server_config(CONFIG.cert.as_bytes(), CONFIG.key.as_bytes()) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                tracing::error!(error = %e, "invalid agent-ingress TLS certificate/key, starting plaintext");
                None
            }
        }
    } else {
        None
    };

    let overlord = Overlord::new(CoreConfig::default(), core_tls);
    overlord.spawn_maintenance();

    let agent_addr = SocketAddr::from(([0, 0, 0, 0], CONFIG.agent_port));
    let ingress_overlord = Arc::clone(&overlord);
    tokio::spawn(async move {
        if let Err(e) = ingress_overlord.run_agent_ingress(agent_addr).await {
            tracing::error!(error = %e, "agent ingress listener exited");
        }
    });

    if !CONFIG.ld_disabled {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let ld_port = CONFIG.ld_port;
        let agent_port = CONFIG.agent_port;
        let broadcast_addr = CONFIG.ld_broadcast_addr;
        tokio::spawn(async move {
            overlord_core::discovery::broadcast(ld_port, agent_port, broadcast_addr, rx).await;
        });
    }

    let state = Arc::new(AppState {
        overlord,
        downloads: DashMap::new(),
    });

    let config = RustlsConfig::from_pem(CONFIG.cert.as_bytes().to_vec(), CONFIG.key.as_bytes().to_vec())
        .await
        .expect("invalid web TLS certificate/key");

    let app = Router::new()
        .route("/", get(index_page))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{mid}/properties", get(agent_properties))
        .route("/api/agents/upgrade", post(upgrade_agents))
        .route("/api/monitor", get(monitor_handler))
        .route("/api/agent/tty/{mid}", get(tty_handler))
        .route("/api/agent/shell/{mid}", get(shell_handler))
        .route("/api/agent/forward/{mid}", get(forward_handler))
        .route("/api/agent/download/{mid}", post(start_download))
        .route("/api/file/download/{sid}", get(download_handler))
        .route("/api/agent/upload/{mid}", post(upload_handler))
        .with_state(state)
        .layer(axum::middleware::from_fn(auth_middleware))
        .route("/login", post(login_handler).get(show_login_page))
        .route("/setup-2fa", get(setup_2fa_handler));

    tracing::info!(web_port = CONFIG.web_port, agent_port = CONFIG.agent_port, "overlord web listening");

    let addr = SocketAddr::from(([0, 0, 0, 0], CONFIG.web_port));
    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .expect("https server failed");
}

/// Standardized `{"status":"success","data":<payload>}` envelope (spec.md
/// §7, §9) every HTTP/WS response other than a raw byte stream goes
/// through.
fn ok_envelope<T: serde::Serialize>(data: T) -> Response {
    Json(serde_json::json!({ "status": "success", "data": data })).into_response()
}

/// Same envelope's error shape for failures that aren't a `CoreError`
/// (`CoreError` has its own `IntoResponse` impl).
fn err_envelope(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "status": "error", "data": message.into() }))).into_response()
}

/// `GET /api/agents` (spec.md §6): list of `{mid, sid, properties, ...}`.
async fn list_agents(State(state): State<Arc<AppState>>) -> Response {
    ok_envelope(state.overlord.list_agents())
}

/// `GET /api/agents/{mid}/properties`.
async fn agent_properties(Path(mid): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    match state.overlord.registry.get(&mid) {
        Some(agent) => ok_envelope(agent.public_view().properties),
        None => err_envelope(StatusCode::NOT_FOUND, "agent not found"),
    }
}

/// `POST /api/agents/upgrade`: fire-and-forget `upgrade` to every Control
/// agent (spec.md §6).
async fn upgrade_agents(State(state): State<Arc<AppState>>) -> Response {
    for agent in state.overlord.list_agents() {
        if let Some(a) = state.overlord.registry.get(&agent.mid) {
            let _ = a.rpc.notify("upgrade", serde_json::json!({})).await;
        }
    }
    ok_envelope(Value::Null)
}

/// `WS /api/monitor`: subscribe/unsubscribe to lifecycle and session topics
/// (spec.md §4.6).
async fn monitor_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_monitor(socket, state))
}

#[derive(Deserialize)]
struct SubscribeOp {
    op: String,
    topic: String,
}

async fn handle_monitor(mut socket: WebSocket, state: Arc<AppState>) {
    let (id, mut events) = state.overlord.events.register();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(Message::Text(text))) = msg else { break };
                if let Ok(op) = serde_json::from_str::<SubscribeOp>(&text) {
                    match op.op.as_str() {
                        "subscribe" => state.overlord.events.subscribe(id, &op.topic),
                        "unsubscribe" => state.overlord.events.unsubscribe(id, &op.topic),
                        _ => {}
                    }
                }
            }
        }
    }

    state.overlord.events.remove_subscriber(id);
}

#[derive(Deserialize)]
struct TtyQuery {
    tty_device: Option<String>,
}

/// `WS /api/agent/tty/{mid}[?tty_device=<path>]`: Terminal session.
async fn tty_handler(
    Path(mid): Path<String>,
    Query(query): Query<TtyQuery>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let params = SpawnParams::Terminal {
        tty_device: query.tty_device,
        rows: 24,
        cols: 80,
    };
    open_and_bridge(ws, mid, params, state).await
}

#[derive(Deserialize)]
struct ShellQuery {
    command: String,
}

/// `WS /api/agent/shell/{mid}?command=<urlencoded>`: Shell session.
async fn shell_handler(
    Path(mid): Path<String>,
    Query(query): Query<ShellQuery>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let params = SpawnParams::Shell { command: query.command };
    open_and_bridge(ws, mid, params, state).await
}

#[derive(Deserialize)]
struct ForwardQuery {
    host: String,
    port: u16,
}

/// `WS /api/agent/forward/{mid}?host=<h>&port=<p>`: Forward session.
async fn forward_handler(
    Path(mid): Path<String>,
    Query(query): Query<ForwardQuery>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let params = SpawnParams::Forward { host: query.host, port: query.port };
    open_and_bridge(ws, mid, params, state).await
}

async fn open_and_bridge(ws: WebSocketUpgrade, mid: String, params: SpawnParams, state: Arc<AppState>) -> Response {
    let sid = match state.overlord.open_session(&mid, params).await {
        Ok(sid) => sid,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        let duplex = Box::new(WsDuplex::new(socket));
        match state.overlord.attach_user_side(sid, duplex) {
            UserAttachOutcome::Paired | UserAttachOutcome::Parked => {}
            UserAttachOutcome::NotFound | UserAttachOutcome::AlreadyPaired => {
                tracing::warn!(%sid, "user-side websocket attach failed");
            }
        }
    })
}

#[derive(Deserialize)]
struct DownloadRequest {
    path: String,
}

/// `POST /api/agent/download/{mid}`: creates a File-download session and
/// publishes the `file download` event (spec.md §4.3 rule 4, §8 S4); the
/// dashboard then auto-initiates the `GET` below.
async fn start_download(
    Path(mid): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(req): Json<DownloadRequest>,
) -> Response {
    let filename = req.path.rsplit('/').next().unwrap_or(&req.path).to_string();
    let params = SpawnParams::FileDownload { path: req.path };
    match state.overlord.open_session(&mid, params).await {
        Ok(sid) => {
            state.downloads.insert(sid, filename);
            ok_envelope(serde_json::json!({ "sid": sid }))
        }
        Err(e) => e.into_response(),
    }
}

/// `GET /api/file/download/{sid}`: drains a File-download session as a
/// streamed HTTP response body.
async fn download_handler(Path(sid): Path<Uuid>, State(state): State<Arc<AppState>>) -> Response {
    let filename = state
        .downloads
        .remove(&sid)
        .map(|(_, name)| name)
        .unwrap_or_else(|| sid.to_string());

    let (tx, rx) = mpsc::channel(16);
    let duplex = Box::new(HttpDownloadDuplex::new(tx));
    match state.overlord.attach_user_side(sid, duplex) {
        UserAttachOutcome::Paired | UserAttachOutcome::Parked => {}
        UserAttachOutcome::NotFound | UserAttachOutcome::AlreadyPaired => {
            return err_envelope(StatusCode::NOT_FOUND, "unknown download session");
        }
    }

    let body = axum::body::Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{filename}\""))
        .body(body)
        .unwrap()
}

/// `POST /api/agent/upload/{mid}` (multipart): File-upload session. Expects
/// a `path` field naming the destination on the agent and a `file` field
/// carrying the bytes.
async fn upload_handler(Path(mid): Path<String>, State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut path = None;
    let mut file_field = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        match field.name() {
            Some("path") => {
                path = field.text().await.ok();
            }
            Some("file") => {
                file_field = Some(field);
                break;
            }
            _ => {}
        }
    }

    let Some(path) = path else {
        return err_envelope(StatusCode::BAD_REQUEST, "missing path field");
    };
    let Some(mut field) = file_field else {
        return err_envelope(StatusCode::BAD_REQUEST, "missing file field");
    };

    let sid = match state.overlord.open_session(&mid, SpawnParams::FileUpload { path }).await {
        Ok(sid) => sid,
        Err(e) => return e.into_response(),
    };

    let (tx, rx) = mpsc::channel(16);
    let duplex = Box::new(HttpUploadDuplex::new(rx));
    match state.overlord.attach_user_side(sid, duplex) {
        UserAttachOutcome::Paired | UserAttachOutcome::Parked => {}
        UserAttachOutcome::NotFound | UserAttachOutcome::AlreadyPaired => {
            return err_envelope(StatusCode::NOT_FOUND, "unknown upload session");
        }
    }

    while let Ok(Some(chunk)) = field.chunk().await {
        if tx.send(chunk.to_vec()).await.is_err() {
            break;
        }
    }
    drop(tx);

    ok_envelope(serde_json::json!({ "sid": sid }))
}

/// Form data for login authentication
#[derive(Deserialize)]
struct LoginRequest {
    /// User password
    pub password: String,
    /// One-Time Password code
    pub otp_code: String,
}

/// Handle user login with password and OTP verification
async fn login_handler(jar: CookieJar, Form(payload): Form<LoginRequest>) -> impl IntoResponse {
    let otp = MyOtp::new(CONFIG.otp_secret.as_str());

    if payload.password == CONFIG.password && otp.verify(&payload.otp_code) {
        let cookie = Cookie::build(("authenticated", "true"))
            .path("/")
            .http_only(true)
            .same_site(axum_extra::extract::cookie::SameSite::Lax);

        (jar.add(cookie), Redirect::to("/"))
    } else {
        (jar, Redirect::to("/login?error=1"))
    }
}

/// Middleware to enforce authentication on protected routes
async fn auth_middleware(jar: CookieJar, req: Request, next: Next) -> Result<Response, impl IntoResponse> {
    let path = req.uri().path();

    if path == "/login" {
        return Ok(next.run(req).await);
    }

    let is_authenticated = jar.get("authenticated").map(|c| c.value() == "true").unwrap_or(false);

    if is_authenticated {
        Ok(next.run(req).await)
    } else {
        Err(Redirect::to("/login"))
    }
}

/// Generate and display 2FA setup page with QR code
async fn setup_2fa_handler() -> impl IntoResponse {
    let otp = MyOtp::new(CONFIG.otp_secret.as_str());
    let qr_png = otp.get_qr_png().unwrap_or_default();
    let qr_png_b64 = general_purpose::STANDARD.encode(&qr_png);

    Html(setup_2fa(qr_png_b64.as_str(), CONFIG.otp_secret.as_str()).await)
}

/// Display login page
async fn show_login_page() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

/// Display main dashboard page
async fn index_page() -> Html<&'static str> {
    Html(INDEX_PAGE)
}
