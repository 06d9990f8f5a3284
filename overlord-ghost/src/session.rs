//! Dispatches spawn requests arriving on the control RPC into per-mode
//! session handlers, and the shared dial-back handshake they all use to
//! open their agent-side half of a bridged session (spec.md §4.2 rule 3,
//! §4.3, §4.4).

use std::sync::Arc;

use dashmap::DashMap;
use overlord_core::rpc::{HandshakeStream, RpcFramer, read_one_line};
use overlord_proto::mode::{Mode, RegisterPayload, SpawnParams, TlsSettings};
use overlord_proto::wire::{Request, Response};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::{files, forward, logcat, pty, shell};

/// Everything a per-mode session handler needs to dial back to the server
/// and to route a live Terminal session's resize requests.
#[derive(Clone)]
pub struct SessionContext {
    pub server_addr: String,
    pub mid: String,
    pub resize_channels: Arc<DashMap<String, mpsc::UnboundedSender<(u16, u16)>>>,
}

/// Handle one incoming spawn `Request` (`terminal`, `shell`, `logcat`,
/// `file_upload`, `file_download`, `forward`): acknowledge it on the control
/// RPC, then run the session in the background so the control loop stays
/// free to service other requests (pings, other spawns) while it runs.
pub async fn dispatch(ctx: SessionContext, framer: Arc<RpcFramer>, req: Request) {
    let rid = req.rid;
    let sid = req
        .payload
        .get("sid")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if sid.is_empty() {
        let _ = framer.reply_failed(rid, "spawn request missing sid").await;
        return;
    }

    let params: SpawnParams = match serde_json::from_value(req.payload) {
        Ok(p) => p,
        Err(e) => {
            let _ = framer.reply_failed(rid, format!("bad spawn payload: {e}")).await;
            return;
        }
    };

    let _ = framer.reply_success(rid, Value::Null).await;

    tokio::spawn(async move {
        let mode = params.mode();
        let result = match params {
            SpawnParams::Terminal { tty_device, rows, cols } => pty::run(&ctx, &sid, tty_device, rows, cols).await,
            SpawnParams::Shell { command } => shell::run(&ctx, &sid, &command).await,
            SpawnParams::Logcat => logcat::run(&ctx, &sid).await,
            SpawnParams::FileUpload { path } => files::upload(&ctx, &sid, &path).await,
            SpawnParams::FileDownload { path } => files::download(&ctx, &sid, &path).await,
            SpawnParams::Forward { host, port } => forward::run(&ctx, &sid, &host, port).await,
        };
        if let Err(e) = result {
            tracing::warn!(sid, ?mode, error = %e, "session ended with error");
        }
    });
}

/// Dial a fresh TCP connection to the server and register it into the
/// rendezvous map under `sid` (spec.md §4.3's agent-side arrival). Any bytes
/// the server already started sending right after the ack — the session is
/// live the instant both sides are paired — are replayed via
/// [`HandshakeStream`], the same mechanism the server uses on its own TLS
/// bootstrap (spec.md §4.8, §9).
pub async fn dial_back(ctx: &SessionContext, sid: &str, mode: Mode) -> anyhow::Result<HandshakeStream<TcpStream>> {
    let mut stream = TcpStream::connect(&ctx.server_addr).await?;
    let payload = RegisterPayload {
        mid: ctx.mid.clone(),
        sid: sid.to_string(),
        mode,
        properties: Default::default(),
        tls_settings: TlsSettings::default(),
    };
    let req = Request::new("register", serde_json::to_value(&payload)?, 10);
    write_frame(&mut stream, &req).await?;

    let (line, leftover) = read_one_line(&mut stream).await?;
    let resp: Response =
        serde_json::from_slice(&line).map_err(|e| anyhow::anyhow!("malformed session register ack: {e}"))?;
    if !resp.is_success() {
        anyhow::bail!("server rejected session register: {:?}", resp.payload);
    }

    Ok(HandshakeStream::new(leftover, stream))
}

pub async fn write_frame<T: serde::Serialize>(stream: &mut TcpStream, value: &T) -> anyhow::Result<()> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.extend_from_slice(b"\r\n");
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}
