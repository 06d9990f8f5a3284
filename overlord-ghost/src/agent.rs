//! Agent control connection: register as a Control-mode peer, keep the
//! control RPC alive, and dispatch every incoming `ping`/`resize`/spawn
//! request until the connection ends (spec.md §4.2, §4.3).

use std::sync::Arc;

use dashmap::DashMap;
use overlord_core::config::CoreConfig;
use overlord_core::rpc::{HandshakeStream, RpcFramer, read_one_line};
use overlord_proto::mode::{Mode, Properties, PropertyValue, RegisterAck, RegisterPayload, TlsSettings};
use overlord_proto::wire::{Request, Response};
use serde_json::Value;
use tokio::net::TcpStream;

use crate::session::{self, SessionContext, write_frame};

/// Connect to `server_addr`, register as a Control agent under `mid`
/// (`overlord_proto::wire::RANDOM_MID` to let the server assign one), and
/// service the control RPC until the connection ends.
pub async fn run(server_addr: &str, mid: &str) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(server_addr).await?;
    tracing::info!(server_addr, "connected to overlord, registering");

    let properties = local_properties();
    let payload = RegisterPayload {
        mid: mid.to_string(),
        sid: String::new(),
        mode: Mode::Control,
        properties: properties.clone(),
        tls_settings: TlsSettings::default(),
    };
    let req = Request::new("register", serde_json::to_value(&payload)?, 30);
    write_frame(&mut stream, &req).await?;

    let (line, leftover) = read_one_line(&mut stream).await?;
    let resp: Response =
        serde_json::from_slice(&line).map_err(|e| anyhow::anyhow!("malformed register ack: {e}"))?;
    if !resp.is_success() {
        anyhow::bail!("registration rejected: {:?}", resp.payload);
    }
    let ack: RegisterAck = serde_json::from_value(resp.payload)?;
    tracing::info!(mid = %ack.mid, "registered as control agent");

    let config = CoreConfig::default();
    let (framer, mut reqs) = RpcFramer::spawn(HandshakeStream::new(leftover, stream), &config);
    // Unsolicited follow-up push, independent of the properties already
    // carried in `register` (spec.md §4.2: "Properties are updated by the
    // agent sending an unsolicited Request `register_properties`").
    let _ = framer.notify("register_properties", serde_json::to_value(&properties)?).await;

    let ctx = SessionContext {
        server_addr: server_addr.to_string(),
        mid: ack.mid.clone(),
        resize_channels: Arc::new(DashMap::new()),
    };

    while let Some(req) = reqs.recv().await {
        if req.name == "shutdown" {
            tracing::info!(mid = %ack.mid, "server closed this agent (superseded by re-registration)");
            break;
        }
        handle_control_request(&ctx, &framer, req).await;
    }

    tracing::info!(mid = %ack.mid, "control connection closed");
    Ok(())
}

async fn handle_control_request(ctx: &SessionContext, framer: &Arc<RpcFramer>, req: Request) {
    match req.name.as_str() {
        "ping" => {
            let _ = framer.reply_success(req.rid, Value::Null).await;
        }
        "resize" => {
            let sid = req.payload.get("sid").and_then(Value::as_str).unwrap_or_default();
            let rows = req.payload.get("rows").and_then(Value::as_u64).unwrap_or(24) as u16;
            let cols = req.payload.get("cols").and_then(Value::as_u64).unwrap_or(80) as u16;
            match ctx.resize_channels.get(sid) {
                Some(tx) => {
                    let _ = tx.send((rows, cols));
                    let _ = framer.reply_success(req.rid, Value::Null).await;
                }
                None => {
                    let _ = framer.reply_failed(req.rid, "unknown session").await;
                }
            }
        }
        "upgrade" => {
            tracing::warn!("server requested a TLS upgrade this agent does not support");
        }
        verb if is_spawn_verb(verb) => {
            session::dispatch(ctx.clone(), Arc::clone(framer), req).await;
        }
        other => {
            tracing::warn!(name = other, "unhandled control request");
            let _ = framer.reply_failed(req.rid, "unknown request").await;
        }
    }
}

fn is_spawn_verb(name: &str) -> bool {
    matches!(
        name,
        "terminal" | "shell" | "logcat" | "file_upload" | "file_download" | "forward"
    )
}

fn local_properties() -> Properties {
    let mut properties = Properties::new();
    properties.insert("os".into(), PropertyValue::Single(std::env::consts::OS.into()));
    properties.insert("arch".into(), PropertyValue::Single(std::env::consts::ARCH.into()));
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    properties.insert("hostname".into(), PropertyValue::Single(hostname));
    properties.insert("has_camera".into(), PropertyValue::Single("false".into()));
    properties
}
