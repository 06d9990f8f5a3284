//! Mode state machine & top-level server object (spec.md §4.2, §4.3, §5).
//!
//! Every agent-originated TCP connection goes `raw → registered →
//! {control, bridging, rejected}`. `control` connections live until EOF or
//! a ping timeout; `bridging` connections live until the session closes.
//! [`Overlord`] is the single object a front end (e.g. `overlord-web`)
//! holds: it owns the agent registry, the rendezvous map, the event bus,
//! and drives the agent-ingress accept loop plus its maintenance tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use overlord_proto::mode::{ControlFrame, Mode, RegisterPayload, SpawnParams, TlsSettings};
use overlord_proto::wire::{Request, Response};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ServerConfig;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::{ByteDuplex, RawByteDuplex, ResizeTarget, WireMessage, pump};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus, TOPIC_AGENT_JOINED, TOPIC_AGENT_LEFT, TOPIC_AGENT_PROPERTIES};
use crate::registry::{Agent, AgentRegistry, AgentView};
use crate::rendezvous::{Attach, Orphaned, RendezvousMap};
use crate::rpc::{HandshakeStream, RpcFramer, read_one_line};
use crate::tls;

const SEPARATOR: &[u8] = b"\r\n";

/// Outcome of attaching the user's side of a session (spec.md §4.3's public
/// `attach_user_side` contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAttachOutcome {
    Paired,
    Parked,
    NotFound,
    AlreadyPaired,
}

/// The session multiplexer: agent registry, rendezvous map, event bus, and
/// the TCP accept loop that feeds them, bundled behind one `Arc`.
pub struct Overlord {
    pub registry: AgentRegistry,
    pub rendezvous: RendezvousMap,
    pub events: EventBus,
    pub config: CoreConfig,
    tls_config: Option<Arc<ServerConfig>>,
    cancel: CancellationToken,
}

impl Overlord {
    pub fn new(config: CoreConfig, tls_config: Option<Arc<ServerConfig>>) -> Arc<Self> {
        let buffer = config.subscriber_buffer;
        Arc::new(Self {
            registry: AgentRegistry::new(),
            rendezvous: RendezvousMap::new(),
            events: EventBus::new(buffer),
            config,
            tls_config,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancel the agent-ingress accept loop, every control connection's
    /// read loop, and every in-flight bridge (spec.md §5).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start the background orphan-reaper (spec.md §4.3 "Orphan
    /// collection"). Call once per `Overlord` instance.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.orphan_grace);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        for orphan in this.rendezvous.reap_orphans(this.config.orphan_grace) {
                            match orphan {
                                Orphaned::User(mut u) => u.shutdown().await,
                                Orphaned::Agent(mut a) => a.shutdown().await,
                            }
                        }
                    }
                }
            }
        });
    }

    /// Accept loop for the agent-ingress listener (spec.md §4.2, §4.8).
    pub async fn run_agent_ingress(self: &Arc<Self>, addr: SocketAddr) -> CoreResult<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "agent ingress listening");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("agent ingress shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_agent_connection(socket, peer).await {
                            tracing::info!(%peer, error = %e, "agent connection ended");
                        }
                    });
                }
            }
        }
    }

    async fn handle_agent_connection(self: Arc<Self>, mut socket: TcpStream, peer: SocketAddr) -> CoreResult<()> {
        let (line, leftover) = read_one_line(&mut socket).await?;
        let req: Request = serde_json::from_slice(&line)
            .map_err(|e| CoreError::Protocol(format!("malformed register request: {e}")))?;
        if req.name != "register" {
            write_line(&mut socket, &Response::failed(req.rid, "expected register")).await?;
            return Err(CoreError::Protocol(format!("expected register, got {}", req.name)));
        }
        let payload: RegisterPayload = serde_json::from_value(req.payload)
            .map_err(|e| CoreError::Protocol(format!("malformed register payload: {e}")))?;

        if payload.mode.is_bridging() {
            self.handle_bridging_register(socket, peer, req.rid, payload, leftover).await
        } else {
            self.handle_control_register(socket, peer, req.rid, payload, leftover).await
        }
    }

    async fn handle_control_register(
        self: Arc<Self>,
        mut socket: TcpStream,
        peer: SocketAddr,
        rid: Uuid,
        payload: RegisterPayload,
        leftover: Vec<u8>,
    ) -> CoreResult<()> {
        // spec.md §9: a Control registration whose declared `sid` collides
        // with a live rendezvous session-id is unspecified; we reject it.
        if let Ok(sid) = Uuid::parse_str(&payload.sid) {
            if self.rendezvous.contains(sid) {
                write_line(&mut socket, &Response::failed(rid, "sid collides with a pending session")).await?;
                return Err(CoreError::Protocol("control register sid collides with rendezvous session".into()));
            }
        }

        let mid = resolve_mid(&payload.mid);

        write_line(&mut socket, &Response::success(rid, serde_json::json!({ "mid": mid }))).await?;

        let wrapped = self.maybe_upgrade_tls(socket, &payload.tls_settings, &mid).await?;
        let (framer, mut reqs) = match wrapped {
            Wrapped::Plain(s) => RpcFramer::spawn(HandshakeStream::new(leftover, s), &self.config),
            Wrapped::Tls(s) => RpcFramer::spawn(HandshakeStream::new(leftover, s), &self.config),
        };

        let agent = Arc::new(Agent::new(mid.clone(), payload.sid, payload.properties, Arc::clone(&framer)));
        if let Some(prior) = self.registry.insert(Arc::clone(&agent)) {
            tracing::info!(mid = %mid, "closing prior control connection on re-registration");
            prior.rpc.notify("shutdown", serde_json::json!({})).await.ok();
        } else {
            self.events.publish(
                TOPIC_AGENT_JOINED,
                Event::new(TOPIC_AGENT_JOINED, &agent.public_view()),
            );
        }

        tracing::info!(mid = %mid, %peer, "agent registered (control)");
        self.clone().run_control_loop(mid.clone(), framer, &mut reqs).await;

        self.registry.remove(&mid);
        self.events
            .publish(TOPIC_AGENT_LEFT, Event::bare(TOPIC_AGENT_LEFT, vec![format!("\"{mid}\"")]));
        Ok(())
    }

    /// Service incoming requests on an established Control connection
    /// (`register_properties` updates) and drive the ping loop (spec.md
    /// §4.2 rule 6) until the connection closes or a ping goes unanswered.
    ///
    /// The ping itself runs on a separate task so a slow/unanswered ping
    /// never blocks `register_properties` (or any other incoming request)
    /// from being serviced in the meantime.
    async fn run_control_loop(
        self: Arc<Self>,
        mid: String,
        framer: Arc<RpcFramer>,
        reqs: &mut tokio::sync::mpsc::UnboundedReceiver<Request>,
    ) {
        let ping_dead = CancellationToken::new();
        let ping_task = tokio::spawn({
            let framer = Arc::clone(&framer);
            let ping_dead = ping_dead.clone();
            let period = self.config.ping_period;
            let timeout_secs = period.as_secs().max(1) as i64;
            let registry_mid = mid.clone();
            let this = Arc::clone(&self);
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    match framer.send_request("ping", serde_json::json!({}), timeout_secs).await {
                        Ok(crate::rpc::RpcOutcome::Response(r)) if r.is_success() => {
                            if let Some(agent) = this.registry.get(&registry_mid) {
                                agent.touch();
                            }
                        }
                        _ => {
                            ping_dead.cancel();
                            return;
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ping_dead.cancelled() => {
                    tracing::info!(mid, "ping timed out, closing control connection");
                    break;
                }
                incoming = reqs.recv() => {
                    let Some(req) = incoming else { break };
                    self.handle_control_request(&mid, &framer, req).await;
                }
            }
        }
        ping_task.abort();
    }

    async fn handle_control_request(&self, mid: &str, framer: &Arc<RpcFramer>, req: Request) {
        match req.name.as_str() {
            "register_properties" => {
                let Some(agent) = self.registry.get(mid) else { return };
                match serde_json::from_value(req.payload) {
                    Ok(updates) => {
                        agent.merge_properties(updates);
                        self.events.publish(
                            TOPIC_AGENT_PROPERTIES,
                            Event::new(TOPIC_AGENT_PROPERTIES, &agent.public_view()),
                        );
                        if !req.is_fire_and_forget() {
                            let _ = framer.reply_success(req.rid, Value::Null).await;
                        }
                    }
                    Err(e) => {
                        if !req.is_fire_and_forget() {
                            let _ = framer.reply_failed(req.rid, format!("bad properties payload: {e}")).await;
                        }
                    }
                }
            }
            "ping" => {
                if !req.is_fire_and_forget() {
                    let _ = framer.reply_success(req.rid, Value::Null).await;
                }
            }
            other => {
                tracing::warn!(mid, name = other, "unhandled control request");
                if !req.is_fire_and_forget() {
                    let _ = framer.reply_failed(req.rid, "unknown request").await;
                }
            }
        }
    }

    async fn handle_bridging_register(
        self: Arc<Self>,
        mut socket: TcpStream,
        peer: SocketAddr,
        rid: Uuid,
        payload: RegisterPayload,
        leftover: Vec<u8>,
    ) -> CoreResult<()> {
        let Ok(sid) = Uuid::parse_str(&payload.sid) else {
            write_line(&mut socket, &Response::failed(rid, "sid must be a session id")).await?;
            return Err(CoreError::Protocol("bridging register with non-uuid sid".into()));
        };
        if !self.rendezvous.contains(sid) {
            write_line(&mut socket, &Response::failed(rid, "unknown session")).await?;
            return Err(CoreError::SessionNotFound(sid.to_string()));
        }

        let mid = resolve_mid(&payload.mid);
        write_line(&mut socket, &Response::success(rid, serde_json::json!({ "mid": mid }))).await?;

        let wrapped = self.maybe_upgrade_tls(socket, &payload.tls_settings, &mid).await?;
        let duplex: Box<dyn ByteDuplex> = match wrapped {
            Wrapped::Plain(s) => Box::new(RawByteDuplex::from_stream(HandshakeStream::new(leftover, s))),
            Wrapped::Tls(s) => Box::new(RawByteDuplex::from_stream(HandshakeStream::new(leftover, s))),
        };

        tracing::info!(%sid, %mid, %peer, "agent side of bridging session attached");
        match self.rendezvous.attach_agent_side(sid, duplex) {
            Attach::Paired { user, agent, mid, params } => {
                self.spawn_bridge(sid, mid, params, user, agent);
            }
            Attach::Parked => {}
            Attach::NotFound => {
                return Err(CoreError::SessionNotFound(sid.to_string()));
            }
            Attach::AlreadyAttached => {
                return Err(CoreError::AlreadyPaired(sid.to_string()));
            }
        }
        Ok(())
    }

    /// Attach the user's side of a session (called by a front end once it
    /// has a ready [`ByteDuplex`] — a WebSocket for Terminal/Shell/Logcat,
    /// or a raw TCP accept for Forward). Spawns the bridge pump if this
    /// completes the pairing.
    pub fn attach_user_side(self: &Arc<Self>, sid: Uuid, user: Box<dyn ByteDuplex>) -> UserAttachOutcome {
        match self.rendezvous.attach_user_side(sid, user) {
            Attach::Paired { user, agent, mid, params } => {
                self.spawn_bridge(sid, mid, params, user, agent);
                UserAttachOutcome::Paired
            }
            Attach::Parked => UserAttachOutcome::Parked,
            Attach::NotFound => UserAttachOutcome::NotFound,
            Attach::AlreadyAttached => UserAttachOutcome::AlreadyPaired,
        }
    }

    /// `open_session` (spec.md §4.3): mint a session id, park it, and send
    /// the mode-appropriate `spawn` request on the agent's control RPC.
    pub async fn open_session(self: &Arc<Self>, mid: &str, params: SpawnParams) -> CoreResult<Uuid> {
        let agent = self
            .registry
            .get(mid)
            .ok_or_else(|| CoreError::AgentNotFound(mid.to_string()))?;

        let mode = params.mode();
        let sid = self.rendezvous.open_session(mid.to_string(), params.clone());

        let mut payload = serde_json::to_value(&params).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("sid".into(), Value::String(sid.to_string()));
        }

        let outcome = agent
            .rpc
            .send_request(mode.spawn_verb(), payload, self.config.default_request_timeout.as_secs() as i64)
            .await;

        match outcome {
            Ok(crate::rpc::RpcOutcome::Response(resp)) if resp.is_success() => {
                if matches!(mode, Mode::FileDownload) {
                    self.events
                        .publish("file download", Event::bare("file download", vec![format!("\"{sid}\"")]));
                }
                Ok(sid)
            }
            Ok(crate::rpc::RpcOutcome::Response(resp)) => {
                self.rendezvous.cancel(sid);
                Err(CoreError::Protocol(format!("agent rejected spawn: {:?}", resp.payload)))
            }
            Ok(crate::rpc::RpcOutcome::Timeout) | Err(_) => {
                self.rendezvous.cancel(sid);
                Err(CoreError::Timeout)
            }
        }
    }

    pub fn list_agents(&self) -> Vec<AgentView> {
        self.registry.list()
    }

    fn spawn_bridge(
        self: &Arc<Self>,
        sid: Uuid,
        mid: String,
        params: SpawnParams,
        user: Box<dyn ByteDuplex>,
        agent: Box<dyn ByteDuplex>,
    ) {
        let mode = params.mode();
        let initial_frame = matches!(mode, Mode::Terminal).then(|| {
            WireMessage::Text(
                serde_json::to_string(&ControlFrame::Sid { data: sid.to_string() }).unwrap_or_default(),
            )
        });
        let resize_target = matches!(mode, Mode::Terminal)
            .then(|| self.registry.get(&mid))
            .flatten()
            .map(|agent_entry| ResizeTarget {
                rpc: Arc::clone(&agent_entry.rpc),
                sid: sid.to_string(),
            });

        let sid_str = sid.to_string();
        let cancel = self.cancel.clone();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let reason = pump(user, agent, initial_frame, resize_target, cancel).await;
            tracing::info!(sid = %sid_str, ?reason, "bridging session closed");
            this.events
                .publish(&sid_str, Event::bare("session close", vec![format!("{reason:?}")]));
        });
    }

    async fn maybe_upgrade_tls(
        &self,
        mut socket: TcpStream,
        agent_tls: &TlsSettings,
        mid: &str,
    ) -> CoreResult<Wrapped> {
        if tls::should_upgrade(self.tls_config.as_ref(), agent_tls) {
            let config = self.tls_config.clone().expect("should_upgrade checked Some");
            tracing::info!(mid, "upgrading agent connection to TLS");
            // spec.md §4.8: the server tells the agent to expect a TLS
            // handshake on this same connection before starting one, via a
            // fire-and-forget notify ahead of the raw handshake bytes.
            write_line(&mut socket, &Request::notify("upgrade", serde_json::json!({}))).await?;
            let stream = tls::upgrade(socket, config).await?;
            Ok(Wrapped::Tls(stream))
        } else {
            Ok(Wrapped::Plain(socket))
        }
    }
}

enum Wrapped {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

fn resolve_mid(declared: &str) -> String {
    if declared == overlord_proto::wire::RANDOM_MID || declared.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        declared.to_string()
    }
}

async fn write_line<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S, value: &impl serde::Serialize) -> CoreResult<()> {
    use tokio::io::AsyncWriteExt;
    let mut bytes = serde_json::to_vec(value).map_err(|e| CoreError::Protocol(format!("encode failure: {e}")))?;
    bytes.extend_from_slice(SEPARATOR);
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_mid_assigns_fresh_id_for_random_sentinel() {
        let a = resolve_mid(overlord_proto::wire::RANDOM_MID);
        let b = resolve_mid(overlord_proto::wire::RANDOM_MID);
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn resolve_mid_keeps_declared_id() {
        assert_eq!(resolve_mid("my-laptop"), "my-laptop");
    }
}
