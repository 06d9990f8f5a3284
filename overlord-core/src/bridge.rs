//! Bridging engine (`SPEC_FULL.md`, `[BRIDGE]`; spec.md §4.5).
//!
//! Two independent copy loops — user→agent and agent→user — run
//! concurrently until either side's read ends. Closing either side closes
//! both (idempotent); no unbounded queue sits between read and write, so a
//! slow consumer throttles its producer (spec.md §4.5 "Backpressure").
//!
//! The two sides are abstracted behind [`ByteDuplex`] so the same pump
//! serves a WebSocket user side (Terminal/Shell/Logcat, implemented in
//! `overlord-web` against axum's `WebSocket`) and a raw TCP user side
//! (Forward), bridged against an agent-originated TCP/TLS connection.
//! Mirrors the `coop` mux's `upstream-bridge.rs` pattern of intercepting
//! one direction's JSON in-line while the other passes through raw.

use std::sync::Arc;

use async_trait::async_trait;
use overlord_proto::mode::ControlFrame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::rpc::RpcFramer;

/// One message crossing a [`ByteDuplex`]. TCP-backed duplexes only ever
/// produce/consume `Binary`; a WebSocket-backed duplex (implemented by the
/// consuming web layer) can produce `Text` for JSON control frames.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Binary(Vec<u8>),
    Text(String),
}

/// One side of a bridged session: something that can receive and send
/// discrete messages until closed.
#[async_trait]
pub trait ByteDuplex: Send {
    async fn recv(&mut self) -> std::io::Result<Option<WireMessage>>;
    async fn send(&mut self, msg: WireMessage) -> std::io::Result<()>;
    async fn shutdown(&mut self);
}

/// A [`ByteDuplex`] over a raw `AsyncRead + AsyncWrite` stream (plain or
/// TLS-wrapped TCP). Used for the agent side of every bridged mode, and
/// for the user side of Forward sessions.
pub struct RawByteDuplex {
    read: Box<dyn AsyncRead + Unpin + Send>,
    write: Box<dyn AsyncWrite + Unpin + Send>,
}

impl RawByteDuplex {
    pub fn new(read: Box<dyn AsyncRead + Unpin + Send>, write: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self { read, write }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self {
            read: Box::new(r),
            write: Box::new(w),
        }
    }
}

#[async_trait]
impl ByteDuplex for RawByteDuplex {
    async fn recv(&mut self) -> std::io::Result<Option<WireMessage>> {
        let mut buf = [0u8; 8192];
        let n = self.read.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(WireMessage::Binary(buf[..n].to_vec())))
    }

    async fn send(&mut self, msg: WireMessage) -> std::io::Result<()> {
        let bytes = match msg {
            WireMessage::Binary(b) => b,
            WireMessage::Text(t) => t.into_bytes(),
        };
        self.write.write_all(&bytes).await?;
        self.write.flush().await
    }

    async fn shutdown(&mut self) {
        let _ = self.write.shutdown().await;
    }
}

/// Side-channel target for control frames intercepted on the user→agent
/// direction (spec.md §4.5): a resize frame becomes a Request on the
/// owning agent's control RPC rather than a forwarded byte.
pub struct ResizeTarget {
    pub rpc: Arc<RpcFramer>,
    pub sid: String,
}

/// Outcome of one bridged pump, recorded for the `session close` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    UserClosed,
    AgentClosed,
    UserError,
    AgentError,
    ServerShutdown,
}

/// Run the bridge until either side ends. `initial_user_frame`, if set, is
/// sent to the user side before the loops start — used to deliver the
/// `{"type":"sid",...}` control frame immediately after Terminal pairing
/// (spec.md §4.4's mode table). `cancel` fires on server shutdown (spec.md
/// §5: "closing the server ... then closes all bridges").
pub async fn pump(
    mut user: Box<dyn ByteDuplex>,
    mut agent: Box<dyn ByteDuplex>,
    initial_user_frame: Option<WireMessage>,
    resize_target: Option<ResizeTarget>,
    cancel: CancellationToken,
) -> CloseReason {
    if let Some(frame) = initial_user_frame {
        if user.send(frame).await.is_err() {
            return CloseReason::UserError;
        }
    }

    let user_to_agent = async {
        loop {
            match user.recv().await {
                Ok(Some(WireMessage::Binary(data))) => {
                    if agent.send(WireMessage::Binary(data)).await.is_err() {
                        return CloseReason::AgentError;
                    }
                }
                Ok(Some(WireMessage::Text(text))) => {
                    if let Some(target) = resize_target.as_ref() {
                        if let Ok(ControlFrame::Resize { rows, cols }) =
                            serde_json::from_str::<ControlFrame>(&text)
                        {
                            let _ = target
                                .rpc
                                .send_request(
                                    "resize",
                                    serde_json::json!({ "sid": target.sid, "rows": rows, "cols": cols }),
                                    10,
                                )
                                .await;
                            continue;
                        }
                    }
                    tracing::debug!("unhandled text control frame on user side, dropping");
                }
                Ok(None) => return CloseReason::UserClosed,
                Err(_) => return CloseReason::UserError,
            }
        }
    };

    let agent_to_user = async {
        loop {
            match agent.recv().await {
                Ok(Some(msg)) => {
                    if user.send(msg).await.is_err() {
                        return CloseReason::UserError;
                    }
                }
                Ok(None) => return CloseReason::AgentClosed,
                Err(_) => return CloseReason::AgentError,
            }
        }
    };

    let reason = tokio::select! {
        r = user_to_agent => r,
        r = agent_to_user => r,
        _ = cancel.cancelled() => CloseReason::ServerShutdown,
    };

    agent.shutdown().await;
    user.shutdown().await;
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pump_closes_both_sides_on_user_eof() {
        let (user_a, mut user_b) = duplex(1024);
        let (agent_a, agent_b) = duplex(1024);

        let user = Box::new(RawByteDuplex::from_stream(user_a));
        let agent = Box::new(RawByteDuplex::from_stream(agent_a));

        let handle = tokio::spawn(pump(user, agent, None, None, CancellationToken::new()));
        drop(user_b.shutdown().await); // close the user's peer half -> EOF on user side
        let reason = handle.await.unwrap();
        assert_eq!(reason, CloseReason::UserClosed);
        drop(agent_b);
    }

    #[tokio::test]
    async fn pump_forwards_bytes_in_order_both_directions() {
        let (user_a, mut user_peer) = duplex(1024);
        let (agent_a, mut agent_peer) = duplex(1024);

        let user = Box::new(RawByteDuplex::from_stream(user_a));
        let agent = Box::new(RawByteDuplex::from_stream(agent_a));
        let handle = tokio::spawn(pump(user, agent, None, None, CancellationToken::new()));

        user_peer.write_all(b"hello-agent").await.unwrap();
        let mut buf = [0u8; 32];
        let n = agent_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-agent");

        agent_peer.write_all(b"hello-user").await.unwrap();
        let n = user_peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-user");

        drop(user_peer);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn cancellation_ends_the_pump_with_server_shutdown() {
        let (user_a, _user_peer) = duplex(1024);
        let (agent_a, _agent_peer) = duplex(1024);
        let user = Box::new(RawByteDuplex::from_stream(user_a));
        let agent = Box::new(RawByteDuplex::from_stream(agent_a));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(pump(user, agent, None, None, cancel.clone()));
        cancel.cancel();
        let reason = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::ServerShutdown);
    }
}
