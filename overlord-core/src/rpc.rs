//! RPC framing & correlation (`SPEC_FULL.md`, `[RPC-FRAMING]`; spec.md
//! §4.1). A stream of JSON objects separated by `\r\n`; requests with
//! `timeout >= 0` get a correlated response, `timeout < 0` is
//! fire-and-forget, and a background sweeper times out stale responders.
//!
//! The framer is generic over any boxed `AsyncRead`/`AsyncWrite` stream
//! (plain TCP or TLS-wrapped) so the TLS bootstrap (spec.md §4.8) can
//! re-bind a fresh framer to an upgraded socket without this module caring
//! which concrete stream type it is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use overlord_proto::wire::{Frame, Request, Response, parse_frame};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};

const SEPARATOR: &[u8] = b"\r\n";

pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Result of a correlated `send_request` call.
#[derive(Debug, Clone)]
pub enum RpcOutcome {
    Response(Response),
    Timeout,
}

impl RpcOutcome {
    pub fn into_response(self) -> CoreResult<Response> {
        match self {
            RpcOutcome::Response(r) => Ok(r),
            RpcOutcome::Timeout => Err(CoreError::Timeout),
        }
    }
}

struct Responder {
    deadline: Instant,
    tx: oneshot::Sender<RpcOutcome>,
}

/// A live control RPC connection: framed JSON-over-`\r\n` with
/// request/response correlation.
///
/// Constructed via [`RpcFramer::spawn`], which also starts the reader and
/// timeout-sweeper background tasks and hands back a channel of incoming
/// [`Request`]s for the owner to handle (registration requests, pings,
/// property updates, ...).
pub struct RpcFramer {
    writer: Mutex<BoxedWrite>,
    responders: DashMap<Uuid, Responder>,
    max_outstanding: usize,
    closed: AtomicBool,
}

impl RpcFramer {
    /// Split `stream` into independent read/write halves, start the reader
    /// and sweeper tasks, and return the framer handle plus a channel that
    /// yields every incoming [`Request`].
    pub fn spawn<S>(stream: S, config: &CoreConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<Request>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::spawn_boxed(Box::new(read_half), Box::new(write_half), config)
    }

    /// Same as [`Self::spawn`] but for already-boxed halves — used when
    /// re-binding after a TLS upgrade (spec.md §4.8).
    pub fn spawn_boxed(
        read: BoxedRead,
        write: BoxedWrite,
        config: &CoreConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Request>) {
        let framer = Arc::new(Self {
            writer: Mutex::new(write),
            responders: DashMap::new(),
            max_outstanding: config.max_outstanding_requests,
            closed: AtomicBool::new(false),
        });

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        tokio::spawn(reader_loop(Arc::clone(&framer), read, req_tx));
        tokio::spawn(sweeper_loop(Arc::clone(&framer), config.sweep_period));

        (framer, req_rx)
    }

    /// Send a request and, if `timeout_secs >= 0`, await its correlated
    /// response (or a timeout). `timeout_secs < 0` sends and returns
    /// immediately with no responder ever registered.
    pub async fn send_request(
        &self,
        name: impl Into<String>,
        payload: Value,
        timeout_secs: i64,
    ) -> CoreResult<RpcOutcome> {
        let req = Request::new(name, payload, timeout_secs);
        if req.is_fire_and_forget() {
            self.write_frame(&req).await?;
            return Ok(RpcOutcome::Response(Response::success(req.rid, Value::Null)));
        }

        if self.responders.len() >= self.max_outstanding {
            return Err(CoreError::TooManyOutstanding);
        }

        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(timeout_secs.max(0) as u64);
        self.responders.insert(req.rid, Responder { deadline, tx });

        if let Err(e) = self.write_frame(&req).await {
            self.responders.remove(&req.rid);
            return Err(e.into());
        }

        match rx.await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Ok(RpcOutcome::Timeout),
        }
    }

    /// Fire-and-forget convenience wrapper (`timeout < 0`).
    pub async fn notify(&self, name: impl Into<String>, payload: Value) -> CoreResult<()> {
        self.send_request(name, payload, -1).await.map(|_| ())
    }

    pub async fn reply_success(&self, rid: Uuid, payload: Value) -> CoreResult<()> {
        self.write_frame(&Response::success(rid, payload)).await
    }

    pub async fn reply_failed(&self, rid: Uuid, error: impl Into<String>) -> CoreResult<()> {
        self.write_frame(&Response::failed(rid, error)).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn write_frame<T: serde::Serialize>(&self, frame: &T) -> CoreResult<()> {
        let mut bytes = serde_json::to_vec(frame)
            .map_err(|e| CoreError::Protocol(format!("encode failure: {e}")))?;
        bytes.extend_from_slice(SEPARATOR);
        let mut w = self.writer.lock().await;
        w.write_all(&bytes).await?;
        w.flush().await?;
        Ok(())
    }

    /// Number of outstanding (timeout-pending) response handlers. Exposed
    /// for tests of the sweeper and the outstanding-request cap.
    pub fn outstanding_count(&self) -> usize {
        self.responders.len()
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        let rids: Vec<Uuid> = self.responders.iter().map(|e| *e.key()).collect();
        for rid in rids {
            if let Some((_, responder)) = self.responders.remove(&rid) {
                let _ = responder.tx.send(RpcOutcome::Timeout);
            }
        }
    }
}

async fn reader_loop(framer: Arc<RpcFramer>, mut reader: BoxedRead, req_tx: mpsc::UnboundedSender<Request>) {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::info!(error = %e, "agent control read error");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(pos) = find_separator(&buf) {
            let line: Vec<u8> = buf.drain(..pos).collect();
            buf.drain(..SEPARATOR.len());

            match parse_frame(&line) {
                Some(Frame::Request(req)) => {
                    if req_tx.send(req).is_err() {
                        // Owner dropped the receiver; nothing left to do.
                        return;
                    }
                }
                Some(Frame::Response(resp)) => {
                    if let Some((_, responder)) = framer.responders.remove(&resp.rid) {
                        let _ = responder.tx.send(RpcOutcome::Response(resp));
                    } else {
                        tracing::warn!(rid = %resp.rid, "response for unknown rid, dropping");
                    }
                }
                None => {
                    tracing::warn!("malformed control line, dropping");
                }
            }
        }
    }

    framer.mark_closed();
}

fn find_separator(buf: &[u8]) -> Option<usize> {
    buf.windows(SEPARATOR.len()).position(|w| w == SEPARATOR)
}

/// Read one `\r\n`-terminated JSON line off `stream` by hand, without
/// spawning a reader task. Used for the one-shot `register` exchange on a
/// fresh agent-ingress connection (spec.md §4.2), before the connection's
/// fate (Control framer vs. raw bridge byte pump) is decided — a persistent
/// [`RpcFramer`] would wrongly try to re-parse bridging-mode PTY/file bytes
/// as JSON lines.
///
/// Returns the decoded line plus any bytes already read past the
/// separator, which the caller must prepend to the stream's continued
/// byte stream (see [`HandshakeStream`]).
pub async fn read_one_line<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        if let Some(pos) = find_separator(&buf) {
            let rest = buf.split_off(pos + SEPARATOR.len());
            buf.truncate(pos);
            return Ok((buf, rest));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before a complete line was read",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Wraps a stream whose first few bytes were already consumed by
/// [`read_one_line`], replaying `leftover` before delegating to `inner`.
/// Lets the agent-ingress handler do a manual, un-framed register/ack/
/// upgrade exchange and then hand the same connection on to a freshly
/// spawned [`RpcFramer`] (Control mode) or [`crate::bridge::RawByteDuplex`]
/// (bridging modes) with no bytes lost (spec.md §4.8, §9).
pub struct HandshakeStream<S> {
    leftover: std::collections::VecDeque<u8>,
    inner: S,
}

impl<S> HandshakeStream<S> {
    pub fn new(leftover: Vec<u8>, inner: S) -> Self {
        Self {
            leftover: leftover.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for HandshakeStream<S> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = buf.remaining().min(self.leftover.len());
            let drained: Vec<u8> = self.leftover.drain(..n).collect();
            buf.put_slice(&drained);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HandshakeStream<S> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn sweeper_loop(framer: Arc<RpcFramer>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if framer.is_closed() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<Uuid> = framer
            .responders
            .iter()
            .filter(|e| e.value().deadline < now)
            .map(|e| *e.key())
            .collect();
        for rid in expired {
            if let Some((_, responder)) = framer.responders.remove(&rid) {
                let _ = responder.tx.send(RpcOutcome::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn fire_and_forget_registers_no_responder() {
        let (client, mut server) = duplex(4096);
        let config = CoreConfig::default();
        let (framer, _reqs) = RpcFramer::spawn(client, &config);

        framer.notify("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(framer.outstanding_count(), 0);

        // Drain the bytes so the test doesn't deadlock on a full pipe.
        let mut buf = vec![0u8; 256];
        let _ = server.read(&mut buf).await;
    }

    #[tokio::test]
    async fn request_times_out_when_unanswered() {
        let (client, mut _server) = duplex(4096);
        let mut config = CoreConfig::default();
        config.sweep_period = Duration::from_millis(20);
        let (framer, _reqs) = RpcFramer::spawn(client, &config);

        let outcome = framer
            .send_request("ping", serde_json::json!({}), 0)
            .await
            .unwrap();
        assert!(matches!(outcome, RpcOutcome::Timeout));
    }

    #[tokio::test]
    async fn response_for_unknown_rid_is_dropped_not_panicking() {
        let (client, mut server) = duplex(4096);
        let config = CoreConfig::default();
        let (_framer, _reqs) = RpcFramer::spawn(client, &config);

        let resp = Response::success(Uuid::new_v4(), serde_json::json!({}));
        let mut bytes = serde_json::to_vec(&resp).unwrap();
        bytes.extend_from_slice(SEPARATOR);
        server.write_all(&bytes).await.unwrap();
        // No panic, no hang: give the reader a moment to process it.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn separator_split_across_two_reads_is_not_lost() {
        let (client, mut server) = duplex(4096);
        let config = CoreConfig::default();
        let (_framer, mut reqs) = RpcFramer::spawn(client, &config);

        let req = Request::new("register", serde_json::json!({"mid":"x"}), 5);
        let mut bytes = serde_json::to_vec(&req).unwrap();
        bytes.push(b'\r');
        let rest = vec![b'\n'];

        server.write_all(&bytes).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.write_all(&rest).await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(200), reqs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.name, "register");
    }

    #[tokio::test]
    async fn read_one_line_captures_bytes_written_after_the_separator() {
        let (mut client, mut server) = duplex(4096);
        server.write_all(b"{\"a\":1}\r\nleftover-bytes").await.unwrap();
        let (line, leftover) = read_one_line(&mut client).await.unwrap();
        assert_eq!(line, b"{\"a\":1}");
        assert_eq!(leftover, b"leftover-bytes");
    }

    #[tokio::test]
    async fn handshake_stream_replays_leftover_before_the_inner_stream() {
        let (client, mut server) = duplex(4096);
        let mut wrapped = HandshakeStream::new(b"abc".to_vec(), client);

        server.write_all(b"def").await.unwrap();

        let mut buf = [0u8; 8];
        let n1 = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n1], b"abc");
        let n2 = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n2], b"def");
    }

    #[tokio::test]
    async fn two_objects_in_one_read_both_parsed_in_order() {
        let (client, mut server) = duplex(4096);
        let config = CoreConfig::default();
        let (_framer, mut reqs) = RpcFramer::spawn(client, &config);

        let req1 = Request::new("a", serde_json::json!({}), 5);
        let req2 = Request::new("b", serde_json::json!({}), 5);
        let mut bytes = serde_json::to_vec(&req1).unwrap();
        bytes.extend_from_slice(SEPARATOR);
        bytes.extend_from_slice(&serde_json::to_vec(&req2).unwrap());
        bytes.extend_from_slice(SEPARATOR);
        server.write_all(&bytes).await.unwrap();

        let first = reqs.recv().await.unwrap();
        let second = reqs.recv().await.unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(second.name, "b");
    }
}
