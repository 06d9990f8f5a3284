//! User-side `ByteDuplex` adapters for the four front-end transports this
//! layer exposes (spec.md §4.4's mode table): a WebSocket for
//! Terminal/Shell/Logcat/Forward, a streamed HTTP response body for
//! File-download, and a multipart HTTP request body for File-upload.
//! `overlord_core::bridge::pump` only ever sees the trait, never these
//! concrete shapes.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use overlord_core::bridge::{ByteDuplex, WireMessage};
use tokio::sync::mpsc;

/// Wraps an axum `WebSocket`: binary frames carry raw payload bytes, text
/// frames carry JSON control frames (resize, sid) handled by the pump.
pub struct WsDuplex {
    socket: WebSocket,
}

impl WsDuplex {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl ByteDuplex for WsDuplex {
    async fn recv(&mut self) -> std::io::Result<Option<WireMessage>> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(WireMessage::Binary(data.into()))),
                Some(Ok(Message::Text(text))) => return Ok(Some(WireMessage::Text(text.to_string()))),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(std::io::Error::other(e)),
            }
        }
    }

    async fn send(&mut self, msg: WireMessage) -> std::io::Result<()> {
        let frame = match msg {
            WireMessage::Binary(b) => Message::Binary(b.into()),
            WireMessage::Text(t) => Message::Text(t.into()),
        };
        self.socket.send(frame).await.map_err(std::io::Error::other)
    }

    async fn shutdown(&mut self) {
        let _ = self.socket.close().await;
    }
}

/// User side of a File-download session (spec.md §4.4: "HTTP response
/// body"). The user→agent direction never produces anything — a download
/// is agent-to-user only — so `recv` blocks forever and only the
/// agent→user loop in `pump` can end the session. `send` pushes each chunk
/// of agent bytes into a channel an axum `Body::from_stream` drains.
pub struct HttpDownloadDuplex {
    tx: mpsc::Sender<std::io::Result<Bytes>>,
}

impl HttpDownloadDuplex {
    pub fn new(tx: mpsc::Sender<std::io::Result<Bytes>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ByteDuplex for HttpDownloadDuplex {
    async fn recv(&mut self) -> std::io::Result<Option<WireMessage>> {
        std::future::pending().await
    }

    async fn send(&mut self, msg: WireMessage) -> std::io::Result<()> {
        let bytes = match msg {
            WireMessage::Binary(b) => Bytes::from(b),
            WireMessage::Text(t) => Bytes::from(t.into_bytes()),
        };
        self.tx
            .send(Ok(bytes))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))
    }

    async fn shutdown(&mut self) {
        // Dropping the sender ends the response body stream.
    }
}

/// User side of a File-upload session (spec.md §4.4: "HTTP multipart body
/// consumed by the server and forwarded"). `recv` drains chunks read from
/// the multipart field by the route handler; `send` discards anything the
/// agent writes back (uploads carry no downstream payload).
pub struct HttpUploadDuplex {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl HttpUploadDuplex {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl ByteDuplex for HttpUploadDuplex {
    async fn recv(&mut self) -> std::io::Result<Option<WireMessage>> {
        Ok(self.rx.recv().await.map(WireMessage::Binary))
    }

    async fn send(&mut self, _msg: WireMessage) -> std::io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.rx.close();
    }
}
