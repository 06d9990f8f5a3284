//! Wire envelope for the agent control RPC.
//!
//! An agent control connection carries a stream of JSON objects separated by
//! `\r\n`. Every object is either a [`Request`] (has a non-empty `name`) or a
//! [`Response`] (otherwise). See the parsing rule in the framing component —
//! this module only defines the shapes, not the byte-stream decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sentinel `mid` value meaning "the server should assign a fresh id".
pub const RANDOM_MID: &str = "RANDOM";

/// A request sent over the control RPC in either direction.
///
/// `timeout < 0` marks a fire-and-forget request: the sender registers no
/// response handler and the receiver is not expected to reply.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    pub rid: Uuid,
    pub timeout: i64,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    pub fn new(name: impl Into<String>, payload: Value, timeout: i64) -> Self {
        Self {
            rid: Uuid::new_v4(),
            timeout,
            name: name.into(),
            payload,
        }
    }

    /// A request for which no response is expected.
    pub fn notify(name: impl Into<String>, payload: Value) -> Self {
        Self::new(name, payload, -1)
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.timeout < 0
    }
}

/// Outcome status of a completed request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
}

/// A response correlated to a prior [`Request`] by `rid`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
    pub rid: Uuid,
    pub status: Status,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    pub fn success(rid: Uuid, payload: Value) -> Self {
        Self {
            rid,
            status: Status::Success,
            payload,
        }
    }

    pub fn failed(rid: Uuid, error: impl Into<String>) -> Self {
        Self {
            rid,
            status: Status::Failed,
            payload: serde_json::json!({ "error": error.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, Status::Success)
    }
}

/// One decoded line from a control connection: either half of the protocol.
///
/// Parsing rule (framing component): a line is tried as a [`Request`] first
/// (it must deserialize *and* carry a non-empty `name`); otherwise as a
/// [`Response`]. Anything matching neither is a malformed line.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

/// Parse one line of raw JSON bytes into a [`Frame`].
///
/// Returns `None` for malformed lines — callers log and drop these per the
/// framing component's failure semantics.
pub fn parse_frame(line: &[u8]) -> Option<Frame> {
    if let Ok(req) = serde_json::from_slice::<Request>(line) {
        if !req.name.is_empty() {
            return Some(Frame::Request(req));
        }
    }
    if let Ok(resp) = serde_json::from_slice::<Response>(line) {
        return Some(Frame::Response(resp));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips_all_fields() {
        let req = Request::new("spawn", serde_json::json!({"a": 1}), 10);
        let bytes = serde_json::to_vec(&req).unwrap();
        let back: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(req.rid, back.rid);
        assert_eq!(req.timeout, back.timeout);
        assert_eq!(req.name, back.name);
        assert_eq!(req.payload, back.payload);
    }

    #[test]
    fn response_roundtrips_all_fields() {
        let resp = Response::failed(Uuid::new_v4(), "agent-not-found");
        let bytes = serde_json::to_vec(&resp).unwrap();
        let back: Response = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(resp.rid, back.rid);
        assert_eq!(resp.status, back.status);
        assert_eq!(resp.payload, back.payload);
    }

    #[test]
    fn notify_is_fire_and_forget() {
        let req = Request::notify("ping", serde_json::json!({}));
        assert!(req.is_fire_and_forget());
    }

    #[test]
    fn parse_frame_prefers_request_shape() {
        let line = br#"{"rid":"3fa85f64-5717-4562-b3fc-2c963f66afa6","timeout":5,"name":"ping","payload":{}}"#;
        match parse_frame(line) {
            Some(Frame::Request(r)) => assert_eq!(r.name, "ping"),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn parse_frame_falls_back_to_response_shape() {
        let line = br#"{"rid":"3fa85f64-5717-4562-b3fc-2c963f66afa6","status":"success","payload":{}}"#;
        match parse_frame(line) {
            Some(Frame::Response(r)) => assert!(r.is_success()),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn parse_frame_rejects_garbage() {
        assert!(parse_frame(b"not json at all").is_none());
    }

    #[test]
    fn parse_frame_rejects_request_with_empty_name() {
        let line = br#"{"rid":"3fa85f64-5717-4562-b3fc-2c963f66afa6","timeout":5,"name":"","payload":{}}"#;
        // empty name falls through to the Response shape, which also fails
        // (no `status` field), so the whole line is malformed.
        assert!(parse_frame(line).is_none());
    }
}
