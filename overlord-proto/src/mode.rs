//! Closed tagged union of agent-originated connection modes plus the
//! payload shapes exchanged during registration and session spawn.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Role of a given agent-originated connection.
///
/// `Control` is the only mode installed into the agent registry; every
/// other mode exists only for the lifetime of one bridged session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Control,
    Terminal,
    Shell,
    Logcat,
    FileUpload,
    FileDownload,
    Forward,
}

impl Mode {
    /// The `spawn` request verb used on the control RPC for this mode.
    ///
    /// Fixed here (see `SPEC_FULL.md`, `[RENDEZVOUS]`) because the source
    /// this spec distills from used differing verbs across revisions.
    pub fn spawn_verb(self) -> &'static str {
        match self {
            Mode::Control => "register",
            Mode::Terminal => "terminal",
            Mode::Shell => "shell",
            Mode::Logcat => "logcat",
            Mode::FileUpload => "file_upload",
            Mode::FileDownload => "file_download",
            Mode::Forward => "forward",
        }
    }

    pub fn is_bridging(self) -> bool {
        !matches!(self, Mode::Control)
    }
}

/// A property value: either a single string or a list of strings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum PropertyValue {
    Single(String),
    List(Vec<String>),
}

pub type Properties = HashMap<String, PropertyValue>;

/// TLS negotiation preferences carried in the `register` payload.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub verify: bool,
}

/// Payload of the registration `Request` every agent-originated connection
/// sends first, whether registering a Control agent or pairing a bridging
/// connection to a pending session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterPayload {
    /// Client-chosen machine id, or [`crate::wire::RANDOM_MID`].
    pub mid: String,
    /// Session-id this connection is pairing into; ignored for `Control`.
    #[serde(default)]
    pub sid: String,
    pub mode: Mode,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub tls_settings: TlsSettings,
}

/// Response payload of a successful `register` request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterAck {
    pub mid: String,
}

/// Mode-specific parameters for an `open_session` call, sent as (most of)
/// the payload of the `spawn` request on the owning agent's control RPC.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "mode_params")]
pub enum SpawnParams {
    Terminal {
        #[serde(default)]
        tty_device: Option<String>,
        rows: u16,
        cols: u16,
    },
    Shell {
        command: String,
    },
    Logcat,
    FileUpload {
        path: String,
    },
    FileDownload {
        path: String,
    },
    Forward {
        host: String,
        port: u16,
    },
}

impl SpawnParams {
    pub fn mode(&self) -> Mode {
        match self {
            SpawnParams::Terminal { .. } => Mode::Terminal,
            SpawnParams::Shell { .. } => Mode::Shell,
            SpawnParams::Logcat => Mode::Logcat,
            SpawnParams::FileUpload { .. } => Mode::FileUpload,
            SpawnParams::FileDownload { .. } => Mode::FileDownload,
            SpawnParams::Forward { .. } => Mode::Forward,
        }
    }
}

/// Control frame exchanged on a paired Terminal/Shell WebSocket, distinct
/// from the raw binary PTY/stdio bytes that otherwise flow unmodified.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Resize { rows: u16, cols: u16 },
    Sid { data: String },
}

/// In-band sentinel signalling stdin EOF toward the agent in Shell mode.
pub const STDIN_CLOSED_SENTINEL: &str = "##STDIN_CLOSED##";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_json() {
        for m in [
            Mode::Control,
            Mode::Terminal,
            Mode::Shell,
            Mode::Logcat,
            Mode::FileUpload,
            Mode::FileDownload,
            Mode::Forward,
        ] {
            let s = serde_json::to_string(&m).unwrap();
            let back: Mode = serde_json::from_str(&s).unwrap();
            assert_eq!(m, back);
        }
    }

    #[test]
    fn property_value_accepts_single_or_list() {
        let single: PropertyValue = serde_json::from_str(r#""linux""#).unwrap();
        assert_eq!(single, PropertyValue::Single("linux".into()));
        let list: PropertyValue = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(list, PropertyValue::List(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn control_frame_resize_parses() {
        let frame: ControlFrame =
            serde_json::from_str(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
        match frame {
            ControlFrame::Resize { rows, cols } => {
                assert_eq!(rows, 40);
                assert_eq!(cols, 120);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
