//! Core session-multiplexer engine: agent registry, RPC framing, rendezvous
//! pairing, event bus, TLS bootstrap, LAN discovery, and the accept loop
//! that ties them together into [`Overlord`]. Front ends (`overlord-web`'s
//! HTTP/WS surface, or any other embedder) depend on this crate and never
//! touch a raw socket themselves.

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod ingress;
pub mod registry;
pub mod rendezvous;
pub mod rpc;
pub mod tls;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use ingress::{Overlord, UserAttachOutcome};
