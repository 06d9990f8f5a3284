//! Tunable configuration for the multiplexer core (`SPEC_FULL.md`,
//! `[CONFIG]`). Values the spec names but leaves as "the source does X by
//! default" get a concrete default here; everything is overridable by
//! whatever embeds this crate (see `overlord-web::config` for the
//! environment-variable-driven front-end equivalent).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Default per-request timeout when a caller doesn't specify one.
    pub default_request_timeout: Duration,
    /// Period of the RPC responder timeout sweeper (spec.md §4.1: "≤ 3s").
    pub sweep_period: Duration,
    /// Interval between `ping` requests sent to Control agents.
    pub ping_period: Duration,
    /// Grace period before an unpaired rendezvous entry is reaped.
    pub orphan_grace: Duration,
    /// Cap on a single framer's outstanding response handlers
    /// (spec.md §9 "Per-response-handler state").
    pub max_outstanding_requests: usize,
    /// Bounded per-subscriber event buffer depth (spec.md §9 "bounded send
    /// buffer (e.g., 64 events)").
    pub subscriber_buffer: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_request_timeout: Duration::from_secs(60),
            sweep_period: Duration::from_secs(3),
            ping_period: Duration::from_secs(10),
            orphan_grace: Duration::from_secs(60),
            max_outstanding_requests: 4096,
            subscriber_buffer: 64,
        }
    }
}
