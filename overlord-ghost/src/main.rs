#![windows_subsystem = "windows"]

//! overlord-ghost binary entrypoint.
//!
//! A conforming agent: connects to an overlord server, registers as a
//! Control agent, and services spawn requests for every bridging mode
//! (terminal, shell, logcat, file upload/download, forward) until the
//! connection drops, then reconnects. Per-mode session logic lives in
//! `pty`, `shell`, `logcat`, `files`, and `forward`; `agent` and `session`
//! own the control RPC and the dial-back handshake.

mod agent;
mod files;
mod forward;
mod logcat;
mod pty;
mod session;
mod shell;

use tokio::time::{Duration, sleep};

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let server_addr = args.get(1).cloned().unwrap_or_else(|| "127.0.0.1:4455".to_string());
    let mid = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| overlord_proto::wire::RANDOM_MID.to_string());

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        tracing::info!(server_addr, attempt, "connecting to overlord");
        if let Err(e) = agent::run(&server_addr, &mid).await {
            tracing::warn!(error = %e, "agent session ended");
        }
        tracing::info!(delay_secs = RECONNECT_DELAY.as_secs(), "reconnecting");
        sleep(RECONNECT_DELAY).await;
    }
}
