//! LAN discovery (`SPEC_FULL.md`, `[LAN-DISCOVERY]`; spec.md §4.7).
//!
//! Independent of all other server state: a UDP socket periodically
//! broadcasts `OVERLORD <port>` so agents on the same LAN can auto-discover
//! the agent-ingress port without being told it out of band.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

const BROADCAST_PERIOD: Duration = Duration::from_secs(3);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Run the discovery broadcast loop until `shutdown` fires. Never returns
/// on its own; interface resolution failures log at warn and retry with
/// capped exponential backoff (spec.md §4.9 "LAN broadcast interface
/// disappears").
pub async fn broadcast(
    ld_port: u16,
    agent_port: u16,
    broadcast_addr: IpAddr,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let message = format!("OVERLORD {agent_port}");
    let mut backoff = Duration::from_millis(200);

    loop {
        if *shutdown.borrow() {
            return;
        }

        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => {
                if let Err(e) = socket.set_broadcast(true) {
                    tracing::warn!(error = %e, "failed to enable UDP broadcast, retrying");
                } else {
                    backoff = Duration::from_millis(200);
                    let dest = SocketAddr::new(broadcast_addr, ld_port);
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                            _ = tokio::time::sleep(BROADCAST_PERIOD) => {
                                if let Err(e) = socket.send_to(message.as_bytes(), dest).await {
                                    tracing::warn!(error = %e, "LAN discovery send failed, re-binding");
                                    break;
                                }
                            }
                        }
                    }
                    continue;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to bind LAN discovery socket, retrying");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shuts_down_promptly_when_signalled() {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(broadcast(
            4456,
            4455,
            IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)),
            rx,
        ));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "broadcast loop did not shut down promptly");
    }
}
