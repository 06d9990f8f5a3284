//! Forward-mode session: tunnels raw TCP bytes between the paired agent-side
//! socket and a remote host:port reachable from the agent (spec.md §4.4's
//! Forward row, scenario S3).

use overlord_proto::mode::Mode;
use tokio::net::TcpStream;

use crate::session::{SessionContext, dial_back};

pub async fn run(ctx: &SessionContext, sid: &str, host: &str, port: u16) -> anyhow::Result<()> {
    let mut session = dial_back(ctx, sid, Mode::Forward).await?;
    let mut remote = TcpStream::connect((host, port)).await?;
    tokio::io::copy_bidirectional(&mut session, &mut remote).await?;
    Ok(())
}
