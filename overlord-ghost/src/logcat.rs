//! Logcat-mode session: streams a configurable log-tailing command's
//! stdout downstream only; user-side traffic is discarded (spec.md §4.4's
//! Logcat row: "user messages (if any) are discarded").

use std::process::Stdio;

use overlord_proto::mode::Mode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::session::{SessionContext, dial_back};

/// Command line to tail for log output. Overridable since the right log
/// source is host-specific; defaults to a generic syslog tail on Unix and
/// the CBS setup log on Windows, neither of which assumes a particular
/// deployment.
fn logcat_command() -> String {
    std::env::var("OVERLORD_LOGCAT_CMD").unwrap_or_else(|_| {
        if cfg!(windows) {
            r"powershell.exe -NoLogo -Command Get-Content -Wait -Path $env:WINDIR\Logs\CBS\CBS.log".to_string()
        } else {
            "tail -F -n 0 /var/log/syslog".to_string()
        }
    })
}

pub async fn run(ctx: &SessionContext, sid: &str) -> anyhow::Result<()> {
    let stream = dial_back(ctx, sid, Mode::Logcat).await?;
    let (mut sock_read, mut sock_write) = tokio::io::split(stream);

    let cmd_line = logcat_command();
    let mut parts = cmd_line.split_whitespace();
    let program = parts.next().unwrap_or("tail");
    let mut child = Command::new(program)
        .args(parts)
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdout = child.stdout.take().expect("piped stdout");

    let drain_task = tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        loop {
            match sock_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    let pump_task = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sock_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = drain_task => {}
        _ = pump_task => {}
    }
    let _ = child.kill().await;
    Ok(())
}
