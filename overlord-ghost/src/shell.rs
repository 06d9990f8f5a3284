//! Shell-mode session: runs one command with piped stdio, forwarding
//! combined stdout/stderr downstream and stdin upstream, closing stdin on
//! the in-band sentinel (spec.md §4.4's Shell row).

use std::process::Stdio;

use overlord_proto::mode::{Mode, STDIN_CLOSED_SENTINEL};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::session::{SessionContext, dial_back};

fn find_sentinel(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub async fn run(ctx: &SessionContext, sid: &str, command: &str) -> anyhow::Result<()> {
    let stream = dial_back(ctx, sid, Mode::Shell).await?;
    let (mut sock_read, mut sock_write) = tokio::io::split(stream);

    let mut child = if cfg!(windows) {
        Command::new("powershell.exe")
            .args(["-NoLogo", "-Command", command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?
    } else {
        Command::new("bash")
            .args(["-lc", command])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?
    };

    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let stderr_tx = tx.clone();

    let stdout_task = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stderr_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    let writer_task = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if sock_write.write_all(&data).await.is_err() {
                break;
            }
        }
    });
    let stdin_task = tokio::spawn(async move {
        let sentinel = STDIN_CLOSED_SENTINEL.as_bytes();
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match sock_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    if let Some(pos) = find_sentinel(&pending, sentinel) {
                        if pos > 0 && stdin.write_all(&pending[..pos]).await.is_err() {
                            break;
                        }
                        break;
                    }
                    // The tail might be the start of a sentinel split across
                    // reads; hold it back until it can't be completed by
                    // anything shorter than the whole sentinel.
                    let safe_len = pending.len().saturating_sub(sentinel.len() - 1);
                    if safe_len > 0 {
                        if stdin.write_all(&pending[..safe_len]).await.is_err() {
                            break;
                        }
                        pending.drain(..safe_len);
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = stdin_task => {}
        _ = writer_task => {}
    }
    stdout_task.abort();
    stderr_task.abort();
    let _ = child.kill().await;
    Ok(())
}
