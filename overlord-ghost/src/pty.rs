//! Terminal-mode session: opens a native pseudo-terminal (PowerShell on
//! Windows, bash elsewhere) and bridges raw bytes between it and the paired
//! agent-side socket, honoring resize requests routed in from the control
//! RPC (spec.md §4.4's Terminal row, §4.5's resize side-channel).

use std::io::{Read, Write};

use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use overlord_proto::mode::Mode;

use crate::session::{SessionContext, dial_back};

pub async fn run(
    ctx: &SessionContext,
    sid: &str,
    tty_device: Option<String>,
    rows: u16,
    cols: u16,
) -> anyhow::Result<()> {
    if let Some(device) = tty_device {
        tracing::warn!(sid, device, "tty_device hint ignored, opening a fresh pty");
    }

    let stream = dial_back(ctx, sid, Mode::Terminal).await?;

    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let cmd = if cfg!(windows) {
        let mut c = CommandBuilder::new("powershell.exe");
        c.args(["-NoExit", "-NoLogo"]);
        c
    } else {
        let mut c = CommandBuilder::new("bash");
        c.env("TERM", "xterm-256color");
        c
    };
    let mut child = pair.slave.spawn_command(cmd)?;
    drop(pair.slave);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut pty_reader = pair.master.try_clone_reader()?;
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        while let Ok(n) = pty_reader.read(&mut buf) {
            if n == 0 || out_tx.send(buf[..n].to_vec()).is_err() {
                break;
            }
        }
    });

    let (resize_tx, mut resize_rx) = mpsc::unbounded_channel::<(u16, u16)>();
    ctx.resize_channels.insert(sid.to_string(), resize_tx);

    let mut pty_writer = pair.master.take_writer()?;
    let master = pair.master;
    let (mut sock_read, mut sock_write) = tokio::io::split(stream);

    let writer_task = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if sock_write.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let reader_task = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                result = sock_read.read(&mut buf) => {
                    match result {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if pty_writer.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
                Some((rows, cols)) = resize_rx.recv() => {
                    let _ = master.resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 });
                }
            }
        }
    });

    tokio::select! {
        _ = writer_task => {}
        _ = reader_task => {}
    }

    ctx.resize_channels.remove(sid);
    let _ = child.kill();
    Ok(())
}
