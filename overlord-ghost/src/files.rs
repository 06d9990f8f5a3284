//! File-upload/-download sessions: raw bytes to/from a local path (spec.md
//! §4.4's File-upload/File-download rows).

use overlord_proto::mode::Mode;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::session::{SessionContext, dial_back};

pub async fn download(ctx: &SessionContext, sid: &str, path: &str) -> anyhow::Result<()> {
    let mut session = dial_back(ctx, sid, Mode::FileDownload).await?;
    let mut file = File::open(path).await?;
    tokio::io::copy(&mut file, &mut session).await?;
    session.shutdown().await?;
    Ok(())
}

pub async fn upload(ctx: &SessionContext, sid: &str, path: &str) -> anyhow::Result<()> {
    let mut session = dial_back(ctx, sid, Mode::FileUpload).await?;
    let mut file = File::create(path).await?;
    tokio::io::copy(&mut session, &mut file).await?;
    file.flush().await?;
    Ok(())
}
