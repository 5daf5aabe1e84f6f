//! Minimal stand-in for the Ferret language server, used by the
//! integration tests to exercise real spawned processes.
//!
//! Speaks over stdio by default or listens on `--socket=PORT`. Answers
//! `initialize` and `shutdown`, ignores everything else, and exits on
//! `exit`. `--pid-file=PATH` records the process id before serving.

use std::path::PathBuf;

use anyhow::{Context, Result};
use ferret_lsp::codec::{MessageReader, MessageWriter};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

#[derive(Default)]
struct Args {
    port: Option<u16>,
    pid_file: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    for arg in std::env::args().skip(1) {
        if let Some(port) = arg.strip_prefix("--socket=") {
            args.port = Some(port.parse().with_context(|| format!("bad port {port:?}"))?);
        } else if let Some(path) = arg.strip_prefix("--pid-file=") {
            args.pid_file = Some(PathBuf::from(path));
        }
    }
    Ok(args)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = parse_args()?;
    if let Some(path) = &args.pid_file {
        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("writing {}", path.display()))?;
    }

    match args.port {
        Some(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .with_context(|| format!("binding 127.0.0.1:{port}"))?;
            let (stream, _) = listener.accept().await.context("accepting client")?;
            let (reader, writer) = stream.into_split();
            serve(reader, writer).await
        }
        None => serve(tokio::io::stdin(), tokio::io::stdout()).await,
    }
}

async fn serve<R, W>(reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = MessageReader::new(reader);
    let mut writer = MessageWriter::new(writer);

    while let Some(message) = reader.next_message().await? {
        let reply = match message["method"].as_str() {
            Some("initialize") => json!({ "capabilities": { "textDocumentSync": 1 } }),
            Some("shutdown") => Value::Null,
            Some("exit") => return Ok(()),
            _ => continue,
        };
        let response = json!({ "jsonrpc": "2.0", "id": message["id"], "result": reply });
        writer.send(&response).await?;
    }
    Ok(())
}
