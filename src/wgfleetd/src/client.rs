//! Thin client: every CLI subcommand other than `run` is a one-shot
//! connection to the daemon's control socket.

use std::path::Path;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::protocol::{Request, Response};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("could not connect to daemon socket at {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error talking to daemon: {0}")]
    Io(#[from] std::io::Error),
    #[error("daemon sent an unparseable response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("daemon returned an error: {0}")]
    Remote(String),
}

pub async fn send(socket_path: &Path, request: Request) -> Result<Response, ClientError> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| ClientError::Connect {
            path: socket_path.display().to_string(),
            source: e,
        })?;

    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;

    let (read_half, _write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let Some(response_line) = lines.next_line().await? else {
        return Err(ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "daemon closed the connection without responding",
        )));
    };
    let response: Response = serde_json::from_str(&response_line)?;
    if let Response::Error(msg) = &response {
        return Err(ClientError::Remote(msg.clone()));
    }
    Ok(response)
}
