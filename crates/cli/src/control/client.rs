use std::time::Duration;

use anyhow::Context;
use slotwatch::{ControlRequest, ControlResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(windows)]
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use super::Endpoint;
use crate::error::{CliError, Result};

/// Stopping a watcher waits for its browser to close.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Sends one request. `Ok(None)` means no watcher is listening.
pub async fn send_request(endpoint: &Endpoint, request: ControlRequest) -> Result<Option<ControlResponse>> {
	let stream = match connect(endpoint).await {
		Ok(stream) => stream,
		Err(err) if is_not_running(&err) => return Ok(None),
		Err(err) => return Err(CliError::Io(err)),
	};

	let response = send_request_stream(stream, &request).await?;
	Ok(Some(response))
}

#[cfg(unix)]
async fn connect(endpoint: &Endpoint) -> std::io::Result<UnixStream> {
	UnixStream::connect(&endpoint.socket).await
}

#[cfg(windows)]
async fn connect(endpoint: &Endpoint) -> std::io::Result<TcpStream> {
	TcpStream::connect(("127.0.0.1", endpoint.port)).await
}

pub(crate) fn is_not_running(err: &std::io::Error) -> bool {
	matches!(err.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused)
}

pub(crate) async fn send_request_stream<S>(mut stream: S, request: &ControlRequest) -> Result<ControlResponse>
where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let payload = serde_json::to_string(request).context("Failed to serialize control request")?;
	stream
		.write_all(format!("{payload}\n").as_bytes())
		.await
		.context("Failed writing control request")?;
	stream.flush().await.context("Failed flushing control request")?;

	let mut reader = BufReader::new(stream);
	let mut line = String::new();
	tokio::time::timeout(RESPONSE_TIMEOUT, reader.read_line(&mut line))
		.await
		.map_err(|_| CliError::Context(format!("no response within {}s", RESPONSE_TIMEOUT.as_secs())))?
		.context("Failed reading control response")?;
	if line.trim().is_empty() {
		return Err(CliError::Context("watcher closed the connection without a response".to_string()));
	}

	let response = serde_json::from_str(line.trim()).context("Failed to parse control response")?;
	Ok(response)
}
