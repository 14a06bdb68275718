use std::future::Future;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use slotwatch::{ControlRequest, ControlResponse, Controller};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(windows)]
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Endpoint, RemoteRequest};
use crate::error::{CliError, Result};

/// A client gets this long to send its request line.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ControlServer {
	#[cfg(unix)]
	listener: UnixListener,
	#[cfg(unix)]
	path: PathBuf,
	#[cfg(windows)]
	listener: TcpListener,
	remote: Option<mpsc::Receiver<RemoteRequest>>,
}

impl ControlServer {
	/// Binds the control endpoint. A leftover unix socket from a dead process is
	/// replaced; one with a live listener is an error.
	#[cfg(unix)]
	pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
		let path = endpoint.socket.clone();
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		if path.exists() {
			if UnixStream::connect(&path).await.is_ok() {
				return Err(CliError::Context(format!("another watcher is already listening on {}", path.display())));
			}
			debug!(target = "slotwatch.control", path = %path.display(), "removing stale control socket");
			std::fs::remove_file(&path)?;
		}
		let listener = UnixListener::bind(&path)?;
		Ok(Self { listener, path, remote: None })
	}

	#[cfg(windows)]
	pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
		let listener = TcpListener::bind(("127.0.0.1", endpoint.port))
			.await
			.map_err(|e| CliError::Context(format!("Failed to bind control port {}: {e}", endpoint.port)))?;
		Ok(Self { listener, remote: None })
	}

	/// Also serves requests arriving on `remote`.
	pub fn with_remote(mut self, remote: mpsc::Receiver<RemoteRequest>) -> Self {
		self.remote = Some(remote);
		self
	}

	/// Answers requests one at a time until `shutdown` resolves or a client
	/// sends `shutdown`.
	pub async fn run<F>(mut self, controller: &mut Controller, shutdown: F) -> Result<()>
	where
		F: Future<Output = ()>,
	{
		tokio::pin!(shutdown);
		loop {
			tokio::select! {
				_ = &mut shutdown => {
					info!(target = "slotwatch.control", "shutdown signal received");
					return Ok(());
				}
				accepted = self.listener.accept() => {
					let stream = match accepted {
						Ok((stream, _)) => stream,
						Err(err) => {
							warn!(target = "slotwatch.control", error = %err, "accept failed");
							continue;
						}
					};
					match serve_connection(stream, controller).await {
						Ok(true) => {
							info!(target = "slotwatch.control", "shutdown requested");
							return Ok(());
						}
						Ok(false) => {}
						Err(err) => debug!(target = "slotwatch.control", error = %err, "control connection failed"),
					}
				}
				remote = next_remote(&mut self.remote) => {
					let Some(remote) = remote else {
						debug!(target = "slotwatch.control", "remote request source closed");
						self.remote = None;
						continue;
					};
					if serve_remote(remote, controller).await {
						info!(target = "slotwatch.control", "shutdown requested");
						return Ok(());
					}
				}
			}
		}
	}
}

async fn next_remote(remote: &mut Option<mpsc::Receiver<RemoteRequest>>) -> Option<RemoteRequest> {
	match remote {
		Some(rx) => rx.recv().await,
		None => std::future::pending().await,
	}
}

/// Runs `request` against the controller. The flag is set for an accepted
/// `shutdown`.
async fn execute(request: ControlRequest, controller: &mut Controller) -> (ControlResponse, bool) {
	let shutdown = request == ControlRequest::Shutdown;
	let response = controller.handle(request).await;
	let accepted = !matches!(response, ControlResponse::Error { .. });
	(response, shutdown && accepted)
}

pub(crate) async fn serve_remote(remote: RemoteRequest, controller: &mut Controller) -> bool {
	debug!(target = "slotwatch.control", "remote request received");
	let (response, shutdown) = execute(remote.request, controller).await;
	if remote.reply.send(response).is_err() {
		debug!(target = "slotwatch.control", "remote requester went away");
	}
	shutdown
}

#[cfg(unix)]
impl Drop for ControlServer {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.path);
	}
}

/// Reads one request, executes it and writes the response. Returns `true` for
/// an accepted `shutdown` request.
pub(crate) async fn serve_connection<S>(stream: S, controller: &mut Controller) -> Result<bool>
where
	S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let (read, mut write) = tokio::io::split(stream);
	let mut reader = BufReader::new(read);
	let mut line = String::new();
	let read = tokio::time::timeout(REQUEST_TIMEOUT, reader.read_line(&mut line))
		.await
		.map_err(|_| CliError::Context("control client sent no request".to_string()))??;
	if read == 0 {
		return Ok(false);
	}

	let (response, shutdown) = match serde_json::from_str::<ControlRequest>(line.trim()) {
		Ok(request) => {
			debug!(target = "slotwatch.control", "control request received");
			execute(request, controller).await
		}
		Err(err) => (
			ControlResponse::Error {
				code: "bad_request".to_string(),
				message: err.to_string(),
			},
			false,
		),
	};

	let payload = serde_json::to_string(&response)?;
	write.write_all(format!("{payload}\n").as_bytes()).await?;
	write.flush().await?;
	Ok(shutdown)
}
