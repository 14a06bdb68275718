//! Local control channel: one newline-delimited JSON [`ControlRequest`] per
//! connection, answered by one JSON [`ControlResponse`] line.
//!
//! Unix builds listen on `<state_dir>/slotwatch.sock`; windows builds listen on
//! `127.0.0.1:<control.port>`. In-process sources such as the chat poller hand
//! requests over as [`RemoteRequest`]s instead.
//!
//! [`ControlRequest`]: slotwatch::ControlRequest
//! [`ControlResponse`]: slotwatch::ControlResponse

mod client;
mod server;

use std::path::PathBuf;

use slotwatch::{ControlRequest, ControlResponse, Settings};
use tokio::sync::oneshot;

pub use client::send_request;
pub use server::ControlServer;

use crate::paths;

/// A request from inside the process, answered through `reply`.
#[derive(Debug)]
pub struct RemoteRequest {
	pub request: ControlRequest,
	pub reply: oneshot::Sender<ControlResponse>,
}

/// Where the control channel lives for one settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
	pub socket: PathBuf,
	pub port: u16,
}

impl Endpoint {
	pub fn from_settings(settings: &Settings) -> Self {
		Self {
			socket: paths::socket_path(&paths::state_dir(settings)),
			port: settings.control.port,
		}
	}

	pub fn describe(&self) -> String {
		if cfg!(windows) {
			format!("127.0.0.1:{}", self.port)
		} else {
			self.socket.display().to_string()
		}
	}
}
