use std::path::PathBuf;

use slotwatch::WatchError;
use slotwatch_runtime::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
	#[error(transparent)]
	Watch(#[from] WatchError),

	#[error(transparent)]
	Runtime(#[from] RuntimeError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("settings file not found: {}", .0.display())]
	SettingsMissing(PathBuf),

	#[error("watcher is not running (no control socket at {0})")]
	NotRunning(String),

	#[error("{0}")]
	Context(String),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

pub type Result<T, E = CliError> = std::result::Result<T, E>;
