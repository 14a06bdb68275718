use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("invalid file pattern: {0}")]
	Pattern(#[from] glob::PatternError),

	#[error("WebSocket error: {0}")]
	WebSocket(String),

	#[error("DevTools connection closed")]
	ConnectionClosed,

	#[error("{method} timed out after {}ms", timeout.as_millis())]
	Timeout { method: String, timeout: Duration },

	#[error("DevTools error {code}: {message}")]
	Protocol { code: i64, message: String },
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
