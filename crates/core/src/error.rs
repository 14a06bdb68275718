//! Error types for the watch core.
//!
//! [`PageError`] is what every page-interaction call can fail with; the
//! [`RecoveryController`](crate::recovery::RecoveryController) classifies it.
//! [`WatchError`] is the crate-wide error that flows from the watcher up to the
//! orchestrator.

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Typed failure of a page-interaction call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PageError {
	#[error("element not found: {0}")]
	ElementNotFound(String),

	#[error("element not interactable: {0}")]
	NotInteractable(String),

	#[error("stale element reference: {0}")]
	StaleElement(String),

	#[error("{operation} timed out after {}ms", timeout.as_millis())]
	Timeout { operation: String, timeout: Duration },

	#[error("navigation to {url} failed: {message}")]
	Navigation { url: String, message: String },

	#[error("browser unresponsive: {0}")]
	Unresponsive(String),

	#[error("browser process crashed: {0}")]
	Crashed(String),

	#[error("network failure: {0}")]
	Network(String),

	#[error("browser protocol error: {0}")]
	Protocol(String),
}

/// Failure to deliver an operator notification. Never escalated.
#[derive(Debug, Error)]
pub enum NotifyError {
	#[error("notification transport failed: {0}")]
	Transport(String),

	#[error("notification rejected: {0}")]
	Rejected(String),
}

#[derive(Debug, Error)]
pub enum WatchError {
	#[error(transparent)]
	Page(#[from] PageError),

	#[error("captcha rejected: {0}")]
	CaptchaRejected(String),

	#[error("site lockout ({reason}), cooling down for {}s", cooldown.as_secs())]
	SiteLockout { reason: String, cooldown: Duration },

	#[error("network degraded: {0}")]
	NetworkDegraded(String),

	#[error("login failed: {0}")]
	LoginFailed(String),

	#[error("site error page: {0}")]
	SiteError(String),

	#[error("session is not ready (state: {0})")]
	SessionNotReady(SessionState),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("fatal: {0}")]
	Fatal(String),

	#[error("stopped")]
	Stopped,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Runtime(#[from] slotwatch_runtime::RuntimeError),
}

impl WatchError {
	/// Errors that bypass recovery entirely and stop the process.
	pub fn is_fatal(&self) -> bool {
		matches!(self, WatchError::Fatal(_) | WatchError::Config(_))
	}
}

pub type Result<T, E = WatchError> = std::result::Result<T, E>;
