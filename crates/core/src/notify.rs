//! Operator notifications.
//!
//! Delivery is best-effort: [`Notifications`] bounds every send with a timeout,
//! logs failures and never returns them, so a broken chat channel cannot stall
//! or abort the polling loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::NotifyError;
use crate::identity::Identity;

#[async_trait]
pub trait Notifier: Send + Sync {
	async fn send(&self, text: &str) -> Result<(), NotifyError>;

	async fn send_image(&self, image: &[u8], caption: &str) -> Result<(), NotifyError>;
}

/// Fire-and-forget front for a [`Notifier`].
#[derive(Clone)]
pub struct Notifications {
	inner: Arc<dyn Notifier>,
	timeout: Duration,
}

impl Notifications {
	pub fn new(inner: Arc<dyn Notifier>) -> Self {
		Self {
			inner,
			timeout: Duration::from_secs(30),
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub async fn send(&self, text: impl AsRef<str>) {
		let text = text.as_ref();
		match tokio::time::timeout(self.timeout, self.inner.send(text)).await {
			Ok(Ok(())) => debug!(target = "slotwatch.notify", "notification sent"),
			Ok(Err(err)) => warn!(target = "slotwatch.notify", error = %err, "notification failed"),
			Err(_) => warn!(target = "slotwatch.notify", timeout_secs = self.timeout.as_secs(), "notification timed out"),
		}
	}

	pub async fn send_image(&self, image: &[u8], caption: impl AsRef<str>) {
		let caption = caption.as_ref();
		match tokio::time::timeout(self.timeout, self.inner.send_image(image, caption)).await {
			Ok(Ok(())) => debug!(target = "slotwatch.notify", bytes = image.len(), "image sent"),
			Ok(Err(err)) => warn!(target = "slotwatch.notify", error = %err, "image notification failed"),
			Err(_) => warn!(target = "slotwatch.notify", timeout_secs = self.timeout.as_secs(), "image notification timed out"),
		}
	}
}

pub(crate) fn slot_found(identity: &Identity, marker: &str) -> String {
	format!(
		"New appointment availability for {} ({}): earliest date {}",
		identity.display_name(),
		identity.resource(),
		marker
	)
}

pub(crate) fn no_availability(identity: &Identity) -> String {
	format!("No appointments available any more for {} ({})", identity.resource(), identity.display_name())
}

pub(crate) fn claim_confirmed(identity: &Identity, marker: &str, slot: &str) -> String {
	format!("Appointment booked for {}: {} at {}", identity.display_name(), marker, slot)
}

pub(crate) fn claim_failed(identity: &Identity, marker: &str, reason: &str) -> String {
	format!(
		"Could not book {} for {}: {}. Please confirm manually.",
		marker,
		identity.display_name(),
		reason
	)
}

pub(crate) fn form_filled(identity: &Identity, filled: usize, missing: usize) -> String {
	format!("Filled {filled} form fields for {} ({missing} not found on page)", identity.display_name())
}

pub(crate) fn fatal(reason: &str) -> String {
	format!("Watcher stopped after an unrecoverable failure: {reason}")
}

pub(crate) fn budget_exhausted(kind: &str, attempts: u32) -> String {
	format!("Retry budget for {kind} exhausted after {attempts} attempts, restarting the browser session")
}
