//! Cooperative cancellation shared by the polling loop and the background timers.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Result, WatchError};

pub fn stop_channel() -> (StopTrigger, StopSignal) {
	let (tx, rx) = watch::channel(false);
	(StopTrigger { tx }, StopSignal { rx })
}

/// Owner side. Stopping is one-way.
#[derive(Debug)]
pub struct StopTrigger {
	tx: watch::Sender<bool>,
}

impl StopTrigger {
	pub fn stop(&self) {
		self.tx.send_replace(true);
	}

	pub fn is_stopped(&self) -> bool {
		*self.tx.borrow()
	}

	pub fn signal(&self) -> StopSignal {
		StopSignal { rx: self.tx.subscribe() }
	}
}

/// Observer side, checked at loop tops and raced against every wait.
///
/// A dropped trigger counts as a stop.
#[derive(Debug, Clone)]
pub struct StopSignal {
	rx: watch::Receiver<bool>,
}

impl StopSignal {
	pub fn is_stopped(&self) -> bool {
		*self.rx.borrow() || self.rx.has_changed().is_err()
	}

	/// Resolves once a stop is requested.
	pub async fn stopped(&self) {
		let mut rx = self.rx.clone();
		let _ = rx.wait_for(|stopped| *stopped).await;
	}

	/// Sleeps for `duration` unless a stop arrives first, which yields [`WatchError::Stopped`].
	pub async fn sleep(&self, duration: Duration) -> Result<()> {
		tokio::select! {
			_ = tokio::time::sleep(duration) => Ok(()),
			_ = self.stopped() => Err(WatchError::Stopped),
		}
	}
}
