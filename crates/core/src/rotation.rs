//! Round-robin identity rotation.

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, WatchError};
use crate::identity::Identity;

/// Emitted once every time the rotation completes a full pass over all identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleCompleted {
	/// 1-based pass number.
	pub cycle: u64,
	pub identities: usize,
}

/// Owns the identity set and hands identities out in fixed order.
///
/// A pass completes the moment the cursor wraps back to the first identity, so
/// after `k * n` calls to [`next`](Self::next) on `n` identities exactly `k`
/// [`CycleCompleted`] events have been emitted. Emission never blocks.
pub struct RotationScheduler {
	identities: Vec<Identity>,
	cursor: usize,
	cycles: u64,
	events: Option<mpsc::UnboundedSender<CycleCompleted>>,
}

impl RotationScheduler {
	pub fn new(identities: Vec<Identity>) -> Result<Self> {
		if identities.is_empty() {
			return Err(WatchError::Config("at least one identity is required".to_string()));
		}
		Ok(Self {
			identities,
			cursor: 0,
			cycles: 0,
			events: None,
		})
	}

	/// Returns the receiving end for cycle-completion events.
	pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CycleCompleted> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.events = Some(tx);
		rx
	}

	pub fn completed_cycles(&self) -> u64 {
		self.cycles
	}

	/// Position of the identity the next call will return.
	pub fn cursor(&self) -> usize {
		self.cursor
	}

	pub fn next(&mut self) -> &Identity {
		let index = self.cursor;
		self.cursor = (self.cursor + 1) % self.identities.len();

		if self.cursor == 0 {
			self.cycles += 1;
			let event = CycleCompleted {
				cycle: self.cycles,
				identities: self.identities.len(),
			};
			debug!(target = "slotwatch.rotation", cycle = event.cycle, "rotation pass completed");
			if let Some(tx) = &self.events {
				if tx.send(event).is_err() {
					self.events = None;
				}
			}
		}

		&self.identities[index]
	}
}
