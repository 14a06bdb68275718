//! Failure classification and per-kind retry budgets.
//!
//! Every failure that reaches the orchestrator is classified into exactly one
//! [`FailureKind`]. Each kind owns an independent [`RetryBudget`]; a failure of
//! kind K only ever touches K's counter, and a success only resets the budget of
//! the kind that was triggered last. Exhausting a budget escalates: ordinary
//! kinds escalate to a session rebuild, crash kinds (whose normal response already
//! is a rebuild) escalate to a fatal stop, and too many escalations in a row are
//! fatal as well.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PageError, WatchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	ElementTransient,
	StaleReference,
	BrowserUnresponsive,
	ProcessCrashed,
	NetworkDegraded,
	SiteLockout,
	CaptchaRejected,
	Unclassified,
}

impl FailureKind {
	pub const ALL: [FailureKind; 8] = [
		FailureKind::ElementTransient,
		FailureKind::StaleReference,
		FailureKind::BrowserUnresponsive,
		FailureKind::ProcessCrashed,
		FailureKind::NetworkDegraded,
		FailureKind::SiteLockout,
		FailureKind::CaptchaRejected,
		FailureKind::Unclassified,
	];

	pub fn classify(err: &WatchError) -> FailureKind {
		match err {
			WatchError::Page(page) => match page {
				PageError::ElementNotFound(_) | PageError::NotInteractable(_) | PageError::Timeout { .. } => FailureKind::ElementTransient,
				PageError::StaleElement(_) => FailureKind::StaleReference,
				PageError::Unresponsive(_) => FailureKind::BrowserUnresponsive,
				PageError::Crashed(_) => FailureKind::ProcessCrashed,
				PageError::Network(_) | PageError::Navigation { .. } => FailureKind::NetworkDegraded,
				PageError::Protocol(_) => FailureKind::Unclassified,
			},
			WatchError::SessionNotReady(_) => FailureKind::BrowserUnresponsive,
			WatchError::NetworkDegraded(_) => FailureKind::NetworkDegraded,
			WatchError::SiteLockout { .. } => FailureKind::SiteLockout,
			WatchError::CaptchaRejected(_) => FailureKind::CaptchaRejected,
			_ => FailureKind::Unclassified,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			FailureKind::ElementTransient => "element_transient",
			FailureKind::StaleReference => "stale_reference",
			FailureKind::BrowserUnresponsive => "browser_unresponsive",
			FailureKind::ProcessCrashed => "process_crashed",
			FailureKind::NetworkDegraded => "network_degraded",
			FailureKind::SiteLockout => "site_lockout",
			FailureKind::CaptchaRejected => "captcha_rejected",
			FailureKind::Unclassified => "unclassified",
		}
	}

	/// Kinds whose regular response is a full session rebuild.
	fn rebuilds_session(self) -> bool {
		matches!(self, FailureKind::BrowserUnresponsive | FailureKind::ProcessCrashed)
	}

	fn retry_action(self) -> RetryAction {
		match self {
			FailureKind::StaleReference => RetryAction::RefreshPage,
			FailureKind::CaptchaRejected => RetryAction::DiscardArtifacts,
			_ => RetryAction::None,
		}
	}

	fn index(self) -> usize {
		self as usize
	}
}

impl fmt::Display for FailureKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Preparation the orchestrator performs before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
	None,
	RefreshPage,
	DiscardArtifacts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
	Retry { wait: Duration, action: RetryAction },
	/// Tear the session down and build a fresh one. `escalated` is set when a budget ran out.
	Rebuild { escalated: bool },
	FatalStop { reason: String },
}

/// Attempt counter with a ceiling and a backoff schedule.
///
/// `attempts` never exceeds `max_attempts`. Without a ceiling the budget never
/// runs out and the counter saturates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
	attempts: u32,
	max_attempts: Option<u32>,
	backoff: Vec<Duration>,
}

impl RetryBudget {
	pub fn new(max_attempts: Option<u32>, backoff: Vec<Duration>) -> Self {
		Self {
			attempts: 0,
			max_attempts,
			backoff,
		}
	}

	pub fn attempts(&self) -> u32 {
		self.attempts
	}

	pub fn max_attempts(&self) -> Option<u32> {
		self.max_attempts
	}

	pub fn is_exhausted(&self) -> bool {
		self.max_attempts.is_some_and(|max| self.attempts >= max)
	}

	/// Takes one attempt and returns its backoff, or `None` once the ceiling is reached.
	pub fn consume(&mut self) -> Option<Duration> {
		if self.is_exhausted() {
			return None;
		}
		self.attempts = self.attempts.saturating_add(1);
		Some(self.delay_for(self.attempts))
	}

	pub fn reset(&mut self) {
		self.attempts = 0;
	}

	fn delay_for(&self, attempt: u32) -> Duration {
		let Some(last) = self.backoff.len().checked_sub(1) else {
			return Duration::ZERO;
		};
		let idx = (attempt.saturating_sub(1) as usize).min(last);
		self.backoff[idx]
	}
}

/// Serialized budget settings for one kind. `max_attempts: null` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPolicy {
	#[serde(default)]
	pub max_attempts: Option<u32>,
	#[serde(default)]
	pub backoff_secs: Vec<u64>,
}

impl BudgetPolicy {
	fn limited(max: u32, backoff_secs: &[u64]) -> Self {
		Self {
			max_attempts: Some(max),
			backoff_secs: backoff_secs.to_vec(),
		}
	}

	fn unlimited(backoff_secs: &[u64]) -> Self {
		Self {
			max_attempts: None,
			backoff_secs: backoff_secs.to_vec(),
		}
	}

	fn budget(&self) -> RetryBudget {
		RetryBudget::new(self.max_attempts, self.backoff_secs.iter().copied().map(Duration::from_secs).collect())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
	pub element_transient: BudgetPolicy,
	pub stale_reference: BudgetPolicy,
	pub browser_unresponsive: BudgetPolicy,
	pub process_crashed: BudgetPolicy,
	pub network_degraded: BudgetPolicy,
	pub site_lockout: BudgetPolicy,
	pub captcha_rejected: BudgetPolicy,
	pub unclassified: BudgetPolicy,
	/// Consecutive budget escalations tolerated before stopping.
	pub max_escalations: u32,
}

impl Default for RecoveryPolicy {
	fn default() -> Self {
		Self {
			element_transient: BudgetPolicy::limited(5, &[2, 5, 8]),
			stale_reference: BudgetPolicy::limited(3, &[2]),
			browser_unresponsive: BudgetPolicy::limited(3, &[]),
			process_crashed: BudgetPolicy::limited(3, &[]),
			network_degraded: BudgetPolicy::unlimited(&[12]),
			site_lockout: BudgetPolicy::unlimited(&[300]),
			captcha_rejected: BudgetPolicy::limited(5, &[2]),
			unclassified: BudgetPolicy::limited(5, &[5]),
			max_escalations: 3,
		}
	}
}

impl RecoveryPolicy {
	pub fn for_kind(&self, kind: FailureKind) -> &BudgetPolicy {
		match kind {
			FailureKind::ElementTransient => &self.element_transient,
			FailureKind::StaleReference => &self.stale_reference,
			FailureKind::BrowserUnresponsive => &self.browser_unresponsive,
			FailureKind::ProcessCrashed => &self.process_crashed,
			FailureKind::NetworkDegraded => &self.network_degraded,
			FailureKind::SiteLockout => &self.site_lockout,
			FailureKind::CaptchaRejected => &self.captcha_rejected,
			FailureKind::Unclassified => &self.unclassified,
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
	pub kind: FailureKind,
	pub attempts: u32,
	pub max_attempts: Option<u32>,
}

pub struct RecoveryController {
	budgets: [RetryBudget; 8],
	last_triggered: Option<FailureKind>,
	escalations: u32,
	max_escalations: u32,
}

impl RecoveryController {
	pub fn new(policy: &RecoveryPolicy) -> Self {
		Self {
			budgets: FailureKind::ALL.map(|kind| policy.for_kind(kind).budget()),
			last_triggered: None,
			escalations: 0,
			max_escalations: policy.max_escalations,
		}
	}

	pub fn budget(&self, kind: FailureKind) -> &RetryBudget {
		&self.budgets[kind.index()]
	}

	pub fn last_triggered(&self) -> Option<FailureKind> {
		self.last_triggered
	}

	pub fn snapshot(&self) -> Vec<BudgetStatus> {
		FailureKind::ALL
			.iter()
			.map(|&kind| BudgetStatus {
				kind,
				attempts: self.budget(kind).attempts(),
				max_attempts: self.budget(kind).max_attempts(),
			})
			.collect()
	}

	/// Classifies `err` and decides what to do about it.
	pub fn handle(&mut self, err: &WatchError) -> RecoveryOutcome {
		if err.is_fatal() {
			return RecoveryOutcome::FatalStop { reason: err.to_string() };
		}
		let cooldown = match err {
			WatchError::SiteLockout { cooldown, .. } => Some(*cooldown),
			_ => None,
		};
		self.recover(FailureKind::classify(err), cooldown)
	}

	/// Consumes one attempt of `kind`'s budget.
	///
	/// `cooldown` is a wait imposed by the site; the retry waits at least that long
	/// and never less than the kind's own backoff.
	pub fn recover(&mut self, kind: FailureKind, cooldown: Option<Duration>) -> RecoveryOutcome {
		self.last_triggered = Some(kind);
		let budget = &mut self.budgets[kind.index()];

		let Some(backoff) = budget.consume() else {
			let attempts = budget.attempts();
			if kind.rebuilds_session() {
				warn!(target = "slotwatch.recovery", %kind, attempts, "rebuild budget exhausted");
				return RecoveryOutcome::FatalStop {
					reason: format!("{kind} persisted through {attempts} session rebuilds"),
				};
			}

			self.escalations += 1;
			if self.escalations > self.max_escalations {
				warn!(target = "slotwatch.recovery", %kind, escalations = self.escalations, "escalation ceiling exceeded");
				return RecoveryOutcome::FatalStop {
					reason: format!("{} consecutive budget escalations, last from {kind}", self.escalations),
				};
			}
			warn!(target = "slotwatch.recovery", %kind, attempts, "retry budget exhausted, escalating to rebuild");
			return RecoveryOutcome::Rebuild { escalated: true };
		};

		if kind.rebuilds_session() {
			info!(target = "slotwatch.recovery", %kind, attempt = budget.attempts(), "session rebuild required");
			return RecoveryOutcome::Rebuild { escalated: false };
		}

		let wait = cooldown.map_or(backoff, |c| c.max(backoff));
		debug!(target = "slotwatch.recovery", %kind, attempt = budget.attempts(), wait_secs = wait.as_secs(), "retrying");
		RecoveryOutcome::Retry {
			wait,
			action: kind.retry_action(),
		}
	}

	/// Resets the budget of the most recently triggered kind and the escalation streak.
	pub fn record_success(&mut self) {
		if let Some(kind) = self.last_triggered.take() {
			self.budgets[kind.index()].reset();
			debug!(target = "slotwatch.recovery", %kind, "budget reset after success");
		}
		self.escalations = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn controller() -> RecoveryController {
		RecoveryController::new(&RecoveryPolicy::default())
	}

	#[test]
	fn classification_covers_page_errors() {
		let cases = [
			(WatchError::Page(PageError::ElementNotFound("x".into())), FailureKind::ElementTransient),
			(
				WatchError::Page(PageError::Timeout {
					operation: "wait".into(),
					timeout: Duration::from_secs(1),
				}),
				FailureKind::ElementTransient,
			),
			(WatchError::Page(PageError::StaleElement("x".into())), FailureKind::StaleReference),
			(WatchError::Page(PageError::Unresponsive("x".into())), FailureKind::BrowserUnresponsive),
			(WatchError::Page(PageError::Crashed("x".into())), FailureKind::ProcessCrashed),
			(WatchError::Page(PageError::Network("x".into())), FailureKind::NetworkDegraded),
			(WatchError::NetworkDegraded("offline".into()), FailureKind::NetworkDegraded),
			(
				WatchError::SiteLockout {
					reason: "locked".into(),
					cooldown: Duration::from_secs(120),
				},
				FailureKind::SiteLockout,
			),
			(WatchError::CaptchaRejected("bad".into()), FailureKind::CaptchaRejected),
			(WatchError::SiteError("Cloudflare".into()), FailureKind::Unclassified),
			(WatchError::LoginFailed("?".into()), FailureKind::Unclassified),
		];
		for (err, expected) in cases {
			assert_eq!(FailureKind::classify(&err), expected, "{err}");
		}
	}

	#[test]
	fn crash_storm_ends_in_fatal_stop() {
		let mut recovery = controller();
		for _ in 0..3 {
			assert_eq!(
				recovery.recover(FailureKind::ProcessCrashed, None),
				RecoveryOutcome::Rebuild { escalated: false }
			);
		}
		assert!(matches!(
			recovery.recover(FailureKind::ProcessCrashed, None),
			RecoveryOutcome::FatalStop { .. }
		));
		assert_eq!(recovery.budget(FailureKind::ProcessCrashed).attempts(), 3);
	}

	#[test]
	fn counters_never_exceed_ceiling_and_never_retry_after_it() {
		for kind in FailureKind::ALL {
			let mut recovery = controller();
			let Some(max) = recovery.budget(kind).max_attempts() else {
				continue;
			};
			let mut previous = 0;
			for step in 0..(max + 4) {
				let outcome = recovery.recover(kind, None);
				let attempts = recovery.budget(kind).attempts();
				assert!(attempts <= max, "{kind}: {attempts} > {max}");
				assert!(attempts >= previous, "{kind}: counter went backwards");
				previous = attempts;
				if step >= max {
					assert!(!matches!(outcome, RecoveryOutcome::Retry { .. }), "{kind} retried past its ceiling");
				}
			}
		}
	}

	#[test]
	fn failures_only_touch_their_own_budget() {
		let mut recovery = controller();
		recovery.recover(FailureKind::ElementTransient, None);
		recovery.recover(FailureKind::ElementTransient, None);

		for kind in FailureKind::ALL {
			let expected = if kind == FailureKind::ElementTransient { 2 } else { 0 };
			assert_eq!(recovery.budget(kind).attempts(), expected, "{kind}");
		}
	}

	#[test]
	fn success_resets_only_last_triggered_kind() {
		let mut recovery = controller();
		recovery.recover(FailureKind::ElementTransient, None);
		recovery.recover(FailureKind::ElementTransient, None);
		recovery.recover(FailureKind::CaptchaRejected, None);

		recovery.record_success();

		assert_eq!(recovery.budget(FailureKind::CaptchaRejected).attempts(), 0);
		assert_eq!(recovery.budget(FailureKind::ElementTransient).attempts(), 2);
		assert_eq!(recovery.last_triggered(), None);
	}

	#[test]
	fn backoff_follows_schedule_and_holds_last_step() {
		let mut recovery = controller();
		let waits: Vec<_> = (0..4)
			.map(|_| match recovery.recover(FailureKind::ElementTransient, None) {
				RecoveryOutcome::Retry { wait, .. } => wait.as_secs(),
				other => panic!("unexpected {other:?}"),
			})
			.collect();
		assert_eq!(waits, vec![2, 5, 8, 8]);
	}

	#[test]
	fn site_cooldown_is_a_hard_minimum() {
		let mut recovery = controller();
		let lockout = WatchError::SiteLockout {
			reason: "account locked".into(),
			cooldown: Duration::from_secs(120),
		};
		assert_eq!(
			recovery.handle(&lockout),
			RecoveryOutcome::Retry {
				wait: Duration::from_secs(300),
				action: RetryAction::None
			}
		);

		let long = WatchError::SiteLockout {
			reason: "rate limited".into(),
			cooldown: Duration::from_secs(900),
		};
		assert!(matches!(recovery.handle(&long), RecoveryOutcome::Retry { wait, .. } if wait == Duration::from_secs(900)));
	}

	#[test]
	fn retries_carry_their_preparation() {
		let mut recovery = controller();
		assert!(matches!(
			recovery.recover(FailureKind::StaleReference, None),
			RecoveryOutcome::Retry {
				action: RetryAction::RefreshPage,
				..
			}
		));
		assert!(matches!(
			recovery.recover(FailureKind::CaptchaRejected, None),
			RecoveryOutcome::Retry {
				action: RetryAction::DiscardArtifacts,
				..
			}
		));
	}

	#[test]
	fn repeated_escalations_become_fatal() {
		let policy = RecoveryPolicy {
			unclassified: BudgetPolicy::limited(1, &[1]),
			max_escalations: 2,
			..RecoveryPolicy::default()
		};
		let mut recovery = RecoveryController::new(&policy);

		assert!(matches!(recovery.recover(FailureKind::Unclassified, None), RecoveryOutcome::Retry { .. }));
		assert_eq!(
			recovery.recover(FailureKind::Unclassified, None),
			RecoveryOutcome::Rebuild { escalated: true }
		);
		assert_eq!(
			recovery.recover(FailureKind::Unclassified, None),
			RecoveryOutcome::Rebuild { escalated: true }
		);
		assert!(matches!(
			recovery.recover(FailureKind::Unclassified, None),
			RecoveryOutcome::FatalStop { .. }
		));
	}

	#[test]
	fn unlimited_budgets_never_escalate() {
		let mut recovery = controller();
		for _ in 0..50 {
			assert!(matches!(
				recovery.recover(FailureKind::NetworkDegraded, None),
				RecoveryOutcome::Retry { .. }
			));
		}
	}

	#[test]
	fn fatal_errors_skip_classification() {
		let mut recovery = controller();
		let outcome = recovery.handle(&WatchError::Config("no identities".into()));
		assert!(matches!(outcome, RecoveryOutcome::FatalStop { .. }));
		assert_eq!(recovery.last_triggered(), None);
	}
}
