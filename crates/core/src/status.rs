//! Check counters and the status reports built from them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::identity::IdentityId;
use crate::recovery::BudgetStatus;
use crate::session::SessionState;

/// Poll counters shared between the watcher and status readers.
#[derive(Debug, Default)]
pub struct WatchCounters {
	checks: AtomicU64,
	per_identity: Mutex<BTreeMap<IdentityId, u64>>,
}

impl WatchCounters {
	pub fn record_check(&self, identity: &IdentityId) {
		self.checks.fetch_add(1, Ordering::Relaxed);
		*self.per_identity.lock().entry(identity.clone()).or_insert(0) += 1;
	}

	pub fn checks(&self) -> u64 {
		self.checks.load(Ordering::Relaxed)
	}

	pub fn per_identity(&self) -> BTreeMap<IdentityId, u64> {
		self.per_identity.lock().clone()
	}
}

/// Point-in-time view of a running (or finished) watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
	pub running: bool,
	pub session: SessionState,
	pub checks: u64,
	pub per_identity: BTreeMap<IdentityId, u64>,
	pub cycles: u64,
	pub current_identity: Option<IdentityId>,
	pub last_error: Option<String>,
	pub uptime_secs: u64,
	pub poll_interval_secs: u64,
	/// Unix time of the last periodic status report.
	pub last_report_at: Option<u64>,
	#[serde(default)]
	pub budgets: Vec<BudgetLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLine {
	pub kind: String,
	pub attempts: u32,
	pub max_attempts: Option<u32>,
}

impl From<&BudgetStatus> for BudgetLine {
	fn from(status: &BudgetStatus) -> Self {
		Self {
			kind: status.kind.name().to_string(),
			attempts: status.attempts,
			max_attempts: status.max_attempts,
		}
	}
}

impl StatusSnapshot {
	/// Plain-text report for the periodic operator message.
	pub fn report(&self) -> String {
		let mut lines = vec![
			format!("Watcher {}", if self.running { "running" } else { "stopped" }),
			format!("Uptime: {}", format_uptime(Duration::from_secs(self.uptime_secs))),
			format!("Browser session: {}", self.session),
			format!("Checks: {} in {} completed cycles", self.checks, self.cycles),
			format!("Poll interval: {}s", self.poll_interval_secs),
		];
		if let Some(current) = &self.current_identity {
			lines.push(format!("Current identity: {current}"));
		}
		for (identity, count) in &self.per_identity {
			lines.push(format!("  {identity}: {count}"));
		}
		let busy: Vec<_> = self.budgets.iter().filter(|b| b.attempts > 0).collect();
		for budget in busy {
			let max = budget.max_attempts.map_or_else(|| "unlimited".to_string(), |m| m.to_string());
			lines.push(format!("Retries {}: {}/{}", budget.kind, budget.attempts, max));
		}
		if let Some(err) = &self.last_error {
			lines.push(format!("Last error: {err}"));
		}
		lines.join("\n")
	}
}

pub(crate) fn cycle_report(cycle: u64, counts: &BTreeMap<IdentityId, u64>) -> String {
	let mut report = format!("Rotation cycle {cycle} complete.");
	for (identity, count) in counts {
		report.push_str(&format!("\n  {identity}: {count} checks"));
	}
	report
}

pub(crate) fn format_uptime(uptime: Duration) -> String {
	let secs = uptime.as_secs();
	let (hours, minutes) = (secs / 3600, (secs % 3600) / 60);
	if hours > 0 { format!("{hours}h {minutes}m") } else { format!("{minutes}m {}s", secs % 60) }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_track_totals_and_identities() {
		let counters = WatchCounters::default();
		let a = IdentityId("a".into());
		let b = IdentityId("b".into());
		counters.record_check(&a);
		counters.record_check(&a);
		counters.record_check(&b);

		assert_eq!(counters.checks(), 3);
		assert_eq!(counters.per_identity().get(&a), Some(&2));
		assert_eq!(counters.per_identity().get(&b), Some(&1));
	}

	#[test]
	fn report_lists_only_busy_budgets() {
		let snapshot = StatusSnapshot {
			running: true,
			session: SessionState::Ready,
			checks: 7,
			per_identity: BTreeMap::from([(IdentityId("alice".into()), 7)]),
			cycles: 2,
			current_identity: Some(IdentityId("alice".into())),
			last_error: Some("captcha rejected: nope".into()),
			uptime_secs: 3720,
			poll_interval_secs: 60,
			last_report_at: None,
			budgets: vec![
				BudgetLine {
					kind: "captcha_rejected".into(),
					attempts: 2,
					max_attempts: Some(5),
				},
				BudgetLine {
					kind: "site_lockout".into(),
					attempts: 0,
					max_attempts: None,
				},
			],
		};
		let report = snapshot.report();
		assert!(report.contains("Uptime: 1h 2m"));
		assert!(report.contains("alice: 7"));
		assert!(report.contains("Poll interval: 60s"));
		assert!(report.contains("Retries captcha_rejected: 2/5"));
		assert!(!report.contains("site_lockout"));
		assert!(report.contains("Last error: captcha rejected: nope"));
	}

	#[test]
	fn cycle_report_names_every_identity() {
		let counts = BTreeMap::from([(IdentityId("a".into()), 3), (IdentityId("b".into()), 1)]);
		let report = cycle_report(4, &counts);
		assert!(report.starts_with("Rotation cycle 4 complete."));
		assert!(report.contains("a: 3 checks"));
		assert!(report.contains("b: 1 checks"));
	}
}
