//! Stale temp-file sweeping for capture artifacts (CAPTCHA crops, debug dumps).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use glob::Pattern;
use tracing::debug;

use crate::error::Result;

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
	pub removed: Vec<PathBuf>,
	pub failed: usize,
}

/// Compiled file-name patterns plus the minimum age a file must reach before removal.
#[derive(Debug, Clone)]
pub struct SweepRule {
	patterns: Vec<Pattern>,
	max_age: Duration,
}

impl SweepRule {
	pub fn new<S: AsRef<str>>(patterns: &[S], max_age: Duration) -> Result<Self> {
		let patterns = patterns.iter().map(|p| Pattern::new(p.as_ref())).collect::<Result<Vec<_>, _>>()?;
		Ok(Self { patterns, max_age })
	}

	pub fn matches(&self, file_name: &str) -> bool {
		self.patterns.iter().any(|p| p.matches(file_name))
	}

	/// Removes matching regular files directly inside `dir` whose mtime is older than the rule's age.
	///
	/// A missing directory is an empty sweep. Per-file failures are counted, not returned.
	pub fn sweep(&self, dir: &Path, now: SystemTime) -> Result<SweepReport> {
		let mut report = SweepReport::default();
		let entries = match fs::read_dir(dir) {
			Ok(entries) => entries,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(report),
			Err(err) => return Err(err.into()),
		};

		for entry in entries.flatten() {
			let path = entry.path();
			let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
				continue;
			};
			if !self.matches(name) {
				continue;
			}
			let Ok(meta) = entry.metadata() else {
				report.failed += 1;
				continue;
			};
			if !meta.is_file() {
				continue;
			}
			let age = meta.modified().ok().and_then(|m| now.duration_since(m).ok()).unwrap_or_default();
			if age < self.max_age {
				continue;
			}
			match fs::remove_file(&path) {
				Ok(()) => report.removed.push(path),
				Err(err) => {
					debug!(target = "slotwatch.sweep", path = %path.display(), error = %err, "failed to remove stale file");
					report.failed += 1;
				}
			}
		}

		Ok(report)
	}
}
