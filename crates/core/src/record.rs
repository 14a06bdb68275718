//! Persisted availability records.
//!
//! The record log is an append-only JSON-lines file. Each line is one observed
//! change of a resource's availability marker; an empty marker means "no
//! availability". Replaying the log rebuilds the last marker per resource and the
//! set of markers that were already announced, so a restart never re-notifies.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// One line of the record log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentRecord {
	pub resource: String,
	/// Earliest bookable date as shown by the site, empty for "no availability".
	pub marker: String,
	#[serde(default)]
	pub identity: Option<String>,
	pub observed_at: u64,
}

/// What an observation means relative to what is already on record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
	/// Same as the last record; nothing written.
	Unchanged,
	/// A marker never announced before for this resource. Written; notify.
	New(String),
	/// A marker that was announced earlier and came back. Written; do not notify.
	Returned(String),
	/// Availability disappeared after a bookable marker. Written; notify once.
	BecameUnavailable,
}

#[derive(Debug, Default)]
struct ResourceHistory {
	last: Option<String>,
	announced: HashSet<String>,
}

#[derive(Debug)]
pub struct RecordStore {
	path: Option<PathBuf>,
	resources: HashMap<String, ResourceHistory>,
}

impl RecordStore {
	/// A store that keeps history in memory only.
	pub fn in_memory() -> Self {
		Self {
			path: None,
			resources: HashMap::new(),
		}
	}

	/// Opens (or starts) the record log at `path`, replaying existing lines.
	///
	/// Unparseable lines are skipped with a warning; a torn final line from a crash
	/// must not block startup.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		let mut store = Self {
			path: Some(path.clone()),
			resources: HashMap::new(),
		};

		let file = match File::open(&path) {
			Ok(file) => file,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(store),
			Err(err) => return Err(err.into()),
		};

		for (lineno, line) in BufReader::new(file).lines().enumerate() {
			let line = line?;
			if line.trim().is_empty() {
				continue;
			}
			match serde_json::from_str::<AppointmentRecord>(&line) {
				Ok(record) => store.apply(&record),
				Err(err) => warn!(target = "slotwatch.record", path = %path.display(), line = lineno + 1, error = %err, "skipping bad record line"),
			}
		}
		debug!(target = "slotwatch.record", path = %path.display(), resources = store.resources.len(), "record log loaded");
		Ok(store)
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	/// Last recorded marker for `resource`; `Some("")` means "no availability".
	pub fn last_marker(&self, resource: &str) -> Option<&str> {
		self.resources.get(resource).and_then(|h| h.last.as_deref())
	}

	/// Compares `marker` against the record for `resource` and persists any change
	/// before returning, so the caller may notify only after the write is durable.
	///
	/// `marker` is trimmed; an empty marker means "no availability".
	pub fn observe(&mut self, resource: &str, marker: &str, identity: Option<&str>) -> Result<Change> {
		let marker = marker.trim();
		let history = self.resources.get(resource);
		let last = history.and_then(|h| h.last.clone());
		let announced = history.is_some_and(|h| h.announced.contains(marker));

		let change = if last.as_deref() == Some(marker) {
			Change::Unchanged
		} else if marker.is_empty() {
			if last.is_none() {
				// nothing was ever bookable, record silently
				self.append(resource, marker, identity)?;
				return Ok(Change::Unchanged);
			}
			Change::BecameUnavailable
		} else if announced {
			Change::Returned(marker.to_string())
		} else {
			Change::New(marker.to_string())
		};

		if change != Change::Unchanged {
			self.append(resource, marker, identity)?;
		}
		Ok(change)
	}

	fn append(&mut self, resource: &str, marker: &str, identity: Option<&str>) -> Result<()> {
		let record = AppointmentRecord {
			resource: resource.to_string(),
			marker: marker.to_string(),
			identity: identity.map(str::to_string),
			observed_at: now_ts(),
		};

		if let Some(path) = &self.path {
			if let Some(parent) = path.parent() {
				fs::create_dir_all(parent)?;
			}
			let mut file = OpenOptions::new().create(true).append(true).open(path)?;
			let mut line = serde_json::to_string(&record)?;
			line.push('\n');
			file.write_all(line.as_bytes())?;
			file.sync_data()?;
		}

		self.apply(&record);
		Ok(())
	}

	fn apply(&mut self, record: &AppointmentRecord) {
		let history = self.resources.entry(record.resource.clone()).or_default();
		if !record.marker.is_empty() {
			history.announced.insert(record.marker.clone());
		}
		history.last = Some(record.marker.clone());
	}
}

fn now_ts() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}
