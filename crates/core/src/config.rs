//! Settings file model, validation and key-wise updates.
//!
//! The settings file is one JSON document split into sections. Everything except
//! the site credentials and the identity list has a default, so a minimal file
//! only names the login URL, the account and the identities.
//!
//! [`Settings::update`] backs the `updateConfig` command: it edits one existing
//! key, re-validates the whole document and only then replaces the file.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, WatchError};
use crate::identity::Identity;
use crate::recovery::RecoveryPolicy;
use crate::session::SessionOptions;

/// Keys that can never be changed through [`Settings::update`].
const IMMUTABLE_KEYS: &[(&str, &str)] = &[("notify", "bot_token")];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
	pub login_url: String,
	pub email: String,
	pub password: String,
	pub poll_interval_secs: u64,
	/// Successful polls per identity turn; `null` watches until a failure.
	pub polls_per_turn: Option<u32>,
	pub captcha_enabled: bool,
	pub element_wait_secs: u64,
	/// Pause between submitting the login form and reading the response.
	pub settle_secs: u64,
	pub notify_unavailable: bool,
}

impl Default for SiteSettings {
	fn default() -> Self {
		Self {
			login_url: String::new(),
			email: String::new(),
			password: String::new(),
			poll_interval_secs: 60,
			polls_per_turn: None,
			captcha_enabled: true,
			element_wait_secs: 15,
			settle_secs: 3,
			notify_unavailable: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
	pub bot_token: String,
	pub chat_id: String,
	pub api_base: String,
	/// How long to wait for an operator's `/captcha` reply when OCR fails; 0 disables the relay.
	pub captcha_reply_secs: u64,
}

impl Default for NotifySettings {
	fn default() -> Self {
		Self {
			bot_token: String::new(),
			chat_id: String::new(),
			api_base: "https://api.telegram.org".to_string(),
			captcha_reply_secs: 120,
		}
	}
}

impl NotifySettings {
	pub fn is_configured(&self) -> bool {
		!self.bot_token.trim().is_empty() && !self.chat_id.trim().is_empty()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
	pub executable: Option<String>,
	pub headless: bool,
	pub debug_port: u16,
	pub user_data_dir: Option<PathBuf>,
	pub start_attempts: u32,
	pub start_backoff_secs: u64,
	pub navigation_timeout_secs: u64,
	pub health_timeout_secs: u64,
	pub request_timeout_secs: u64,
	pub fatal_signatures: Vec<String>,
	/// Process names killed during cleanup.
	pub lingering_processes: Vec<String>,
}

impl Default for BrowserSettings {
	fn default() -> Self {
		Self {
			executable: None,
			headless: false,
			debug_port: 9333,
			user_data_dir: None,
			start_attempts: 5,
			start_backoff_secs: 2,
			navigation_timeout_secs: 30,
			health_timeout_secs: 10,
			request_timeout_secs: 15,
			fatal_signatures: SessionOptions::default().fatal_signatures,
			lingering_processes: vec!["chromedriver".to_string(), "chrome-headless-shell".to_string()],
		}
	}
}

impl BrowserSettings {
	pub fn session_options(&self) -> SessionOptions {
		SessionOptions {
			start_attempts: self.start_attempts,
			start_backoff: Duration::from_secs(self.start_backoff_secs),
			navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
			health_timeout: Duration::from_secs(self.health_timeout_secs),
			close_timeout: Duration::from_secs(self.health_timeout_secs),
			fatal_signatures: self.fatal_signatures.clone(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
	pub status_report_secs: u64,
	pub cleanup_secs: u64,
	pub artifact_max_age_secs: u64,
	pub artifact_patterns: Vec<String>,
}

impl Default for TimerSettings {
	fn default() -> Self {
		Self {
			status_report_secs: 1200,
			cleanup_secs: 1800,
			artifact_max_age_secs: 3600,
			artifact_patterns: ["captcha_*.png", "debug_*.png", "debug_*.html", "*.tmp"].map(String::from).to_vec(),
		}
	}
}

/// Case-insensitive page-text markers used to interpret the site's responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSettings {
	pub login_success: Vec<String>,
	pub account_locked: Vec<String>,
	pub captcha_invalid: Vec<String>,
	pub rate_limited: Vec<String>,
	pub queue: Vec<String>,
	pub site_error: Vec<String>,
	pub offline: Vec<String>,
	pub lockout_cooldown_secs: u64,
	pub rate_limit_cooldown_secs: u64,
}

fn strings(items: &[&str]) -> Vec<String> {
	items.iter().map(|s| s.to_string()).collect()
}

impl Default for MarkerSettings {
	fn default() -> Self {
		Self {
			login_success: strings(&["logout", "sign out", "start new booking"]),
			account_locked: strings(&["account has been locked"]),
			captcha_invalid: strings(&["verification words are incorrect", "invalid captcha"]),
			rate_limited: strings(&["rate limited", "too many requests", "too many attempts"]),
			queue: strings(&["you are now in line", "waiting room"]),
			site_error: strings(&[
				"server error in",
				"sorry, looks like you were going too fast",
				"session expired",
				"sorry, something has gone",
				"attention required! | cloudflare",
			]),
			offline: strings(&["you are offline", "err_internet_disconnected"]),
			lockout_cooldown_secs: 120,
			rate_limit_cooldown_secs: 300,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
	pub state_dir: Option<PathBuf>,
	pub artifacts_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
	pub auto_start: bool,
	/// Loopback port for the control channel where unix sockets are unavailable.
	pub port: u16,
}

impl Default for ControlSettings {
	fn default() -> Self {
		Self { auto_start: true, port: 47831 }
	}
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
	#[serde(default)]
	pub site: SiteSettings,
	#[serde(default)]
	pub notify: NotifySettings,
	#[serde(default)]
	pub browser: BrowserSettings,
	#[serde(default)]
	pub recovery: RecoveryPolicy,
	#[serde(default)]
	pub timers: TimerSettings,
	#[serde(default)]
	pub paths: PathSettings,
	#[serde(default)]
	pub control: ControlSettings,
	#[serde(default)]
	pub markers: MarkerSettings,
	/// Extra or replacement selectors per element key.
	#[serde(default)]
	pub selectors: BTreeMap<String, Vec<String>>,
	#[serde(default)]
	pub identities: Vec<Identity>,
}

/// Result of a successful [`Settings::update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
	pub section: String,
	pub key: String,
	pub value: Value,
	/// Whether a running watcher picks the change up without a restart.
	pub live: bool,
}

impl Settings {
	pub fn load(path: &Path) -> Result<Self> {
		let content = fs::read_to_string(path).map_err(|e| WatchError::Config(format!("cannot read {}: {e}", path.display())))?;
		let settings: Settings =
			serde_json::from_str(&content).map_err(|e| WatchError::Config(format!("invalid settings in {}: {e}", path.display())))?;
		settings.validate()?;
		debug!(target = "slotwatch.config", path = %path.display(), identities = settings.identities.len(), "settings loaded");
		Ok(settings)
	}

	/// Writes the settings atomically (temp file in the same directory, then rename).
	pub fn save(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent)?;
		}
		let tmp = path.with_extension("json.tmp");
		fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
		fs::rename(&tmp, path)?;
		Ok(())
	}

	pub fn validate(&self) -> Result<()> {
		let site = &self.site;
		if !(site.login_url.starts_with("http://") || site.login_url.starts_with("https://")) {
			return Err(WatchError::Config("site.login_url must be an http(s) URL".to_string()));
		}
		if site.email.trim().is_empty() || site.password.is_empty() {
			return Err(WatchError::Config("site.email and site.password are required".to_string()));
		}
		if site.poll_interval_secs == 0 {
			return Err(WatchError::Config("site.poll_interval_secs must be positive".to_string()));
		}
		if site.polls_per_turn == Some(0) {
			return Err(WatchError::Config("site.polls_per_turn must be positive or null".to_string()));
		}
		if self.browser.start_attempts == 0 {
			return Err(WatchError::Config("browser.start_attempts must be positive".to_string()));
		}
		if self.identities.is_empty() {
			return Err(WatchError::Config("at least one identity is required".to_string()));
		}

		let mut seen = HashSet::new();
		for identity in &self.identities {
			if identity.id.0.trim().is_empty() {
				return Err(WatchError::Config("identity id must not be empty".to_string()));
			}
			if !seen.insert(&identity.id) {
				return Err(WatchError::Config(format!("duplicate identity id {}", identity.id)));
			}
			if identity.category.trim().is_empty() {
				return Err(WatchError::Config(format!("identity {} has no category", identity.id)));
			}
		}
		Ok(())
	}

	/// Sets `section.key` to `raw`, validates the result and persists it to `path`.
	///
	/// `raw` is parsed as JSON when possible (`30`, `true`, `null`, `["a"]`) and
	/// taken as a plain string otherwise. Only keys that already exist can be set.
	pub fn update(&mut self, path: &Path, section: &str, key: &str, raw: &str) -> Result<ConfigUpdate> {
		let section = section.trim().to_lowercase();
		let key = key.trim().to_lowercase();

		if IMMUTABLE_KEYS.iter().any(|(s, k)| *s == section && *k == key) {
			return Err(WatchError::Config(format!("{section}.{key} cannot be changed at runtime")));
		}
		if section == "identities" {
			return Err(WatchError::Config("identities cannot be edited key-wise; edit the settings file".to_string()));
		}

		let mut document = serde_json::to_value(&*self)?;
		let Some(section_value) = document.get_mut(&section).and_then(Value::as_object_mut) else {
			return Err(WatchError::Config(format!("unknown settings section {section}")));
		};
		if section != "selectors" && !section_value.contains_key(&key) {
			return Err(WatchError::Config(format!("unknown key {key} in section {section}")));
		}

		// string-typed keys take the raw text verbatim, so "-100200300" stays a chat id
		let value = match section_value.get(&key) {
			Some(Value::String(_)) => Value::String(raw.to_string()),
			_ => serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
		};
		section_value.insert(key.clone(), value.clone());

		let updated: Settings =
			serde_json::from_value(document).map_err(|e| WatchError::Config(format!("invalid value for {section}.{key}: {e}")))?;
		updated.validate()?;
		updated.save(path)?;
		*self = updated;

		let live = matches!(section.as_str(), "site" | "markers" | "timers");
		debug!(target = "slotwatch.config", %section, %key, live, "settings updated");
		Ok(ConfigUpdate { section, key, value, live })
	}
}

/// Immutable runtime view of the settings handed to the orchestrator.
///
/// Replaced wholesale on every accepted update; readers hold an `Arc` to the
/// version they started with.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
	pub site: SiteSettings,
	pub browser: BrowserSettings,
	pub recovery: RecoveryPolicy,
	pub timers: TimerSettings,
	pub markers: MarkerSettings,
	pub state_dir: PathBuf,
	pub artifacts_dir: Option<PathBuf>,
}

impl OrchestratorConfig {
	/// `default_state_dir` is used when the settings leave `paths.state_dir` unset.
	pub fn from_settings(settings: &Settings, default_state_dir: &Path) -> Self {
		let state_dir = settings.paths.state_dir.clone().unwrap_or_else(|| default_state_dir.to_path_buf());
		let artifacts_dir = Some(settings.paths.artifacts_dir.clone().unwrap_or_else(|| state_dir.join("artifacts")));
		Self {
			site: settings.site.clone(),
			browser: settings.browser.clone(),
			recovery: settings.recovery.clone(),
			timers: settings.timers.clone(),
			markers: settings.markers.clone(),
			state_dir,
			artifacts_dir,
		}
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.site.poll_interval_secs)
	}

	pub fn element_wait(&self) -> Duration {
		Duration::from_secs(self.site.element_wait_secs)
	}

	pub fn records_path(&self) -> PathBuf {
		self.state_dir.join("records.jsonl")
	}
}
