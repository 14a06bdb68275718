use std::fmt::Write;
use std::path::Path;

use slotwatch::Settings;

use super::load_settings;
use crate::chrome::find_chrome_executable;
use crate::error::Result;

pub fn execute(settings_path: &Path) -> Result<()> {
	let settings = load_settings(settings_path)?;
	print!("{}", summary(settings_path, &settings));
	Ok(())
}

pub(crate) fn summary(settings_path: &Path, settings: &Settings) -> String {
	let mut out = String::new();
	let _ = writeln!(out, "Settings OK: {}", settings_path.display());
	let _ = writeln!(out, "Login page: {}", settings.site.login_url);
	let _ = writeln!(out, "Poll interval: {}s", settings.site.poll_interval_secs);
	let _ = writeln!(out, "Identities ({}):", settings.identities.len());
	for identity in &settings.identities {
		let claim = if identity.claim_on_find { ", books on find" } else { "" };
		let _ = writeln!(out, "  {} ({}): {}{claim}", identity.id, identity.display_name(), identity.category);
	}

	let notify = if settings.notify.is_configured() { "Telegram" } else { "log only" };
	let _ = writeln!(out, "Notifications: {notify}");
	let browser = find_chrome_executable(settings.browser.executable.as_deref())
		.map(|path| path.display().to_string())
		.unwrap_or_else(|| "NOT FOUND".to_string());
	let _ = writeln!(out, "Browser: {browser}");
	out
}
