//! Default locations for the settings file, state directory and control socket.

use std::path::{Path, PathBuf};

use slotwatch::Settings;

pub const APP_DIR: &str = "slotwatch";
pub const SETTINGS_FILE: &str = "slotwatch.json";
pub const SOCKET_FILE: &str = "slotwatch.sock";

/// `--config` when given, otherwise `<config dir>/slotwatch/slotwatch.json`.
pub fn settings_path(explicit: Option<&Path>) -> PathBuf {
	match explicit {
		Some(path) => path.to_path_buf(),
		None => dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR).join(SETTINGS_FILE),
	}
}

/// State directory used when the settings leave `paths.state_dir` unset.
pub fn default_state_dir() -> PathBuf {
	dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

pub fn state_dir(settings: &Settings) -> PathBuf {
	settings.paths.state_dir.clone().unwrap_or_else(default_state_dir)
}

pub fn socket_path(state_dir: &Path) -> PathBuf {
	state_dir.join(SOCKET_FILE)
}

/// Browser profile directory; relative settings paths resolve against the state directory.
pub fn user_data_dir(settings: &Settings) -> PathBuf {
	let state_dir = state_dir(settings);
	match &settings.browser.user_data_dir {
		Some(dir) if dir.is_absolute() => dir.clone(),
		Some(dir) => state_dir.join(dir),
		None => state_dir.join("chrome-profile"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn explicit_settings_path_wins() {
		assert_eq!(settings_path(Some(Path::new("/srv/watch.json"))), PathBuf::from("/srv/watch.json"));
		assert!(settings_path(None).ends_with("slotwatch/slotwatch.json"));
	}

	#[test]
	fn relative_profile_dir_is_state_relative() {
		let mut settings = Settings::default();
		settings.paths.state_dir = Some(PathBuf::from("/var/lib/slotwatch"));
		assert_eq!(user_data_dir(&settings), PathBuf::from("/var/lib/slotwatch/chrome-profile"));

		settings.browser.user_data_dir = Some(PathBuf::from("profiles/main"));
		assert_eq!(user_data_dir(&settings), PathBuf::from("/var/lib/slotwatch/profiles/main"));
		assert_eq!(socket_path(&state_dir(&settings)), PathBuf::from("/var/lib/slotwatch/slotwatch.sock"));
	}
}
