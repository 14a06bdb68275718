//! Browser process launch.

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::debug;

use super::probe::{CdpVersionInfo, fetch_cdp_endpoint};
use crate::error::{CliError, Result};

const ENDPOINT_POLL: Duration = Duration::from_millis(200);
const ENDPOINT_ATTEMPTS: u32 = 25;

pub(crate) fn launch_args(port: u16, user_data_dir: &Path, headless: bool) -> Vec<String> {
	let mut args = vec![
		format!("--remote-debugging-port={port}"),
		format!("--user-data-dir={}", user_data_dir.display()),
		"--no-first-run".to_string(),
		"--no-default-browser-check".to_string(),
		"--disable-blink-features=AutomationControlled".to_string(),
		"--window-size=1280,960".to_string(),
	];
	if headless {
		args.push("--headless=new".to_string());
	}
	args.push("about:blank".to_string());
	args
}

/// Starts the browser and waits for its debugging endpoint.
///
/// The child is killed again when the endpoint never shows up.
pub async fn launch_chrome(executable: &Path, port: u16, user_data_dir: &Path, headless: bool) -> Result<(Child, CdpVersionInfo)> {
	std::fs::create_dir_all(user_data_dir)?;

	let mut cmd = Command::new(executable);
	cmd.args(launch_args(port, user_data_dir, headless))
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null());

	#[cfg(unix)]
	std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

	let mut child = cmd
		.spawn()
		.map_err(|e| CliError::Context(format!("Failed to launch Chrome at {}: {e}", executable.display())))?;
	debug!(target = "slotwatch.chrome", pid = child.id(), port, "browser spawned");

	let mut last_error = "endpoint not reachable".to_string();
	for _ in 0..ENDPOINT_ATTEMPTS {
		tokio::time::sleep(ENDPOINT_POLL).await;

		if let Ok(Some(status)) = child.try_wait() {
			return Err(CliError::Context(format!(
				"Chrome exited before its debugging endpoint became available (status: {status})"
			)));
		}

		match fetch_cdp_endpoint(port).await {
			Ok(info) => return Ok((child, info)),
			Err(e) => last_error = e.to_string(),
		}
	}

	let _ = child.kill();
	let _ = child.wait();
	Err(CliError::Context(format!(
		"Chrome launched but its debugging endpoint is not available on port {port}: {last_error}"
	)))
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;

	#[test]
	fn headless_flag_is_opt_in() {
		let dir = PathBuf::from("/tmp/profile");
		let windowed = launch_args(9333, &dir, false);
		assert!(windowed.contains(&"--remote-debugging-port=9333".to_string()));
		assert!(windowed.contains(&"--user-data-dir=/tmp/profile".to_string()));
		assert!(!windowed.iter().any(|a| a.starts_with("--headless")));
		assert_eq!(windowed.last().map(String::as_str), Some("about:blank"));

		assert!(launch_args(9333, &dir, true).contains(&"--headless=new".to_string()));
	}
}
