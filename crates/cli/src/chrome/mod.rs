//! Local Chrome driven over the DevTools protocol.

mod finder;
mod launcher;
mod page;
mod probe;
mod selectors;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slotwatch::config::BrowserSettings;
use slotwatch::{BrowserFactory, PageDriver, PageError, Settings};
use slotwatch_runtime::cdp::CdpConnection;
use slotwatch_runtime::process;
use tracing::{debug, info, warn};

pub use finder::find_chrome_executable;
pub use page::CdpPage;
pub use selectors::SelectorCatalog;

use crate::paths;

/// Profile subdirectories dropped during cleanup; cookies and logins stay.
const CACHE_DIRS: &[&[&str]] = &[&["Default", "Cache"], &["Default", "Code Cache"], &["Default", "GPUCache"], &["ShaderCache"]];

/// Launches one Chrome per session on the configured debugging port.
pub struct ChromeFactory {
	browser: BrowserSettings,
	user_data_dir: PathBuf,
	selectors: Arc<SelectorCatalog>,
}

impl ChromeFactory {
	pub fn new(settings: &Settings) -> Self {
		Self {
			browser: settings.browser.clone(),
			user_data_dir: paths::user_data_dir(settings),
			selectors: Arc::new(SelectorCatalog::new(&settings.selectors)),
		}
	}

	fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.browser.request_timeout_secs.max(1))
	}
}

#[async_trait]
impl BrowserFactory for ChromeFactory {
	async fn launch(&self) -> Result<Box<dyn PageDriver>, PageError> {
		let port = self.browser.debug_port;
		if !process::port_available(port) {
			return Err(PageError::Unresponsive(format!("debugging port {port} is still in use")));
		}
		let executable = find_chrome_executable(self.browser.executable.as_deref())
			.ok_or_else(|| PageError::Crashed("no Chrome or Chromium executable found".to_string()))?;

		let (child, version) = launcher::launch_chrome(&executable, port, &self.user_data_dir, self.browser.headless)
			.await
			.map_err(|e| PageError::Crashed(e.to_string()))?;
		let target = probe::page_target(port).await.map_err(|e| PageError::Unresponsive(e.to_string()))?;
		let conn = CdpConnection::connect(&target, self.request_timeout()).await.map_err(page::page_error)?;

		info!(
			target = "slotwatch.chrome",
			pid = child.id(),
			port,
			browser = version.browser.as_deref().unwrap_or("unknown"),
			"browser ready"
		);
		Ok(Box::new(CdpPage::attach(conn, port, version.web_socket_debugger_url, Some(child), self.selectors.clone())))
	}

	async fn cleanup(&self) {
		let port = self.browser.debug_port;
		let lingering = self.browser.lingering_processes.clone();
		let profile = self.user_data_dir.clone();

		let swept = tokio::task::spawn_blocking(move || {
			let killed = process::kill_port_owners(port);
			let names: Vec<&str> = lingering.iter().map(String::as_str).collect();
			let matched = process::kill_by_name(&names);
			for parts in CACHE_DIRS {
				let dir = parts.iter().fold(profile.clone(), |dir, part| dir.join(part));
				if dir.exists() {
					if let Err(err) = std::fs::remove_dir_all(&dir) {
						debug!(target = "slotwatch.chrome", dir = %dir.display(), error = %err, "cache removal failed");
					}
				}
			}
			(killed.len(), matched)
		})
		.await;

		match swept {
			Ok((killed, matched)) => debug!(target = "slotwatch.chrome", port, killed, matched, "browser cleanup done"),
			Err(err) => warn!(target = "slotwatch.chrome", error = %err, "browser cleanup task failed"),
		}
	}
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	#[tokio::test]
	async fn cleanup_drops_caches_but_keeps_the_profile() {
		let temp = TempDir::new().unwrap();
		let mut settings = Settings::default();
		settings.paths.state_dir = Some(temp.path().to_path_buf());
		settings.browser.lingering_processes = Vec::new();
		settings.browser.debug_port = 1;
		let factory = ChromeFactory::new(&settings);

		let profile = temp.path().join("chrome-profile");
		std::fs::create_dir_all(profile.join("Default").join("Cache")).unwrap();
		std::fs::write(profile.join("Default").join("Cookies"), "c").unwrap();

		factory.cleanup().await;

		assert!(!profile.join("Default").join("Cache").exists());
		assert!(profile.join("Default").join("Cookies").exists());
	}

	#[tokio::test]
	async fn missing_executable_fails_the_launch() {
		let temp = TempDir::new().unwrap();
		let mut settings = Settings::default();
		settings.paths.state_dir = Some(temp.path().to_path_buf());
		settings.browser.executable = Some(temp.path().join("no-such-chrome").display().to_string());
		settings.browser.debug_port = 0;
		let factory = ChromeFactory::new(&settings);

		let err = factory.launch().await.err().expect("launch must fail");

		assert!(matches!(err, PageError::Crashed(ref m) if m.contains("executable")), "got {err:?}");
	}
}
