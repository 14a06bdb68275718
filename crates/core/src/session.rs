//! Browser session lifecycle.
//!
//! ```text
//! Uninitialized -> Initializing -> Ready <-> Degraded
//!        any state ------------------------> Dead
//! ```
//!
//! Only [`Session::start`] and [`Session::recover`] move a session to `Ready`,
//! only [`Session::health_check`] moves it from `Ready` to `Degraded`, and `Dead`
//! is terminal: a rebuild constructs a new `Session`. Teardown is shared through
//! [`SessionTerminator`] so a stop request can tear down a session that the
//! polling loop is still using.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{PageError, Result, WatchError};
use crate::page::{BrowserFactory, PageDriver, PageState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
	Uninitialized,
	Initializing,
	Ready,
	Degraded,
	Dead,
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			SessionState::Uninitialized => "uninitialized",
			SessionState::Initializing => "initializing",
			SessionState::Ready => "ready",
			SessionState::Degraded => "degraded",
			SessionState::Dead => "dead",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
	/// Launch attempts before `start` gives up.
	pub start_attempts: u32,
	/// Wait after failed attempt `n` is `start_backoff * n`.
	pub start_backoff: Duration,
	pub navigation_timeout: Duration,
	pub health_timeout: Duration,
	pub close_timeout: Duration,
	/// Page text that marks a browser-level error page.
	pub fatal_signatures: Vec<String>,
}

impl Default for SessionOptions {
	fn default() -> Self {
		Self {
			start_attempts: 5,
			start_backoff: Duration::from_secs(2),
			navigation_timeout: Duration::from_secs(30),
			health_timeout: Duration::from_secs(10),
			close_timeout: Duration::from_secs(10),
			fatal_signatures: vec!["aw, snap".to_string(), "this page isn't working".to_string()],
		}
	}
}

struct Shared {
	factory: Arc<dyn BrowserFactory>,
	driver: Mutex<Option<Arc<dyn PageDriver>>>,
	state: Mutex<SessionState>,
	/// Flips once the session reaches `Dead`.
	died: watch::Sender<bool>,
	close_timeout: Duration,
}

impl Shared {
	fn state(&self) -> SessionState {
		*self.state.lock()
	}

	fn kill(&self) {
		*self.state.lock() = SessionState::Dead;
		self.died.send_replace(true);
	}

	/// Sleeps for `duration`, returning early once the session dies.
	async fn pause(&self, duration: Duration) {
		let mut died = self.died.subscribe();
		tokio::select! {
			_ = tokio::time::sleep(duration) => {}
			_ = died.wait_for(|dead| *dead) => {}
		}
	}

	/// Moves to `next` unless the session died in the meantime.
	fn transition(&self, next: SessionState) -> bool {
		let mut state = self.state.lock();
		if *state == SessionState::Dead {
			return false;
		}
		if *state != next {
			debug!(target = "slotwatch.session", from = %*state, to = %next, "state change");
			*state = next;
		}
		true
	}

	async fn teardown(&self) -> bool {
		let driver = {
			let mut state = self.state.lock();
			if *state == SessionState::Dead {
				return false;
			}
			*state = SessionState::Dead;
			self.driver.lock().take()
		};
		self.died.send_replace(true);

		if let Some(driver) = driver {
			match tokio::time::timeout(self.close_timeout, driver.close()).await {
				Ok(Ok(())) => debug!(target = "slotwatch.session", "browser closed"),
				Ok(Err(err)) => debug!(target = "slotwatch.session", error = %err, "graceful close failed"),
				Err(_) => warn!(target = "slotwatch.session", "graceful close timed out"),
			}
		}
		self.factory.cleanup().await;
		info!(target = "slotwatch.session", "session torn down");
		true
	}
}

/// Handle that can tear a session down from another task.
#[derive(Clone)]
pub struct SessionTerminator {
	shared: Arc<Shared>,
}

impl SessionTerminator {
	/// See [`Session::teardown`].
	pub async fn teardown(&self) -> bool {
		self.shared.teardown().await
	}

	pub fn state(&self) -> SessionState {
		self.shared.state()
	}
}

pub struct Session {
	shared: Arc<Shared>,
	options: SessionOptions,
}

impl Session {
	pub fn new(factory: Arc<dyn BrowserFactory>, options: SessionOptions) -> Self {
		let shared = Arc::new(Shared {
			factory,
			driver: Mutex::new(None),
			state: Mutex::new(SessionState::Uninitialized),
			died: watch::Sender::new(false),
			close_timeout: options.close_timeout,
		});
		Self { shared, options }
	}

	pub fn state(&self) -> SessionState {
		self.shared.state()
	}

	pub fn terminator(&self) -> SessionTerminator {
		SessionTerminator {
			shared: Arc::clone(&self.shared),
		}
	}

	/// Launches the browser, retrying with increasing backoff and cleaning up after
	/// every failed attempt. Exhausting the attempts is fatal and kills the session.
	pub async fn start(&mut self) -> Result<()> {
		let state = self.state();
		if state != SessionState::Uninitialized {
			return Err(WatchError::SessionNotReady(state));
		}
		self.shared.transition(SessionState::Initializing);

		let attempts = self.options.start_attempts.max(1);
		let mut last_error = String::new();
		self.shared.factory.cleanup().await;

		for attempt in 1..=attempts {
			if self.state() == SessionState::Dead {
				return Err(WatchError::Stopped);
			}
			info!(target = "slotwatch.session", attempt, attempts, "starting browser");
			match self.launch_once().await {
				Ok(driver) => {
					*self.shared.driver.lock() = Some(Arc::clone(&driver));
					if !self.shared.transition(SessionState::Ready) {
						// torn down while starting
						self.shared.driver.lock().take();
						let _ = driver.close().await;
						return Err(WatchError::Stopped);
					}
					info!(target = "slotwatch.session", attempt, "browser ready");
					return Ok(());
				}
				Err(err) => {
					warn!(target = "slotwatch.session", attempt, error = %err, "browser start failed");
					last_error = err.to_string();
					self.shared.factory.cleanup().await;
					if self.state() == SessionState::Dead {
						return Err(WatchError::Stopped);
					}
					if attempt < attempts {
						self.shared.pause(self.options.start_backoff * attempt).await;
					}
				}
			}
		}

		self.shared.kill();
		Err(WatchError::Fatal(format!("browser failed to start after {attempts} attempts: {last_error}")))
	}

	async fn launch_once(&self) -> Result<Arc<dyn PageDriver>, PageError> {
		let driver: Arc<dyn PageDriver> = Arc::from(self.shared.factory.launch().await?);

		let verified = async {
			driver.open("about:blank", self.options.navigation_timeout).await?;
			if probe(driver.as_ref(), &self.options.fatal_signatures).await {
				Ok(())
			} else {
				Err(PageError::Unresponsive("fresh browser failed its health probe".to_string()))
			}
		};
		match tokio::time::timeout(self.options.navigation_timeout + self.options.health_timeout, verified).await {
			Ok(Ok(())) => Ok(driver),
			Ok(Err(err)) => {
				let _ = driver.close().await;
				Err(err)
			}
			Err(_) => {
				let _ = driver.close().await;
				Err(PageError::Unresponsive("browser did not settle after launch".to_string()))
			}
		}
	}

	/// Probes the browser. A failed probe moves a `Ready` session to `Degraded`.
	///
	/// Bounded by the health timeout; a probe that hangs counts as unhealthy.
	pub async fn health_check(&mut self) -> bool {
		let Some(driver) = self.shared.driver.lock().clone() else {
			return false;
		};

		let healthy = tokio::time::timeout(self.options.health_timeout, probe(driver.as_ref(), &self.options.fatal_signatures))
			.await
			.unwrap_or(false);

		if !healthy {
			let mut state = self.shared.state.lock();
			if *state == SessionState::Ready {
				warn!(target = "slotwatch.session", "health check failed, session degraded");
				*state = SessionState::Degraded;
			}
		}
		healthy
	}

	/// Tries to bring a `Degraded` session back to `Ready` without a relaunch.
	pub async fn recover(&mut self) -> Result<()> {
		match self.state() {
			SessionState::Ready => return Ok(()),
			SessionState::Degraded => {}
			other => return Err(WatchError::SessionNotReady(other)),
		}
		let Some(driver) = self.shared.driver.lock().clone() else {
			return Err(WatchError::SessionNotReady(SessionState::Degraded));
		};

		let reopened = driver.open("about:blank", self.options.navigation_timeout).await;
		let healthy = reopened.is_ok()
			&& tokio::time::timeout(self.options.health_timeout, probe(driver.as_ref(), &self.options.fatal_signatures))
				.await
				.unwrap_or(false);
		if !healthy {
			return Err(PageError::Unresponsive("degraded session did not recover".to_string()).into());
		}

		self.shared.transition(SessionState::Ready);
		info!(target = "slotwatch.session", "session recovered");
		Ok(())
	}

	/// The page of a `Ready` session.
	pub fn page(&self) -> Result<Arc<dyn PageDriver>> {
		let state = self.state();
		if state != SessionState::Ready {
			return Err(WatchError::SessionNotReady(state));
		}
		self.shared.driver.lock().clone().ok_or(WatchError::SessionNotReady(state))
	}

	/// Opens `url`. A page-load timeout is only a warning as long as the browser
	/// still passes its health check afterwards.
	pub async fn navigate(&mut self, url: &str) -> Result<()> {
		let page = self.page()?;
		match page.open(url, self.options.navigation_timeout).await {
			Ok(()) => Ok(()),
			Err(PageError::Timeout { .. }) => {
				warn!(target = "slotwatch.session", %url, "page load timed out, continuing");
				if self.health_check().await {
					Ok(())
				} else {
					Err(WatchError::SessionNotReady(self.state()))
				}
			}
			Err(err) => Err(err.into()),
		}
	}

	/// Releases the browser. Idempotent and safe to race: exactly one caller
	/// performs the transition to `Dead` and gets `true`.
	pub async fn teardown(&self) -> bool {
		self.shared.teardown().await
	}
}

async fn probe(driver: &dyn PageDriver, fatal_signatures: &[String]) -> bool {
	if !driver.is_alive().await {
		return false;
	}
	match driver.window_count().await {
		Ok(count) if count > 0 => {}
		_ => return false,
	}
	match driver.current_state().await {
		Ok(state) => page_looks_healthy(&state, fatal_signatures),
		Err(_) => false,
	}
}

fn page_looks_healthy(state: &PageState, fatal_signatures: &[String]) -> bool {
	let url = state.url.trim().to_lowercase();
	if url.is_empty() || url == "data:," {
		return false;
	}
	if url.contains("chrome-error") || url.contains("err_") || state.title.to_lowercase().contains("chrome-error") {
		return false;
	}
	state.contains_any(fatal_signatures).is_none()
}
