//! Login, polling, change detection and claiming for one identity turn.
//!
//! A turn logs in as the current identity and then polls the availability page
//! until a failure propagates, a stop is requested or the configured number of
//! polls per turn is reached. Every successful step resets the recovery budget
//! of the failure kind that fired last.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::captcha::CaptchaSolver;
use crate::config::{MarkerSettings, OrchestratorConfig};
use crate::error::{PageError, Result, WatchError};
use crate::identity::Identity;
use crate::notify::{self, Notifications};
use crate::page::{Action, ElementDescriptor, ElementHandle, FormField, PageDriver};
use crate::record::{Change, RecordStore};
use crate::recovery::RecoveryController;
use crate::session::Session;
use crate::status::WatchCounters;
use crate::stop::StopSignal;

const LOCATE_INTERVAL: Duration = Duration::from_millis(500);

/// How the site answered a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
	Success,
	AccountLocked(Duration),
	RateLimited(Duration),
	/// Logged in but parked in a waiting room; polling continues.
	QueuePosition,
	CaptchaInvalid,
	UnknownFailure(String),
}

impl LoginOutcome {
	/// Classifies the page text shown after submitting the login form.
	///
	/// Failure markers win over the success marker because error banners are
	/// rendered on top of the normal page chrome.
	pub fn interpret(text: &str, markers: &MarkerSettings) -> LoginOutcome {
		let lower = text.to_lowercase();
		let seen = |list: &[String]| list.iter().any(|m| !m.is_empty() && lower.contains(&m.to_lowercase()));

		if seen(&markers.account_locked) {
			LoginOutcome::AccountLocked(Duration::from_secs(markers.lockout_cooldown_secs))
		} else if seen(&markers.captcha_invalid) {
			LoginOutcome::CaptchaInvalid
		} else if seen(&markers.rate_limited) {
			LoginOutcome::RateLimited(Duration::from_secs(markers.rate_limit_cooldown_secs))
		} else if seen(&markers.login_success) {
			LoginOutcome::Success
		} else if seen(&markers.queue) {
			LoginOutcome::QueuePosition
		} else {
			LoginOutcome::UnknownFailure(excerpt(text, 160))
		}
	}

	fn into_result(self) -> Result<()> {
		match self {
			LoginOutcome::Success | LoginOutcome::QueuePosition => Ok(()),
			LoginOutcome::AccountLocked(cooldown) => Err(WatchError::SiteLockout {
				reason: "account locked".to_string(),
				cooldown,
			}),
			LoginOutcome::RateLimited(cooldown) => Err(WatchError::SiteLockout {
				reason: "rate limited".to_string(),
				cooldown,
			}),
			LoginOutcome::CaptchaInvalid => Err(WatchError::CaptchaRejected("site rejected the answer".to_string())),
			LoginOutcome::UnknownFailure(text) => Err(WatchError::LoginFailed(text)),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
	NoAvailability,
	/// Earliest bookable date as displayed.
	Available(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
	Confirmed { slot: String },
	ClaimFailed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillReport {
	pub filled: usize,
	pub missing: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
	PollLimit { polls: u32 },
	Stopped,
}

/// Everything a turn borrows from the orchestrator.
pub struct Turn<'a> {
	pub identity: &'a Identity,
	pub session: &'a mut Session,
	pub recovery: &'a mut RecoveryController,
	pub config: &'a watch::Receiver<Arc<OrchestratorConfig>>,
	pub stop: &'a StopSignal,
}

pub struct AppointmentWatcher {
	solver: Arc<dyn CaptchaSolver>,
	notifications: Notifications,
	records: RecordStore,
	counters: Arc<WatchCounters>,
	manual_fill: Arc<AtomicBool>,
	attempt_artifacts: Vec<PathBuf>,
}

impl AppointmentWatcher {
	pub fn new(solver: Arc<dyn CaptchaSolver>, notifications: Notifications, records: RecordStore, counters: Arc<WatchCounters>) -> Self {
		Self {
			solver,
			notifications,
			records,
			counters,
			manual_fill: Arc::new(AtomicBool::new(false)),
			attempt_artifacts: Vec::new(),
		}
	}

	/// Flag that requests a form fill at the next poll-loop top.
	pub fn manual_fill_flag(&self) -> Arc<AtomicBool> {
		Arc::clone(&self.manual_fill)
	}

	pub fn with_manual_fill_flag(mut self, flag: Arc<AtomicBool>) -> Self {
		self.manual_fill = flag;
		self
	}

	pub async fn run_turn(&mut self, turn: Turn<'_>) -> Result<TurnEnd> {
		let Turn {
			identity,
			session,
			recovery,
			config,
			stop,
		} = turn;

		let current = config.borrow().clone();
		info!(target = "slotwatch.watcher", identity = %identity.id, "logging in");
		self.login(identity, session, &current, stop).await?;
		recovery.record_success();

		let mut polls = 0u32;
		loop {
			if stop.is_stopped() {
				return Ok(TurnEnd::Stopped);
			}
			let current = config.borrow().clone();

			if self.manual_fill.swap(false, Ordering::SeqCst) {
				self.fill_form(identity, session).await;
			}

			let outcome = match self.poll(identity, session, &current, stop).await {
				Err(WatchError::Stopped) => return Ok(TurnEnd::Stopped),
				other => other?,
			};
			self.counters.record_check(&identity.id);
			self.on_poll(identity, session, &current, outcome).await?;
			recovery.record_success();

			polls += 1;
			if current.site.polls_per_turn.is_some_and(|limit| polls >= limit) {
				return Ok(TurnEnd::PollLimit { polls });
			}
			if stop.sleep(current.poll_interval()).await.is_err() {
				return Ok(TurnEnd::Stopped);
			}
		}
	}

	/// Performs one login attempt and maps the site's answer onto the failure taxonomy.
	pub async fn login(&mut self, identity: &Identity, session: &mut Session, config: &OrchestratorConfig, stop: &StopSignal) -> Result<()> {
		session.navigate(&config.site.login_url).await?;
		let page = session.page()?;

		if let Ok(Some(banner)) = page.locate(ElementDescriptor::CookieReject).await {
			if let Err(err) = page.act(&banner, Action::Click).await {
				debug!(target = "slotwatch.watcher", error = %err, "cookie banner dismissal failed");
			}
		}

		let email = wait_for(page.as_ref(), ElementDescriptor::EmailInput, config.element_wait()).await?;
		page.act(&email, Action::Fill(config.site.email.clone())).await?;
		let password = require(page.as_ref(), ElementDescriptor::PasswordInput).await?;
		page.act(&password, Action::Fill(config.site.password.clone())).await?;

		if config.site.captcha_enabled {
			if let Some(image) = page.locate(ElementDescriptor::CaptchaImage).await? {
				let answer = self.solve_captcha(page.as_ref(), &image, config, stop).await?;
				let input = require(page.as_ref(), ElementDescriptor::CaptchaInput).await?;
				page.act(&input, Action::Fill(answer)).await?;
			}
		}

		let submit = require(page.as_ref(), ElementDescriptor::LoginSubmit).await?;
		page.act(&submit, Action::Click).await?;
		stop.sleep(Duration::from_secs(config.site.settle_secs)).await?;

		let state = page.current_state().await?;
		let outcome = LoginOutcome::interpret(&state.text, &config.markers);
		match &outcome {
			LoginOutcome::Success => info!(target = "slotwatch.watcher", identity = %identity.id, "logged in"),
			LoginOutcome::QueuePosition => info!(target = "slotwatch.watcher", identity = %identity.id, "queued by the site, continuing"),
			other => warn!(target = "slotwatch.watcher", identity = %identity.id, outcome = ?other, "login not accepted"),
		}
		let result = outcome.into_result();
		if result.is_ok() {
			self.attempt_artifacts.clear();
		}
		result
	}

	/// A solver may wait on an operator for minutes, so a stop cuts it short.
	async fn solve_captcha(&mut self, page: &dyn PageDriver, image: &ElementHandle, config: &OrchestratorConfig, stop: &StopSignal) -> Result<String> {
		let bytes = page
			.act(image, Action::Capture)
			.await?
			.into_image()
			.ok_or_else(|| PageError::Protocol("captcha capture returned no image".to_string()))?;
		self.save_artifact(&bytes, config);

		let solved = tokio::select! {
			solved = self.solver.solve(&bytes) => solved,
			_ = stop.stopped() => return Err(WatchError::Stopped),
		};
		match solved.map(|a| a.trim().to_string()) {
			Some(answer) if !answer.is_empty() => {
				debug!(target = "slotwatch.watcher", len = answer.len(), "captcha solved");
				Ok(answer)
			}
			_ => Err(WatchError::CaptchaRejected("captcha could not be solved".to_string())),
		}
	}

	fn save_artifact(&mut self, bytes: &[u8], config: &OrchestratorConfig) {
		let Some(dir) = &config.artifacts_dir else {
			return;
		};
		let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
		let path = dir.join(format!("captcha_{millis}.png"));
		let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, bytes));
		match written {
			Ok(()) => self.attempt_artifacts.push(path),
			Err(err) => debug!(target = "slotwatch.watcher", path = %path.display(), error = %err, "could not keep captcha image"),
		}
	}

	/// Deletes the files captured during the current login attempt.
	pub fn discard_artifacts(&mut self) -> usize {
		let mut removed = 0;
		for path in self.attempt_artifacts.drain(..) {
			if std::fs::remove_file(&path).is_ok() {
				removed += 1;
			}
		}
		removed
	}

	/// Reopens the booking page for `identity`'s category and reads the availability marker.
	pub async fn poll(&mut self, identity: &Identity, session: &mut Session, config: &OrchestratorConfig, stop: &StopSignal) -> Result<PollOutcome> {
		let page = session.page()?;
		check_site(page.as_ref(), config).await?;
		refresh_category(page.as_ref(), identity, config).await?;
		stop.sleep(Duration::from_secs(config.site.settle_secs)).await?;
		check_site(page.as_ref(), config).await?;

		if page.locate(ElementDescriptor::NoAvailabilityNotice).await?.is_some() {
			return Ok(PollOutcome::NoAvailability);
		}
		let marker = require(page.as_ref(), ElementDescriptor::AvailabilityMarker).await?;
		let text = page.act(&marker, Action::ReadText).await?.into_text().unwrap_or_default();
		let text = text.trim();
		if text.is_empty() {
			return Ok(PollOutcome::NoAvailability);
		}
		Ok(PollOutcome::Available(text.to_string()))
	}

	async fn on_poll(&mut self, identity: &Identity, session: &mut Session, config: &OrchestratorConfig, outcome: PollOutcome) -> Result<()> {
		let marker = match &outcome {
			PollOutcome::Available(marker) => marker.as_str(),
			PollOutcome::NoAvailability => "",
		};

		match self.records.observe(identity.resource(), marker, Some(&identity.id.0))? {
			Change::Unchanged => debug!(target = "slotwatch.watcher", identity = %identity.id, marker, "no change"),
			Change::Returned(marker) => info!(target = "slotwatch.watcher", identity = %identity.id, %marker, "previously announced date is back"),
			Change::BecameUnavailable => {
				info!(target = "slotwatch.watcher", identity = %identity.id, "availability disappeared");
				if config.site.notify_unavailable {
					self.notifications.send(notify::no_availability(identity)).await;
				}
			}
			Change::New(marker) => {
				info!(target = "slotwatch.watcher", identity = %identity.id, %marker, "new availability detected");
				self.notifications.send(notify::slot_found(identity, &marker)).await;
				if identity.claim_on_find {
					match self.claim(identity, session, config).await {
						ClaimOutcome::Confirmed { slot } => self.notifications.send(notify::claim_confirmed(identity, &marker, &slot)).await,
						ClaimOutcome::ClaimFailed { reason } => {
							let message = notify::claim_failed(identity, &marker, &reason);
							self.send_with_screenshot(session, message).await;
						}
					}
				}
			}
		}
		Ok(())
	}

	/// Attaches a screenshot of the current page when one can be taken.
	async fn send_with_screenshot(&self, session: &Session, message: String) {
		let screenshot = match session.page() {
			Ok(page) => page.screenshot().await.ok(),
			Err(_) => None,
		};
		match screenshot {
			Some(png) => self.notifications.send_image(&png, message).await,
			None => self.notifications.send(message).await,
		}
	}

	/// Books the earliest slot. Failures are reported, never escalated.
	pub async fn claim(&mut self, identity: &Identity, session: &mut Session, config: &OrchestratorConfig) -> ClaimOutcome {
		let page = match session.page() {
			Ok(page) => page,
			Err(err) => return ClaimOutcome::ClaimFailed { reason: err.to_string() },
		};
		match claim_earliest(page.as_ref(), config.element_wait()).await {
			Ok(slot) => {
				info!(target = "slotwatch.watcher", identity = %identity.id, %slot, "appointment confirmed");
				ClaimOutcome::Confirmed { slot }
			}
			Err(err) => {
				warn!(target = "slotwatch.watcher", identity = %identity.id, error = %err, "claim failed");
				ClaimOutcome::ClaimFailed { reason: err.to_string() }
			}
		}
	}

	/// Types the identity's data into every form field found on the current page.
	pub async fn fill_form(&mut self, identity: &Identity, session: &mut Session) -> FillReport {
		let mut report = FillReport { filled: 0, missing: 0 };
		let page = match session.page() {
			Ok(page) => page,
			Err(err) => {
				warn!(target = "slotwatch.watcher", error = %err, "manual fill skipped");
				self.notifications.send(format!("Form fill skipped: {err}")).await;
				return report;
			}
		};

		for field in FormField::ALL {
			let Some(value) = identity.form_value(field) else {
				continue;
			};
			let filled = match page.locate(ElementDescriptor::FormField(field)).await {
				Ok(Some(handle)) => page.act(&handle, Action::Fill(value.to_string())).await.is_ok(),
				_ => false,
			};
			if filled {
				report.filled += 1;
			} else {
				debug!(target = "slotwatch.watcher", field = field.key(), "form field not filled");
				report.missing += 1;
			}
		}

		info!(target = "slotwatch.watcher", identity = %identity.id, filled = report.filled, missing = report.missing, "manual fill done");
		self.notifications.send(notify::form_filled(identity, report.filled, report.missing)).await;
		report
	}
}

/// Fails when the page is an offline or site error page.
async fn check_site(page: &dyn PageDriver, config: &OrchestratorConfig) -> Result<()> {
	let state = page.current_state().await?;
	if let Some(marker) = state.contains_any(&config.markers.offline) {
		return Err(WatchError::NetworkDegraded(marker));
	}
	if let Some(marker) = state.contains_any(&config.markers.site_error) {
		return Err(WatchError::SiteError(marker));
	}
	Ok(())
}

/// Opens the booking page again and submits the category, which makes the site
/// recompute availability. The selection is read back since the page can reset it.
async fn refresh_category(page: &dyn PageDriver, identity: &Identity, config: &OrchestratorConfig) -> Result<()> {
	if let Some(entry) = page.locate(ElementDescriptor::BookingEntry).await? {
		page.act(&entry, Action::Click).await?;
	}
	let select = wait_for(page, ElementDescriptor::CategorySelect, config.element_wait()).await?;
	page.act(&select, Action::SelectValue(identity.category.clone())).await?;

	let current = page.act(&select, Action::ReadValue).await?.into_text().unwrap_or_default();
	if current.trim() != identity.category {
		return Err(PageError::NotInteractable(format!("category select shows {:?} instead of {:?}", current.trim(), identity.category)).into());
	}
	debug!(target = "slotwatch.watcher", identity = %identity.id, category = %identity.category, "category submitted");
	Ok(())
}

async fn claim_earliest(page: &dyn PageDriver, wait: Duration) -> Result<String, PageError> {
	let slot = require(page, ElementDescriptor::EarliestSlot).await?;
	page.act(&slot, Action::Click).await?;

	let select = wait_for(page, ElementDescriptor::TimeSlotSelect, wait).await?;
	let options = page.act(&select, Action::ListOptions).await?.into_options().unwrap_or_default();
	// the first option is the empty "--Select--" placeholder
	let option = options
		.into_iter()
		.find(|o| !o.value.trim().is_empty())
		.ok_or_else(|| PageError::ElementNotFound("no time slot offered".to_string()))?;
	page.act(&select, Action::SelectValue(option.value.clone())).await?;

	let confirm = require(page, ElementDescriptor::ConfirmButton).await?;
	page.act(&confirm, Action::Click).await?;
	Ok(if option.label.is_empty() { option.value } else { option.label })
}

async fn require(page: &dyn PageDriver, descriptor: ElementDescriptor) -> Result<ElementHandle, PageError> {
	page.locate(descriptor).await?.ok_or_else(|| PageError::ElementNotFound(descriptor.key()))
}

/// Polls for `descriptor` until it shows up or `timeout` elapses.
async fn wait_for(page: &dyn PageDriver, descriptor: ElementDescriptor, timeout: Duration) -> Result<ElementHandle, PageError> {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if let Some(handle) = page.locate(descriptor).await? {
			return Ok(handle);
		}
		if tokio::time::Instant::now() >= deadline {
			return Err(PageError::Timeout {
				operation: format!("waiting for {descriptor}"),
				timeout,
			});
		}
		tokio::time::sleep(LOCATE_INTERVAL).await;
	}
}

fn excerpt(text: &str, max_chars: usize) -> String {
	let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
	if collapsed.chars().count() <= max_chars {
		return collapsed;
	}
	let mut cut: String = collapsed.chars().take(max_chars).collect();
	cut.push('…');
	cut
}
