//! Top-level supervised loop.
//!
//! The [`Orchestrator`] owns exactly one [`Session`] at a time and serves the
//! identities in rotation: make sure the session is ready, hand it to the
//! watcher for one identity's turn, and route any failure through the
//! [`RecoveryController`]. Two timers (status report, artifact cleanup) and the
//! cycle-report listener run beside the loop; they only read counters.
//!
//! Stopping is cooperative: [`OrchestratorHandle::stop`] flips the stop signal,
//! which interrupts every wait, and tears down the live session so an in-flight
//! page call fails fast.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use slotwatch_runtime::sweep::SweepRule;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::captcha::CaptchaSolver;
use crate::config::OrchestratorConfig;
use crate::error::{Result, WatchError};
use crate::identity::{Identity, IdentityId};
use crate::notify::{self, Notifications, Notifier};
use crate::page::BrowserFactory;
use crate::record::RecordStore;
use crate::recovery::{FailureKind, RecoveryController, RecoveryOutcome, RetryAction};
use crate::rotation::{CycleCompleted, RotationScheduler};
use crate::session::{Session, SessionState, SessionTerminator};
use crate::status::{self, BudgetLine, StatusSnapshot, WatchCounters};
use crate::stop::{StopSignal, StopTrigger, stop_channel};
use crate::watcher::{AppointmentWatcher, Turn, TurnEnd};

/// External boundaries the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
	pub factory: Arc<dyn BrowserFactory>,
	pub solver: Arc<dyn CaptchaSolver>,
	pub notifier: Arc<dyn Notifier>,
}

/// Values published by the loop for status readers.
struct StatusBoard {
	counters: Arc<WatchCounters>,
	started: Instant,
	running: AtomicBool,
	cycles: AtomicU64,
	poll_interval_secs: AtomicU64,
	/// Unix seconds, 0 until the first report.
	last_report_at: AtomicU64,
	session: Mutex<Option<SessionTerminator>>,
	current: Mutex<Option<IdentityId>>,
	last_error: Mutex<Option<String>>,
	budgets: Mutex<Vec<BudgetLine>>,
}

impl StatusBoard {
	fn new() -> Self {
		Self {
			counters: Arc::new(WatchCounters::default()),
			started: Instant::now(),
			running: AtomicBool::new(false),
			cycles: AtomicU64::new(0),
			poll_interval_secs: AtomicU64::new(0),
			last_report_at: AtomicU64::new(0),
			session: Mutex::new(None),
			current: Mutex::new(None),
			last_error: Mutex::new(None),
			budgets: Mutex::new(Vec::new()),
		}
	}

	fn snapshot(&self) -> StatusSnapshot {
		let session = self.session.lock().as_ref().map_or(SessionState::Uninitialized, SessionTerminator::state);
		let last_report_at = self.last_report_at.load(Ordering::Relaxed);
		StatusSnapshot {
			running: self.running.load(Ordering::SeqCst),
			session,
			checks: self.counters.checks(),
			per_identity: self.counters.per_identity(),
			cycles: self.cycles.load(Ordering::Relaxed),
			current_identity: self.current.lock().clone(),
			last_error: self.last_error.lock().clone(),
			uptime_secs: self.started.elapsed().as_secs(),
			poll_interval_secs: self.poll_interval_secs.load(Ordering::Relaxed),
			last_report_at: (last_report_at > 0).then_some(last_report_at),
			budgets: self.budgets.lock().clone(),
		}
	}

	fn publish_budgets(&self, recovery: &RecoveryController) {
		*self.budgets.lock() = recovery.snapshot().iter().map(BudgetLine::from).collect();
	}
}

/// Cheap handle for stopping and inspecting a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
	trigger: Arc<StopTrigger>,
	board: Arc<StatusBoard>,
	manual_fill: Arc<AtomicBool>,
}

impl OrchestratorHandle {
	/// Requests a stop and tears the live session down. Safe to call repeatedly.
	pub async fn stop(&self) {
		self.trigger.stop();
		let terminator = self.board.session.lock().clone();
		if let Some(terminator) = terminator {
			terminator.teardown().await;
		}
	}

	pub fn is_stopped(&self) -> bool {
		self.trigger.is_stopped()
	}

	/// Asks the watcher to fill the booking form at its next poll.
	pub fn request_manual_fill(&self) {
		self.manual_fill.store(true, Ordering::SeqCst);
	}

	pub fn status(&self) -> StatusSnapshot {
		self.board.snapshot()
	}
}

/// Everything the loop mutates. Owned by the loop alone.
struct OrchestratorState {
	scheduler: RotationScheduler,
	recovery: RecoveryController,
	session: Session,
	watcher: AppointmentWatcher,
}

pub struct Orchestrator {
	identities: Vec<Identity>,
	collaborators: Collaborators,
	config: watch::Receiver<Arc<OrchestratorConfig>>,
	trigger: Arc<StopTrigger>,
	board: Arc<StatusBoard>,
	manual_fill: Arc<AtomicBool>,
}

impl Orchestrator {
	pub fn new(identities: Vec<Identity>, config: watch::Receiver<Arc<OrchestratorConfig>>, collaborators: Collaborators) -> Self {
		let (trigger, _) = stop_channel();
		Self {
			identities,
			collaborators,
			config,
			trigger: Arc::new(trigger),
			board: Arc::new(StatusBoard::new()),
			manual_fill: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn handle(&self) -> OrchestratorHandle {
		OrchestratorHandle {
			trigger: Arc::clone(&self.trigger),
			board: Arc::clone(&self.board),
			manual_fill: Arc::clone(&self.manual_fill),
		}
	}

	/// Runs until stopped (`Ok`) or until a fatal failure (`Err`), which is
	/// reported through the notifier exactly once before returning.
	pub async fn run(self) -> Result<()> {
		let stop = self.trigger.signal();
		let notifications = Notifications::new(Arc::clone(&self.collaborators.notifier));
		self.board.running.store(true, Ordering::SeqCst);
		info!(target = "slotwatch.orchestrator", identities = self.identities.len(), "orchestrator starting");

		let result = match self.prepare(&notifications) {
			Ok((mut state, cycles)) => {
				let timers = self.spawn_background(&notifications, cycles, &stop);
				let result = self.supervise(&mut state, &notifications, &stop).await;
				self.trigger.stop();
				state.session.teardown().await;
				for timer in timers {
					let _ = timer.await;
				}
				result
			}
			Err(err) => Err(err),
		};

		self.board.running.store(false, Ordering::SeqCst);
		match &result {
			Ok(()) => info!(target = "slotwatch.orchestrator", "orchestrator stopped"),
			Err(err) => {
				error!(target = "slotwatch.orchestrator", error = %err, "orchestrator halted");
				*self.board.last_error.lock() = Some(err.to_string());
				notifications.send(notify::fatal(&err.to_string())).await;
			}
		}
		result
	}

	fn prepare(&self, notifications: &Notifications) -> Result<(OrchestratorState, mpsc::UnboundedReceiver<CycleCompleted>)> {
		let config = self.config.borrow().clone();
		let mut scheduler = RotationScheduler::new(self.identities.clone())?;
		let cycles = scheduler.subscribe();

		std::fs::create_dir_all(&config.state_dir)?;
		let records = RecordStore::open(config.records_path())?;
		let watcher = AppointmentWatcher::new(
			Arc::clone(&self.collaborators.solver),
			notifications.clone(),
			records,
			Arc::clone(&self.board.counters),
		)
		.with_manual_fill_flag(Arc::clone(&self.manual_fill));

		let state = OrchestratorState {
			scheduler,
			recovery: RecoveryController::new(&config.recovery),
			session: self.fresh_session(&config),
			watcher,
		};
		self.board.publish_budgets(&state.recovery);
		Ok((state, cycles))
	}

	fn fresh_session(&self, config: &OrchestratorConfig) -> Session {
		let session = Session::new(Arc::clone(&self.collaborators.factory), config.browser.session_options());
		*self.board.session.lock() = Some(session.terminator());
		session
	}

	async fn supervise(&self, state: &mut OrchestratorState, notifications: &Notifications, stop: &StopSignal) -> Result<()> {
		let mut config_rx = self.config.clone();
		loop {
			if stop.is_stopped() {
				return Ok(());
			}
			let config = config_rx.borrow_and_update().clone();
			self.board.poll_interval_secs.store(config.site.poll_interval_secs, Ordering::Relaxed);

			match self.ensure_ready(state, &config).await {
				Ok(()) => {}
				Err(_) if stop.is_stopped() => return Ok(()),
				Err(err) => return Err(err),
			}

			let identity = state.scheduler.next().clone();
			self.board.cycles.store(state.scheduler.completed_cycles(), Ordering::Relaxed);
			*self.board.current.lock() = Some(identity.id.clone());
			debug!(target = "slotwatch.orchestrator", identity = %identity.id, cursor = state.scheduler.cursor(), "turn starting");

			let result = state
				.watcher
				.run_turn(Turn {
					identity: &identity,
					session: &mut state.session,
					recovery: &mut state.recovery,
					config: &config_rx,
					stop,
				})
				.await;
			self.board.publish_budgets(&state.recovery);

			let err = match result {
				Ok(TurnEnd::PollLimit { polls }) => {
					debug!(target = "slotwatch.orchestrator", identity = %identity.id, polls, "turn complete");
					continue;
				}
				Ok(TurnEnd::Stopped) => return Ok(()),
				Err(_) if stop.is_stopped() => return Ok(()),
				Err(err) => err,
			};

			*self.board.last_error.lock() = Some(err.to_string());
			let outcome = state.recovery.handle(&err);
			self.board.publish_budgets(&state.recovery);

			match outcome {
				RecoveryOutcome::Retry { wait, action } => {
					match &err {
						WatchError::SiteLockout { reason, .. } => {
							info!(target = "slotwatch.orchestrator", identity = %identity.id, %reason, wait_secs = wait.as_secs(), "site asked us to wait")
						}
						_ => warn!(target = "slotwatch.orchestrator", identity = %identity.id, error = %err, wait_secs = wait.as_secs(), "turn failed, retrying"),
					}
					self.prepare_retry(state, action, &config).await;
					if stop.sleep(wait).await.is_err() {
						return Ok(());
					}
				}
				RecoveryOutcome::Rebuild { escalated } => {
					if escalated {
						let kind = FailureKind::classify(&err);
						let attempts = state.recovery.budget(kind).attempts();
						notifications.send(notify::budget_exhausted(kind.name(), attempts)).await;
					}
					warn!(target = "slotwatch.orchestrator", error = %err, escalated, "rebuilding browser session");
					state.session.teardown().await;
					state.session = self.fresh_session(&config);
				}
				RecoveryOutcome::FatalStop { reason } => return Err(WatchError::Fatal(reason)),
			}
		}
	}

	/// Brings the session to `Ready`: probe, recover in place, or start a new one.
	/// A session that cannot be started is fatal.
	async fn ensure_ready(&self, state: &mut OrchestratorState, config: &OrchestratorConfig) -> Result<()> {
		if state.session.state() == SessionState::Ready && state.session.health_check().await {
			return Ok(());
		}
		if state.session.state() == SessionState::Degraded {
			match state.session.recover().await {
				Ok(()) => return Ok(()),
				Err(err) => {
					warn!(target = "slotwatch.orchestrator", error = %err, "recovery failed, replacing session");
					state.session.teardown().await;
				}
			}
		}
		if state.session.state() != SessionState::Uninitialized {
			state.session = self.fresh_session(config);
		}
		state.session.start().await.map_err(|err| match err {
			WatchError::Fatal(_) | WatchError::Stopped => err,
			other => WatchError::Fatal(format!("browser session could not be started: {other}")),
		})
	}

	async fn prepare_retry(&self, state: &mut OrchestratorState, action: RetryAction, config: &OrchestratorConfig) {
		match action {
			RetryAction::None => {}
			RetryAction::RefreshPage => {
				if let Err(err) = state.session.navigate(&config.site.login_url).await {
					debug!(target = "slotwatch.orchestrator", error = %err, "refresh before retry failed");
				}
			}
			RetryAction::DiscardArtifacts => {
				let removed = state.watcher.discard_artifacts();
				debug!(target = "slotwatch.orchestrator", removed, "discarded capture artifacts");
			}
		}
	}

	fn spawn_background(
		&self,
		notifications: &Notifications,
		cycles: mpsc::UnboundedReceiver<CycleCompleted>,
		stop: &StopSignal,
	) -> Vec<JoinHandle<()>> {
		vec![
			tokio::spawn(status_timer(Arc::clone(&self.board), self.config.clone(), notifications.clone(), stop.clone())),
			tokio::spawn(cleanup_timer(self.config.clone(), stop.clone())),
			tokio::spawn(cycle_reports(
				cycles,
				Arc::clone(&self.board.counters),
				notifications.clone(),
				stop.clone(),
			)),
		]
	}
}

fn period(secs: u64) -> Duration {
	Duration::from_secs(secs.max(1))
}

async fn status_timer(board: Arc<StatusBoard>, config: watch::Receiver<Arc<OrchestratorConfig>>, notifications: Notifications, stop: StopSignal) {
	loop {
		let every = period(config.borrow().timers.status_report_secs);
		if stop.sleep(every).await.is_err() {
			break;
		}
		let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
		board.last_report_at.store(now, Ordering::Relaxed);
		let snapshot = board.snapshot();
		debug!(target = "slotwatch.status", checks = snapshot.checks, "sending status report");
		notifications.send(snapshot.report()).await;
	}
}

async fn cleanup_timer(config: watch::Receiver<Arc<OrchestratorConfig>>, stop: StopSignal) {
	loop {
		let current = config.borrow().clone();
		if stop.sleep(period(current.timers.cleanup_secs)).await.is_err() {
			break;
		}
		let Some(dir) = &current.artifacts_dir else {
			continue;
		};
		let rule = match SweepRule::new(&current.timers.artifact_patterns, Duration::from_secs(current.timers.artifact_max_age_secs)) {
			Ok(rule) => rule,
			Err(err) => {
				warn!(target = "slotwatch.cleanup", error = %err, "invalid artifact pattern");
				continue;
			}
		};
		match rule.sweep(dir, SystemTime::now()) {
			Ok(report) if report.removed.is_empty() && report.failed == 0 => {}
			Ok(report) => info!(target = "slotwatch.cleanup", removed = report.removed.len(), failed = report.failed, "stale artifacts swept"),
			Err(err) => warn!(target = "slotwatch.cleanup", dir = %dir.display(), error = %err, "artifact sweep failed"),
		}
	}
}

async fn cycle_reports(
	mut cycles: mpsc::UnboundedReceiver<CycleCompleted>,
	counters: Arc<WatchCounters>,
	notifications: Notifications,
	stop: StopSignal,
) {
	loop {
		tokio::select! {
			biased;
			event = cycles.recv() => {
				let Some(event) = event else { break };
				info!(target = "slotwatch.orchestrator", cycle = event.cycle, identities = event.identities, "rotation cycle complete");
				notifications.send(status::cycle_report(event.cycle, &counters.per_identity())).await;
			}
			_ = stop.stopped() => break,
		}
	}
}
