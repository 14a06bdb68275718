//! Command boundary: start, stop, manual fill, config updates and status.
//!
//! The [`Controller`] owns the settings file and at most one running
//! [`Orchestrator`]. Transports (the local control socket, signal handlers)
//! translate their input into [`ControlRequest`]s and hand them to
//! [`Controller::handle`].

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigUpdate, OrchestratorConfig, Settings};
use crate::error::{Result, WatchError};
use crate::orchestrator::{Collaborators, Orchestrator, OrchestratorHandle};
use crate::session::SessionState;
use crate::status::StatusSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
	Ping,
	Start,
	Stop,
	Status,
	ManualFill,
	UpdateConfig { section: String, key: String, value: String },
	Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
	Pong,
	Ok,
	Status { status: StatusSnapshot },
	ConfigUpdated { update: ConfigUpdate },
	Error { code: String, message: String },
}

#[derive(Debug, Error)]
pub enum ControlError {
	#[error("watcher is already running")]
	AlreadyRunning,

	#[error("watcher is not running")]
	NotRunning,

	#[error(transparent)]
	Watch(#[from] WatchError),
}

impl ControlError {
	pub fn code(&self) -> &'static str {
		match self {
			ControlError::AlreadyRunning => "already_running",
			ControlError::NotRunning => "not_running",
			ControlError::Watch(WatchError::Config(_)) => "invalid_config",
			ControlError::Watch(_) => "internal",
		}
	}
}

impl From<ControlError> for ControlResponse {
	fn from(err: ControlError) -> Self {
		ControlResponse::Error {
			code: err.code().to_string(),
			message: err.to_string(),
		}
	}
}

/// Builds the concrete collaborators for a fresh orchestrator from the current settings.
pub type CollaboratorBuilder = Arc<dyn Fn(&Settings) -> Result<Collaborators> + Send + Sync>;

struct Running {
	handle: OrchestratorHandle,
	task: JoinHandle<Result<()>>,
}

pub struct Controller {
	settings_path: PathBuf,
	settings: Settings,
	default_state_dir: PathBuf,
	config_tx: watch::Sender<Arc<OrchestratorConfig>>,
	build: CollaboratorBuilder,
	running: Option<Running>,
	/// Handle of the last finished run, kept for its final counters.
	last: Option<OrchestratorHandle>,
	last_exit: Option<String>,
}

impl Controller {
	pub fn new(settings_path: PathBuf, settings: Settings, default_state_dir: PathBuf, build: CollaboratorBuilder) -> Self {
		let config = OrchestratorConfig::from_settings(&settings, &default_state_dir);
		let (config_tx, _) = watch::channel(Arc::new(config));
		Self {
			settings_path,
			settings,
			default_state_dir,
			config_tx,
			build,
			running: None,
			last: None,
			last_exit: None,
		}
	}

	pub fn settings(&self) -> &Settings {
		&self.settings
	}

	pub fn config(&self) -> Arc<OrchestratorConfig> {
		self.config_tx.borrow().clone()
	}

	pub async fn is_running(&mut self) -> bool {
		self.reap().await;
		self.running.is_some()
	}

	/// Collects a run that ended on its own (fatal stop).
	async fn reap(&mut self) {
		if !self.running.as_ref().is_some_and(|r| r.task.is_finished()) {
			return;
		}
		if let Some(running) = self.running.take() {
			self.finish(running).await;
		}
	}

	async fn finish(&mut self, running: Running) {
		self.last_exit = match running.task.await {
			Ok(Ok(())) => None,
			Ok(Err(err)) => Some(err.to_string()),
			Err(err) => Some(format!("watcher task failed: {err}")),
		};
		self.last = Some(running.handle);
	}

	pub async fn start(&mut self) -> Result<(), ControlError> {
		if self.is_running().await {
			return Err(ControlError::AlreadyRunning);
		}
		let config = Arc::new(OrchestratorConfig::from_settings(&self.settings, &self.default_state_dir));
		self.config_tx.send_replace(config);
		let collaborators = (self.build)(&self.settings)?;

		let orchestrator = Orchestrator::new(self.settings.identities.clone(), self.config_tx.subscribe(), collaborators);
		let handle = orchestrator.handle();
		let task = tokio::spawn(orchestrator.run());
		info!(target = "slotwatch.control", identities = self.settings.identities.len(), "watcher started");
		self.running = Some(Running { handle, task });
		self.last_exit = None;
		Ok(())
	}

	/// Stops the running orchestrator and waits for it to wind down.
	pub async fn stop(&mut self) -> Result<(), ControlError> {
		self.reap().await;
		let Some(running) = self.running.take() else {
			return Err(ControlError::NotRunning);
		};
		running.handle.stop().await;
		self.finish(running).await;
		info!(target = "slotwatch.control", "watcher stopped");
		Ok(())
	}

	pub async fn manual_fill(&mut self) -> Result<(), ControlError> {
		self.reap().await;
		let running = self.running.as_ref().ok_or(ControlError::NotRunning)?;
		running.handle.request_manual_fill();
		info!(target = "slotwatch.control", "manual fill requested");
		Ok(())
	}

	/// Persists one settings change and pushes it to a running watcher when it
	/// applies live.
	pub fn update_config(&mut self, section: &str, key: &str, value: &str) -> Result<ConfigUpdate, ControlError> {
		let update = self.settings.update(&self.settings_path, section, key, value)?;
		if update.live {
			let config = OrchestratorConfig::from_settings(&self.settings, &self.default_state_dir);
			self.config_tx.send_replace(Arc::new(config));
		}
		info!(target = "slotwatch.control", section = %update.section, key = %update.key, live = update.live, "settings updated");
		Ok(update)
	}

	pub async fn status(&mut self) -> StatusSnapshot {
		self.reap().await;
		let handle = self.running.as_ref().map(|r| &r.handle).or(self.last.as_ref());
		let mut status = match handle {
			Some(handle) => handle.status(),
			None => StatusSnapshot {
				running: false,
				session: SessionState::Uninitialized,
				checks: 0,
				per_identity: Default::default(),
				cycles: 0,
				current_identity: None,
				last_error: None,
				uptime_secs: 0,
				poll_interval_secs: self.settings.site.poll_interval_secs,
				last_report_at: None,
				budgets: Vec::new(),
			},
		};
		if status.last_error.is_none() {
			status.last_error = self.last_exit.clone();
		}
		status
	}

	/// Executes one request. `Shutdown` only stops the watcher; ending the
	/// process is up to the transport.
	pub async fn handle(&mut self, request: ControlRequest) -> ControlResponse {
		let result = match request {
			ControlRequest::Ping => return ControlResponse::Pong,
			ControlRequest::Status => {
				return ControlResponse::Status {
					status: self.status().await,
				};
			}
			ControlRequest::Start => self.start().await,
			ControlRequest::Stop => self.stop().await,
			ControlRequest::ManualFill => self.manual_fill().await,
			ControlRequest::UpdateConfig { section, key, value } => {
				return match self.update_config(&section, &key, &value) {
					Ok(update) => ControlResponse::ConfigUpdated { update },
					Err(err) => err.into(),
				};
			}
			ControlRequest::Shutdown => match self.stop().await {
				Err(ControlError::NotRunning) => Ok(()),
				other => other,
			},
		};
		match result {
			Ok(()) => ControlResponse::Ok,
			Err(err) => {
				warn!(target = "slotwatch.control", error = %err, "control request failed");
				err.into()
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use serde_json::json;
	use tempfile::TempDir;

	use super::*;
	use crate::captcha::NoSolver;
	use crate::testing::{FakeFactory, RecordingNotifier, identity, script};

	fn controller(temp: &TempDir) -> (Controller, Arc<RecordingNotifier>) {
		let mut settings = Settings::default();
		settings.site.login_url = "https://visa.example.com/login".to_string();
		settings.site.email = "watcher@example.com".to_string();
		settings.site.password = "hunter2".to_string();
		settings.site.captcha_enabled = false;
		settings.identities = vec![identity("alice", "National Visa")];
		let path = temp.path().join("slotwatch.json");
		settings.save(&path).expect("save");

		let notifier = Arc::new(RecordingNotifier::default());
		let build: CollaboratorBuilder = {
			let notifier = notifier.clone();
			Arc::new(move |_settings: &Settings| -> Result<Collaborators> {
				Ok(Collaborators {
					factory: FakeFactory::new(script()),
					solver: Arc::new(NoSolver),
					notifier: notifier.clone(),
				})
			})
		};
		(Controller::new(path, settings, temp.path().join("state"), build), notifier)
	}

	#[test]
	fn requests_use_tagged_json() {
		let request: ControlRequest = serde_json::from_value(json!({
			"type": "update_config", "section": "site", "key": "poll_interval_secs", "value": "30"
		}))
		.expect("parse");
		assert_eq!(
			request,
			ControlRequest::UpdateConfig {
				section: "site".into(),
				key: "poll_interval_secs".into(),
				value: "30".into()
			}
		);
		assert_eq!(serde_json::to_value(ControlRequest::ManualFill).unwrap(), json!({ "type": "manual_fill" }));
		assert_eq!(serde_json::to_value(ControlResponse::Pong).unwrap(), json!({ "type": "pong" }));
	}

	#[tokio::test(start_paused = true)]
	async fn start_stop_and_double_start() {
		let temp = TempDir::new().expect("temp dir");
		let (mut controller, _notifier) = controller(&temp);

		assert_eq!(controller.handle(ControlRequest::Start).await, ControlResponse::Ok);
		let ControlResponse::Error { code, .. } = controller.handle(ControlRequest::Start).await else {
			panic!("second start must fail");
		};
		assert_eq!(code, "already_running");

		tokio::time::sleep(Duration::from_secs(10)).await;
		let ControlResponse::Status { status } = controller.handle(ControlRequest::Status).await else {
			panic!("status");
		};
		assert!(status.running);
		assert!(status.checks >= 1);

		assert_eq!(controller.handle(ControlRequest::Stop).await, ControlResponse::Ok);
		assert!(!controller.is_running().await);
		let status = controller.status().await;
		assert!(!status.running);
		assert_eq!(status.session, SessionState::Dead);

		let ControlResponse::Error { code, .. } = controller.handle(ControlRequest::ManualFill).await else {
			panic!("fill needs a running watcher");
		};
		assert_eq!(code, "not_running");
		assert_eq!(controller.handle(ControlRequest::Shutdown).await, ControlResponse::Ok);
	}

	#[tokio::test(start_paused = true)]
	async fn live_updates_reach_the_running_config() {
		let temp = TempDir::new().expect("temp dir");
		let (mut controller, _notifier) = controller(&temp);

		let response = controller
			.handle(ControlRequest::UpdateConfig {
				section: "site".into(),
				key: "poll_interval_secs".into(),
				value: "15".into(),
			})
			.await;
		let ControlResponse::ConfigUpdated { update } = response else {
			panic!("update accepted");
		};
		assert!(update.live);
		assert_eq!(controller.config().site.poll_interval_secs, 15);

		let response = controller
			.handle(ControlRequest::UpdateConfig {
				section: "notify".into(),
				key: "bot_token".into(),
				value: "stolen".into(),
			})
			.await;
		assert!(matches!(response, ControlResponse::Error { ref code, .. } if code == "invalid_config"));
		let persisted = Settings::load(&temp.path().join("slotwatch.json")).expect("reload");
		assert_eq!(persisted.site.poll_interval_secs, 15);
	}

	#[tokio::test(start_paused = true)]
	async fn fatal_exit_is_visible_in_status() {
		let temp = TempDir::new().expect("temp dir");
		let (mut controller, notifier) = controller(&temp);
		controller.build = Arc::new(move |_settings: &Settings| -> Result<Collaborators> {
			Ok(Collaborators {
				factory: FakeFactory::failing(script(), u32::MAX),
				solver: Arc::new(NoSolver),
				notifier: notifier.clone(),
			})
		});

		controller.start().await.expect("start");
		tokio::time::sleep(Duration::from_secs(120)).await;

		let status = controller.status().await;
		assert!(!status.running);
		assert!(status.last_error.expect("fatal reason").contains("failed to start"));
		assert!(!controller.is_running().await);
	}
}
