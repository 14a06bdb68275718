use std::path::Path;
use std::sync::Arc;

use slotwatch::{CollaboratorBuilder, ControlError, Controller, Settings};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{build_collaborators, load_settings};
use crate::captcha::CaptchaAnswers;
use crate::control::{ControlServer, Endpoint};
use crate::error::{CliError, Result};
use crate::paths;
use crate::telegram::{CommandPoller, TelegramNotifier};

pub async fn execute(settings_path: &Path, paused: bool) -> Result<()> {
	let settings = load_settings(settings_path)?;
	let endpoint = Endpoint::from_settings(&settings);
	let mut server = ControlServer::bind(&endpoint).await?;
	let auto_start = settings.control.auto_start && !paused;

	let answers = CaptchaAnswers::new();
	let poller = if settings.notify.is_configured() {
		let (tx, rx) = mpsc::channel(8);
		server = server.with_remote(rx);
		let bot = Arc::new(TelegramNotifier::new(&settings.notify)?);
		Some(tokio::spawn(CommandPoller::new(bot, tx, answers.clone()).run()))
	} else {
		None
	};

	let build: CollaboratorBuilder = {
		let answers = answers.clone();
		Arc::new(move |settings: &Settings| build_collaborators(settings, &answers))
	};
	let mut controller = Controller::new(settings_path.to_path_buf(), settings, paths::default_state_dir(), build);
	info!(target = "slotwatch.control", endpoint = %endpoint.describe(), "control channel ready");

	if auto_start {
		controller
			.start()
			.await
			.map_err(|e| CliError::Context(format!("watcher failed to start: {e}")))?;
	}

	let served = server.run(&mut controller, shutdown_signal()).await;
	if let Some(poller) = poller {
		poller.abort();
	}
	served?;

	match controller.stop().await {
		Ok(()) | Err(ControlError::NotRunning) => {}
		Err(err) => warn!(target = "slotwatch.control", error = %err, "stop during shutdown failed"),
	}
	info!(target = "slotwatch.control", "exiting");
	Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};

		match signal(SignalKind::terminate()) {
			Ok(mut term) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = term.recv() => {}
				}
				return;
			}
			Err(err) => warn!(target = "slotwatch.control", error = %err, "cannot listen for SIGTERM"),
		}
	}

	if let Err(err) = tokio::signal::ctrl_c().await {
		warn!(target = "slotwatch.control", error = %err, "cannot listen for Ctrl-C");
		std::future::pending::<()>().await;
	}
}
