pub mod check_config;
pub mod ctl;
pub mod run;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use slotwatch::{CaptchaSolver, Collaborators, NoSolver, Notifier, Settings, WatchError};
use tracing::warn;

use crate::captcha::{CaptchaAnswers, RelaySolver, TesseractSolver};
use crate::chrome::ChromeFactory;
use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};
use crate::paths;
use crate::telegram::{LogNotifier, TelegramNotifier};

pub async fn dispatch(cli: Cli) -> Result<()> {
	let settings_path = paths::settings_path(cli.config.as_deref());
	match cli.command {
		Commands::Run { paused } => run::execute(&settings_path, paused).await,
		Commands::Ctl { action } => ctl::execute(&settings_path, action).await,
		Commands::CheckConfig => check_config::execute(&settings_path),
	}
}

pub(crate) fn load_settings(path: &Path) -> Result<Settings> {
	if !path.exists() {
		return Err(CliError::SettingsMissing(path.to_path_buf()));
	}
	Ok(Settings::load(path)?)
}

/// Concrete browser, solver and notifier for one watcher run. With a bot
/// configured, captchas OCR cannot read are relayed to the chat and answered
/// through `answers`.
pub fn build_collaborators(settings: &Settings, answers: &CaptchaAnswers) -> slotwatch::Result<Collaborators> {
	let notifier: Arc<dyn Notifier> = if settings.notify.is_configured() {
		Arc::new(TelegramNotifier::new(&settings.notify).map_err(|e| WatchError::Config(e.to_string()))?)
	} else {
		warn!(target = "slotwatch.notify", "no Telegram bot configured, notifications go to the log");
		Arc::new(LogNotifier)
	};

	let relay = settings.notify.is_configured() && settings.notify.captcha_reply_secs > 0;
	let ocr: Arc<dyn CaptchaSolver> = match (settings.site.captcha_enabled, TesseractSolver::detect()) {
		(false, _) => Arc::new(NoSolver),
		(true, Some(solver)) => Arc::new(solver),
		(true, None) if relay => {
			warn!(target = "slotwatch.captcha", "tesseract not found on PATH, every captcha goes to the chat");
			Arc::new(NoSolver)
		}
		(true, None) => {
			warn!(target = "slotwatch.captcha", "tesseract not found on PATH, captchas stay unsolved");
			Arc::new(NoSolver)
		}
	};
	let solver: Arc<dyn CaptchaSolver> = if settings.site.captcha_enabled && relay {
		let wait = Duration::from_secs(settings.notify.captcha_reply_secs);
		Arc::new(RelaySolver::new(ocr, Arc::clone(&notifier), answers.clone(), wait))
	} else {
		ocr
	};

	Ok(Collaborators {
		factory: Arc::new(ChromeFactory::new(settings)),
		solver,
		notifier,
	})
}
