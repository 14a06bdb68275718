use std::path::Path;

use slotwatch::{ControlRequest, ControlResponse};

use super::load_settings;
use crate::cli::CtlAction;
use crate::control::{Endpoint, send_request};
use crate::error::{CliError, Result};

pub async fn execute(settings_path: &Path, action: CtlAction) -> Result<()> {
	let settings = load_settings(settings_path)?;
	let endpoint = Endpoint::from_settings(&settings);

	let Some(response) = send_request(&endpoint, ControlRequest::from(action)).await? else {
		return Err(CliError::NotRunning(endpoint.describe()));
	};
	println!("{}", serde_json::to_string_pretty(&response)?);

	match response {
		ControlResponse::Error { code, message } => Err(CliError::Context(format!("watcher refused the command ({code}): {message}"))),
		_ => Ok(()),
	}
}
