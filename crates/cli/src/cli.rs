use std::path::PathBuf;

use clap::{Parser, Subcommand};
use slotwatch::ControlRequest;

#[derive(Parser, Debug)]
#[command(name = "slotwatch")]
#[command(about = "Unattended appointment-slot watcher")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug, -vvv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Settings file (defaults to the per-user config directory)
	#[arg(short, long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run the watcher in the foreground and serve the control socket
	Run {
		/// Serve the control socket without starting the watcher
		#[arg(long)]
		paused: bool,
	},

	/// Send one command to a running watcher
	Ctl {
		#[command(subcommand)]
		action: CtlAction,
	},

	/// Validate the settings file and list the identities
	CheckConfig,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CtlAction {
	/// Check that the watcher process answers
	Ping,
	/// Start watching
	Start,
	/// Stop watching; the process keeps serving commands
	Stop,
	/// Print counters, session state and budgets
	Status,
	/// Fill the booking form at the next poll
	Fill,
	/// Change one settings key, e.g. `set site poll_interval_secs 30`
	Set { section: String, key: String, value: String },
	/// Stop watching and end the process
	Shutdown,
}

impl From<CtlAction> for ControlRequest {
	fn from(action: CtlAction) -> Self {
		match action {
			CtlAction::Ping => ControlRequest::Ping,
			CtlAction::Start => ControlRequest::Start,
			CtlAction::Stop => ControlRequest::Stop,
			CtlAction::Status => ControlRequest::Status,
			CtlAction::Fill => ControlRequest::ManualFill,
			CtlAction::Set { section, key, value } => ControlRequest::UpdateConfig { section, key, value },
			CtlAction::Shutdown => ControlRequest::Shutdown,
		}
	}
}

#[cfg(test)]
mod tests {
	use clap::Parser;

	use super::*;

	#[test]
	fn set_maps_onto_update_config() {
		let cli = Cli::try_parse_from(["slotwatch", "-vv", "ctl", "set", "site", "poll_interval_secs", "30"]).unwrap();
		assert_eq!(cli.verbose, 2);
		let Commands::Ctl { action } = cli.command else {
			panic!("expected ctl");
		};
		assert_eq!(
			ControlRequest::from(action),
			ControlRequest::UpdateConfig {
				section: "site".into(),
				key: "poll_interval_secs".into(),
				value: "30".into(),
			}
		);
	}

	#[test]
	fn config_flag_is_global() {
		let cli = Cli::try_parse_from(["slotwatch", "run", "--paused", "--config", "/tmp/watch.json"]).unwrap();
		assert_eq!(cli.config, Some(PathBuf::from("/tmp/watch.json")));
		assert!(matches!(cli.command, Commands::Run { paused: true }));
	}

	#[test]
	fn fill_is_a_manual_fill_request() {
		let cli = Cli::try_parse_from(["slotwatch", "ctl", "fill"]).unwrap();
		let Commands::Ctl { action } = cli.command else {
			panic!("expected ctl");
		};
		assert_eq!(ControlRequest::from(action), ControlRequest::ManualFill);
	}
}
