//! Subscriber setup for the binary. Library crates only emit events.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter directive for a `-v` count: warnings by default, then info, debug, trace.
pub fn default_directive(verbosity: u8) -> String {
	let level = match verbosity {
		0 => "warn",
		1 => "info",
		2 => "debug",
		_ => "trace",
	};
	format!("warn,slotwatch={level},slotwatch_runtime={level},slotwatch_cli={level}")
}

/// Installs the global subscriber. `RUST_LOG` replaces the verbosity-derived filter.
pub fn init_logging(verbosity: u8) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

	let _ = tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).try_init();
}
