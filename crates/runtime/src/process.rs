//! Browser process helpers: port ownership and best-effort termination of
//! lingering processes.
//!
//! All helpers shell out to the platform tools (`kill`, `lsof`, `pkill` on unix,
//! `netstat`, `taskkill` on windows) and never fail hard: a missing
//! tool reads as "nothing found".

use std::process::{Command, Stdio};

use tracing::debug;

/// Returns `true` when `port` can be bound on localhost.
pub fn port_available(port: u16) -> bool {
	std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Lists the pids listening on `port` on localhost.
pub fn pids_on_port(port: u16) -> Vec<u32> {
	#[cfg(unix)]
	{
		match Command::new("lsof").args(["-ti", &format!(":{port}")]).stderr(Stdio::null()).output() {
			Ok(output) if output.status.success() => parse_pid_lines(&String::from_utf8_lossy(&output.stdout)),
			Ok(_) => Vec::new(),
			Err(err) => {
				debug!(target = "slotwatch.process", port, error = %err, "lsof unavailable");
				Vec::new()
			}
		}
	}

	#[cfg(windows)]
	{
		match Command::new("netstat").args(["-ano"]).output() {
			Ok(output) => netstat_listening_pids(&String::from_utf8_lossy(&output.stdout), port),
			Err(err) => {
				debug!(target = "slotwatch.process", port, error = %err, "netstat unavailable");
				Vec::new()
			}
		}
	}

	#[cfg(not(any(unix, windows)))]
	{
		let _ = port;
		Vec::new()
	}
}

/// Asks `pid` to terminate (`SIGTERM` on unix, forced `taskkill` on windows).
pub fn terminate(pid: u32) -> bool {
	#[cfg(unix)]
	let status = Command::new("kill").args(["-TERM", &pid.to_string()]).stderr(Stdio::null()).status();

	#[cfg(windows)]
	let status = Command::new("taskkill").args(["/PID", &pid.to_string(), "/F"]).stdout(Stdio::null()).status();

	#[cfg(not(any(unix, windows)))]
	let status: std::io::Result<std::process::ExitStatus> = Err(std::io::Error::other("unsupported platform"));

	match status {
		Ok(status) if status.success() => true,
		Ok(_) => {
			debug!(target = "slotwatch.process", pid, "terminate returned non-zero");
			false
		}
		Err(err) => {
			debug!(target = "slotwatch.process", pid, error = %err, "terminate failed");
			false
		}
	}
}

/// Terminates every process listening on `port`. Returns the pids that were signalled.
pub fn kill_port_owners(port: u16) -> Vec<u32> {
	let mut killed = Vec::new();
	for pid in pids_on_port(port) {
		if pid == std::process::id() {
			continue;
		}
		debug!(target = "slotwatch.process", pid, port, "terminating port owner");
		if terminate(pid) {
			killed.push(pid);
		}
	}
	killed
}

/// Kills every process whose image name matches one of `names`.
///
/// Returns how many names had at least one process to kill.
pub fn kill_by_name(names: &[&str]) -> usize {
	let mut matched = 0;
	for name in names {
		#[cfg(unix)]
		let status = Command::new("pkill").args(["-f", name]).stderr(Stdio::null()).status();

		#[cfg(windows)]
		let status = Command::new("taskkill")
			.args(["/F", "/IM", &format!("{name}.exe"), "/T"])
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.status();

		#[cfg(not(any(unix, windows)))]
		let status: std::io::Result<std::process::ExitStatus> = Err(std::io::Error::other("unsupported platform"));

		// pkill exits 1 when nothing matched
		if status.map(|s| s.success()).unwrap_or(false) {
			debug!(target = "slotwatch.process", name, "killed lingering processes");
			matched += 1;
		}
	}
	matched
}

#[cfg(any(test, unix))]
fn parse_pid_lines(output: &str) -> Vec<u32> {
	output.lines().filter_map(|line| line.trim().parse().ok()).collect()
}

#[cfg(any(test, windows))]
fn netstat_listening_pids(output: &str, port: u16) -> Vec<u32> {
	let suffix = format!(":{port}");
	let mut pids = Vec::new();
	for line in output.lines() {
		let parts: Vec<&str> = line.split_whitespace().collect();
		if parts.len() < 5 || !parts.contains(&"LISTENING") {
			continue;
		}
		if !parts[1].ends_with(&suffix) {
			continue;
		}
		if let Some(pid) = parts.last().and_then(|pid| pid.parse().ok()) {
			if !pids.contains(&pid) {
				pids.push(pid);
			}
		}
	}
	pids
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lsof_output_skips_garbage_lines() {
		assert_eq!(parse_pid_lines("4242\n\nnot-a-pid\n17\n"), vec![4242, 17]);
	}

	#[test]
	fn netstat_parser_matches_listening_port_only() {
		let output = "\
  Proto  Local Address          Foreign Address        State           PID
  TCP    127.0.0.1:9333         0.0.0.0:0              LISTENING       5120
  TCP    127.0.0.1:93331        0.0.0.0:0              LISTENING       6000
  TCP    127.0.0.1:51000        127.0.0.1:9333         ESTABLISHED     7000
  TCP    [::1]:9333             [::]:0                 LISTENING       5120
";
		assert_eq!(netstat_listening_pids(output, 9333), vec![5120]);
	}

	#[test]
	fn bound_port_is_reported_unavailable() {
		let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
		let port = listener.local_addr().unwrap().port();
		assert!(!port_available(port));
		drop(listener);
		assert!(port_available(port));
	}
}
