//! Chrome/Chromium executable discovery.

use std::path::{Path, PathBuf};

/// Resolves the browser binary: the configured path or command first, then the
/// platform's usual install locations.
pub fn find_chrome_executable(configured: Option<&str>) -> Option<PathBuf> {
	if let Some(configured) = configured.map(str::trim).filter(|c| !c.is_empty()) {
		return resolve_candidate(configured);
	}
	platform_candidates().iter().find_map(|candidate| resolve_candidate(candidate))
}

fn resolve_candidate(candidate: &str) -> Option<PathBuf> {
	if looks_like_path(candidate) {
		let path = Path::new(candidate);
		return path.exists().then(|| path.to_path_buf());
	}
	which::which(candidate).ok()
}

fn looks_like_path(candidate: &str) -> bool {
	candidate.starts_with('/') || candidate.contains('\\') || candidate.contains(':')
}

fn platform_candidates() -> Vec<String> {
	if cfg!(target_os = "macos") {
		[
			"/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
			"/Applications/Chromium.app/Contents/MacOS/Chromium",
			"/Applications/Google Chrome Canary.app/Contents/MacOS/Google Chrome Canary",
		]
		.map(str::to_string)
		.to_vec()
	} else if cfg!(target_os = "windows") {
		windows_browser_candidates()
	} else {
		[
			"google-chrome-stable",
			"google-chrome",
			"chromium-browser",
			"chromium",
			"/usr/bin/google-chrome-stable",
			"/usr/bin/google-chrome",
			"/usr/bin/chromium-browser",
			"/usr/bin/chromium",
			"/snap/bin/chromium",
		]
		.map(str::to_string)
		.to_vec()
	}
}

pub(crate) fn windows_browser_candidates() -> Vec<String> {
	let mut roots: Vec<PathBuf> = ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"]
		.into_iter()
		.filter_map(|key| std::env::var(key).ok())
		.map(PathBuf::from)
		.collect();
	if roots.is_empty() {
		roots.push(PathBuf::from(r"C:\Program Files"));
		roots.push(PathBuf::from(r"C:\Program Files (x86)"));
	}

	let suffixes: &[&[&str]] = &[&["Google", "Chrome", "Application", "chrome.exe"], &["Chromium", "Application", "chrome.exe"]];

	let mut candidates = Vec::new();
	for root in roots {
		for suffix in suffixes {
			let path: PathBuf = suffix.iter().fold(root.clone(), |path, component| path.join(component));
			candidates.push(path.to_string_lossy().to_string());
		}
	}
	candidates.extend(["chrome", "chrome.exe", "chromium", "chromium.exe"].map(str::to_string));
	candidates
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn windows_candidates_end_with_plain_commands() {
		let candidates = windows_browser_candidates();
		assert!(candidates.iter().any(|c| c.ends_with("chrome.exe") && c.contains("Google")));
		assert_eq!(candidates.last().map(String::as_str), Some("chromium.exe"));
	}

	#[test]
	fn configured_path_must_exist() {
		let temp = tempfile::TempDir::new().unwrap();
		let binary = temp.path().join("chrome");
		assert_eq!(find_chrome_executable(Some(binary.to_str().unwrap())), None);

		std::fs::write(&binary, "").unwrap();
		assert_eq!(find_chrome_executable(Some(binary.to_str().unwrap())), Some(binary));
	}

	#[test]
	fn unknown_configured_command_is_not_replaced_by_a_fallback() {
		assert_eq!(find_chrome_executable(Some("definitely-not-a-browser-binary")), None);
	}
}
