//! DevTools HTTP endpoints: `/json/version`, `/json/list` and `/json/new`.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CliError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_millis(400);

/// `/json/version` response subset.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpVersionInfo {
	#[serde(rename = "webSocketDebuggerUrl")]
	pub web_socket_debugger_url: String,
	#[serde(rename = "Browser")]
	pub browser: Option<String>,
}

/// One `/json/list` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInfo {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(rename = "webSocketDebuggerUrl", default)]
	pub web_socket_debugger_url: Option<String>,
}

fn client() -> Result<reqwest::Client> {
	reqwest::Client::builder()
		.timeout(PROBE_TIMEOUT)
		.build()
		.map_err(|e| CliError::Context(format!("Failed to create HTTP client: {e}")))
}

fn hosts(port: u16) -> [String; 3] {
	[
		format!("http://127.0.0.1:{port}"),
		format!("http://localhost:{port}"),
		format!("http://[::1]:{port}"),
	]
}

/// Resolves the browser websocket endpoint from `/json/version` on `port`.
pub async fn fetch_cdp_endpoint(port: u16) -> Result<CdpVersionInfo> {
	let client = client()?;
	let mut last_error = "no response".to_string();

	for base in hosts(port) {
		let response = match client.get(format!("{base}/json/version")).send().await {
			Ok(r) => r,
			Err(e) => {
				last_error = e.to_string();
				continue;
			}
		};

		if !response.status().is_success() {
			last_error = format!("unexpected status {}", response.status());
			continue;
		}

		return response
			.json()
			.await
			.map_err(|e| CliError::Context(format!("Failed to parse CDP response: {e}")));
	}

	Err(CliError::Context(format!("Failed to connect to port {port}: {last_error}")))
}

pub async fn list_targets(port: u16) -> Result<Vec<TargetInfo>> {
	let response = client()?.get(format!("http://127.0.0.1:{port}/json/list")).send().await?;
	if !response.status().is_success() {
		return Err(CliError::Context(format!("/json/list returned {}", response.status())));
	}
	Ok(response.json().await?)
}

/// Websocket URL of the first page target, opening a blank tab when there is none.
pub async fn page_target(port: u16) -> Result<String> {
	if let Some(url) = first_page(&list_targets(port).await?) {
		return Ok(url);
	}

	// newer Chrome versions reject GET on /json/new
	let response = client()?.put(format!("http://127.0.0.1:{port}/json/new?about:blank")).send().await?;
	if !response.status().is_success() {
		return Err(CliError::Context(format!("/json/new returned {}", response.status())));
	}
	let target: TargetInfo = response.json().await?;
	target
		.web_socket_debugger_url
		.ok_or_else(|| CliError::Context("new page target has no debugger URL".to_string()))
}

pub(crate) fn first_page(targets: &[TargetInfo]) -> Option<String> {
	targets
		.iter()
		.filter(|t| t.kind == "page")
		.find_map(|t| t.web_socket_debugger_url.clone())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_http;

	#[tokio::test]
	async fn version_probe_reads_the_debugger_url() {
		let body = r#"{"Browser":"Chrome/126.0","webSocketDebuggerUrl":"ws://127.0.0.1:9333/devtools/browser/abc"}"#;
		let (port, server) = test_http::serve(vec![(200, body.to_string())]).await;

		let info = fetch_cdp_endpoint(port).await.unwrap();

		assert_eq!(info.web_socket_debugger_url, "ws://127.0.0.1:9333/devtools/browser/abc");
		assert_eq!(info.browser.as_deref(), Some("Chrome/126.0"));
		let requests = server.await.unwrap();
		assert_eq!(requests[0].request_line, "GET /json/version HTTP/1.1");
	}

	#[tokio::test]
	async fn missing_page_target_opens_a_blank_tab() {
		let list = r#"[{"type":"service_worker","url":"chrome://x","webSocketDebuggerUrl":"ws://sw"}]"#;
		let created = r#"{"type":"page","url":"about:blank","webSocketDebuggerUrl":"ws://127.0.0.1/devtools/page/new"}"#;
		let (port, server) = test_http::serve(vec![(200, list.to_string()), (200, created.to_string())]).await;

		let url = page_target(port).await.unwrap();

		assert_eq!(url, "ws://127.0.0.1/devtools/page/new");
		let requests = server.await.unwrap();
		assert!(requests[1].request_line.starts_with("PUT /json/new?about:blank"));
	}

	#[test]
	fn first_page_skips_other_target_kinds() {
		let targets: Vec<TargetInfo> = serde_json::from_str(
			r#"[
				{"type":"background_page","webSocketDebuggerUrl":"ws://bg"},
				{"type":"page","url":"https://visa.example.com"},
				{"type":"page","url":"about:blank","webSocketDebuggerUrl":"ws://page"}
			]"#,
		)
		.unwrap();
		assert_eq!(first_page(&targets).as_deref(), Some("ws://page"));
	}
}
