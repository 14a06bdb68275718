//! [`PageDriver`] over a DevTools connection to one page target.
//!
//! Elements are found by running the catalogue's selectors in the page and
//! tagging the first hit with a `data-slotwatch-handle` attribute; actions look
//! the tag up again, so a re-rendered element reads as stale.

use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use slotwatch::{Action, ActionOutput, ElementDescriptor, ElementHandle, PageDriver, PageError, PageState, SelectOption};
use slotwatch_runtime::RuntimeError;
use slotwatch_runtime::cdp::CdpConnection;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::probe;
use super::selectors::SelectorCatalog;

pub const HANDLE_ATTR: &str = "data-slotwatch-handle";

const READY_POLL: Duration = Duration::from_millis(250);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Net error codes that mean the machine is offline rather than the site failing.
const NETWORK_ERRORS: &[&str] = &[
	"ERR_INTERNET_DISCONNECTED",
	"ERR_NAME_NOT_RESOLVED",
	"ERR_NETWORK_CHANGED",
	"ERR_CONNECTION_",
	"ERR_ADDRESS_UNREACHABLE",
];

pub struct CdpPage {
	conn: CdpConnection,
	port: u16,
	browser_ws: String,
	process: Mutex<Option<Child>>,
	selectors: Arc<SelectorCatalog>,
	next_handle: AtomicU64,
}

pub(crate) fn page_error(err: RuntimeError) -> PageError {
	match &err {
		RuntimeError::ConnectionClosed | RuntimeError::WebSocket(_) => PageError::Crashed(err.to_string()),
		RuntimeError::Timeout { .. } => PageError::Unresponsive(err.to_string()),
		_ => PageError::Protocol(err.to_string()),
	}
}

fn js_string(value: &str) -> String {
	Value::String(value.to_string()).to_string()
}

pub(crate) fn locate_script(selectors: &[String], token: &str) -> String {
	let selectors = Value::from(selectors.to_vec()).to_string();
	format!(
		r#"(() => {{
	const selectors = {selectors};
	const pick = (sel) => {{
		let nodes = [];
		if (sel.startsWith('/') || sel.startsWith('(')) {{
			const snap = document.evaluate(sel, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
			for (let i = 0; i < snap.snapshotLength; i++) nodes.push(snap.snapshotItem(i));
		}} else {{
			nodes = Array.from(document.querySelectorAll(sel));
		}}
		nodes = nodes.filter((n) => n && n.nodeType === 1);
		return nodes.find((n) => n.getClientRects().length > 0) || nodes.find((n) => n.tagName === 'SELECT') || null;
	}};
	for (const sel of selectors) {{
		let el = null;
		try {{ el = pick(sel); }} catch (e) {{ continue; }}
		if (el) {{
			el.setAttribute('{HANDLE_ATTR}', {token});
			return sel;
		}}
	}}
	return null;
}})()"#,
		token = js_string(token),
	)
}

const SELECT_BODY: &str = r#"
	if (el.tagName !== 'SELECT') return { status: 'not_interactable', reason: 'not a select element' };
	const options = Array.from(el.options);
	const option = options.find((o) => o.value === wanted) || options.find((o) => o.text.trim() === wanted);
	if (!option) return { status: 'missing', reason: 'no option ' + wanted };
	el.value = option.value;
	el.dispatchEvent(new Event('input', { bubbles: true }));
	el.dispatchEvent(new Event('change', { bubbles: true }));
	return { status: 'ok' };"#;

const FILL_BODY: &str = r#"
	if (!('value' in el) || el.disabled || el.readOnly) return { status: 'not_interactable', reason: 'not an editable field' };
	el.focus();
	const descriptor = Object.getOwnPropertyDescriptor(Object.getPrototypeOf(el), 'value');
	if (descriptor && descriptor.set) descriptor.set.call(el, wanted); else el.value = wanted;
	el.dispatchEvent(new Event('input', { bubbles: true }));
	el.dispatchEvent(new Event('change', { bubbles: true }));
	el.blur();
	return { status: 'ok' };"#;

pub(crate) fn action_script(token: &str, action: &Action) -> String {
	let body = match action {
		Action::Click => r#"
	if (el.disabled) return { status: 'not_interactable', reason: 'disabled' };
	el.scrollIntoView({ block: 'center' });
	el.click();
	return { status: 'ok' };"#
			.to_string(),
		Action::Fill(value) => format!("\n\tconst wanted = {};\n\tif (el.tagName === 'SELECT') {{{SELECT_BODY}\n\t}}{FILL_BODY}", js_string(value)),
		Action::SelectValue(value) => format!("\n\tconst wanted = {};{SELECT_BODY}", js_string(value)),
		Action::SelectIndex(index) => format!(
			r#"
	if (el.tagName !== 'SELECT') return {{ status: 'not_interactable', reason: 'not a select element' }};
	if ({index} >= el.options.length) return {{ status: 'missing', reason: 'no option at index {index}' }};
	el.selectedIndex = {index};
	el.dispatchEvent(new Event('change', {{ bubbles: true }}));
	return {{ status: 'ok' }};"#
		),
		Action::ReadText => "\n\treturn { status: 'ok', value: el.innerText ?? el.textContent ?? '' };".to_string(),
		Action::ReadValue => "\n\treturn { status: 'ok', value: String(el.value ?? '') };".to_string(),
		Action::ListOptions => r#"
	if (el.tagName !== 'SELECT') return { status: 'not_interactable', reason: 'not a select element' };
	return { status: 'ok', value: Array.from(el.options).map((o) => ({ value: o.value, label: o.text.trim() })) };"#
			.to_string(),
		Action::Capture => r#"
	el.scrollIntoView({ block: 'center' });
	const r = el.getBoundingClientRect();
	if (r.width === 0 || r.height === 0) return { status: 'not_interactable', reason: 'element has no size' };
	return { status: 'ok', value: { x: r.left + window.scrollX, y: r.top + window.scrollY, width: r.width, height: r.height } };"#
			.to_string(),
	};
	let selector = js_string(&format!("[{HANDLE_ATTR}=\"{token}\"]"));
	format!("(() => {{\n\tconst el = document.querySelector({selector});\n\tif (!el) return {{ status: 'stale' }};{body}\n}})()")
}

#[derive(Debug, Deserialize)]
struct ActionReply {
	status: String,
	#[serde(default)]
	reason: Option<String>,
	#[serde(default)]
	value: Value,
}

#[derive(Debug, Deserialize)]
struct Rect {
	x: f64,
	y: f64,
	width: f64,
	height: f64,
}

impl CdpPage {
	/// Wraps an established page connection. `process` is the launched browser,
	/// `None` when attaching to one started elsewhere.
	pub fn attach(conn: CdpConnection, port: u16, browser_ws: String, process: Option<Child>, selectors: Arc<SelectorCatalog>) -> Self {
		Self {
			conn,
			port,
			browser_ws,
			process: Mutex::new(process),
			selectors,
			next_handle: AtomicU64::new(1),
		}
	}

	async fn evaluate(&self, expression: String) -> Result<Value, PageError> {
		let response = self
			.conn
			.call("Runtime.evaluate", json!({ "expression": expression, "returnByValue": true }))
			.await
			.map_err(page_error)?;
		if let Some(details) = response.get("exceptionDetails") {
			let message = details
				.pointer("/exception/description")
				.and_then(Value::as_str)
				.or_else(|| details.get("text").and_then(Value::as_str))
				.unwrap_or("script exception");
			return Err(PageError::Protocol(message.to_string()));
		}
		Ok(response.pointer("/result/value").cloned().unwrap_or(Value::Null))
	}

	async fn wait_until_loaded(&self, url: &str, deadline: Instant, timeout: Duration) -> Result<(), PageError> {
		loop {
			match self.evaluate("document.readyState".to_string()).await {
				Ok(state) if state.as_str() == Some("complete") => return Ok(()),
				Ok(_) => {}
				// the old document's context goes away mid-navigation
				Err(PageError::Protocol(message)) => trace!(target = "slotwatch.chrome", %message, "readyState probe failed"),
				Err(err) => return Err(err),
			}
			if Instant::now() + READY_POLL > deadline {
				return Err(PageError::Timeout {
					operation: format!("loading {url}"),
					timeout,
				});
			}
			tokio::time::sleep(READY_POLL).await;
		}
	}

	/// Returns `true` once the browser process is gone (or was never ours).
	fn process_exited(&self) -> bool {
		match self.process.lock().as_mut() {
			Some(child) => !matches!(child.try_wait(), Ok(None)),
			None => true,
		}
	}

	fn kill_process(&self) {
		if let Some(child) = self.process.lock().as_mut() {
			let _ = child.kill();
			let _ = child.wait();
		}
	}
}

#[async_trait]
impl PageDriver for CdpPage {
	async fn open(&self, url: &str, timeout: Duration) -> Result<(), PageError> {
		let deadline = Instant::now() + timeout;
		let response = self
			.conn
			.call_with_timeout("Page.navigate", json!({ "url": url }), timeout)
			.await
			.map_err(|err| match err {
				RuntimeError::Timeout { .. } => PageError::Timeout {
					operation: format!("navigation to {url}"),
					timeout,
				},
				other => page_error(other),
			})?;

		if let Some(error_text) = response.get("errorText").and_then(Value::as_str).filter(|t| !t.is_empty()) {
			if NETWORK_ERRORS.iter().any(|code| error_text.contains(code)) {
				return Err(PageError::Network(error_text.to_string()));
			}
			return Err(PageError::Navigation {
				url: url.to_string(),
				message: error_text.to_string(),
			});
		}

		self.wait_until_loaded(url, deadline, timeout).await?;
		debug!(target = "slotwatch.chrome", %url, "page loaded");
		Ok(())
	}

	async fn current_state(&self) -> Result<PageState, PageError> {
		let value = self
			.evaluate("({ url: location.href, title: document.title, text: document.body ? document.body.innerText : '' })".to_string())
			.await?;
		let field = |name: &str| value.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
		Ok(PageState {
			url: field("url"),
			title: field("title"),
			text: field("text"),
		})
	}

	async fn locate(&self, descriptor: ElementDescriptor) -> Result<Option<ElementHandle>, PageError> {
		let selectors = self.selectors.get(descriptor);
		if selectors.is_empty() {
			return Ok(None);
		}
		let token = format!("sw-{}", self.next_handle.fetch_add(1, Ordering::Relaxed));
		let matched = self.evaluate(locate_script(selectors, &token)).await?;
		let Some(selector) = matched.as_str() else {
			trace!(target = "slotwatch.chrome", %descriptor, "no match");
			return Ok(None);
		};
		trace!(target = "slotwatch.chrome", %descriptor, selector, %token, "located");
		Ok(Some(ElementHandle { descriptor, token }))
	}

	async fn act(&self, element: &ElementHandle, action: Action) -> Result<ActionOutput, PageError> {
		let raw = self.evaluate(action_script(&element.token, &action)).await?;
		let reply: ActionReply = serde_json::from_value(raw).map_err(|e| PageError::Protocol(format!("unexpected action reply: {e}")))?;
		let key = element.descriptor.key();
		match reply.status.as_str() {
			"ok" => {}
			"stale" => return Err(PageError::StaleElement(key)),
			"missing" => return Err(PageError::ElementNotFound(format!("{key}: {}", reply.reason.unwrap_or_default()))),
			"not_interactable" => return Err(PageError::NotInteractable(format!("{key}: {}", reply.reason.unwrap_or_default()))),
			other => return Err(PageError::Protocol(format!("unknown action status {other}"))),
		}

		match action {
			Action::Click | Action::Fill(_) | Action::SelectValue(_) | Action::SelectIndex(_) => Ok(ActionOutput::Done),
			Action::ReadText | Action::ReadValue => Ok(ActionOutput::Text(reply.value.as_str().unwrap_or_default().to_string())),
			Action::ListOptions => {
				let options = reply
					.value
					.as_array()
					.map(|items| {
						items
							.iter()
							.map(|item| SelectOption {
								value: item.get("value").and_then(Value::as_str).unwrap_or_default().to_string(),
								label: item.get("label").and_then(Value::as_str).unwrap_or_default().to_string(),
							})
							.collect()
					})
					.unwrap_or_default();
				Ok(ActionOutput::Options(options))
			}
			Action::Capture => {
				let rect: Rect = serde_json::from_value(reply.value).map_err(|e| PageError::Protocol(format!("bad element bounds: {e}")))?;
				let clip = json!({ "x": rect.x, "y": rect.y, "width": rect.width, "height": rect.height, "scale": 1 });
				let response = self
					.conn
					.call("Page.captureScreenshot", json!({ "format": "png", "clip": clip, "captureBeyondViewport": true }))
					.await
					.map_err(page_error)?;
				Ok(ActionOutput::Image(decode_image(&response)?))
			}
		}
	}

	async fn screenshot(&self) -> Result<Vec<u8>, PageError> {
		let response = self.conn.call("Page.captureScreenshot", json!({ "format": "png" })).await.map_err(page_error)?;
		decode_image(&response)
	}

	async fn is_alive(&self) -> bool {
		if self.process.lock().is_none() {
			return !self.conn.is_closed();
		}
		!self.process_exited()
	}

	async fn window_count(&self) -> Result<usize, PageError> {
		let targets = probe::list_targets(self.port)
			.await
			.map_err(|e| PageError::Unresponsive(format!("target list unavailable: {e}")))?;
		Ok(targets.iter().filter(|t| t.kind == "page").count())
	}

	async fn close(&self) -> Result<(), PageError> {
		let result = match CdpConnection::connect(&self.browser_ws, CLOSE_TIMEOUT).await {
			Ok(browser) => {
				let result = browser.call_with_timeout("Browser.close", json!({}), CLOSE_TIMEOUT).await;
				browser.close();
				result.map(|_| ())
			}
			Err(err) => Err(err),
		};
		self.conn.close();

		let deadline = Instant::now() + CLOSE_TIMEOUT;
		while !self.process_exited() && Instant::now() < deadline {
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
		if !self.process_exited() {
			debug!(target = "slotwatch.chrome", "browser ignored Browser.close, killing");
			self.kill_process();
		}

		match result {
			// the browser may drop the socket before answering
			Ok(()) | Err(RuntimeError::ConnectionClosed) => Ok(()),
			Err(err) => Err(page_error(err)),
		}
	}
}

fn decode_image(response: &Value) -> Result<Vec<u8>, PageError> {
	let data = response
		.get("data")
		.and_then(Value::as_str)
		.ok_or_else(|| PageError::Protocol("screenshot without data".to_string()))?;
	STANDARD.decode(data).map_err(|e| PageError::Protocol(format!("screenshot is not base64: {e}")))
}
