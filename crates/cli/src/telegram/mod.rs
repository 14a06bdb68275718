//! Telegram Bot API notifier, plus a log-only fallback when no bot is configured.
//!
//! The same bot also carries operator commands back to the watcher, see
//! [`CommandPoller`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use slotwatch::config::NotifySettings;
use slotwatch::{Notifier, NotifyError};
use tracing::info;

use crate::error::{CliError, Result};

mod commands;

pub use commands::{ChatCommand, CommandPoller, parse_command};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Long-poll window for `getUpdates`; stays below [`REQUEST_TIMEOUT`].
const LONG_POLL_SECS: u64 = 20;
/// Telegram rejects photo captions longer than this.
const CAPTION_LIMIT: usize = 1024;

pub struct TelegramNotifier {
	client: Client,
	api_base: String,
	token: String,
	chat_id: String,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
	chat_id: &'a str,
	text: &'a str,
	disable_web_page_preview: bool,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiReply<T = serde::de::IgnoredAny> {
	ok: bool,
	#[serde(default)]
	result: Option<T>,
	#[serde(default)]
	description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Update {
	pub update_id: i64,
	#[serde(default)]
	pub message: Option<ChatMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChatMessage {
	pub chat: Chat,
	#[serde(default)]
	pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Chat {
	pub id: i64,
}

impl TelegramNotifier {
	pub fn new(settings: &NotifySettings) -> Result<Self> {
		let client = Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()
			.map_err(|e| CliError::Context(format!("Failed to create HTTP client: {e}")))?;
		Ok(Self {
			client,
			api_base: settings.api_base.trim_end_matches('/').to_string(),
			token: settings.bot_token.trim().to_string(),
			chat_id: settings.chat_id.trim().to_string(),
		})
	}

	fn endpoint(&self, method: &str) -> String {
		format!("{}/bot{}/{method}", self.api_base, self.token)
	}

	pub(crate) fn chat_id(&self) -> &str {
		&self.chat_id
	}

	async fn check(response: reqwest::Response) -> Result<(), NotifyError> {
		Self::parse::<serde::de::IgnoredAny>(response).await.map(|_| ())
	}

	async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<Option<T>, NotifyError> {
		let status = response.status();
		let body = response.text().await.map_err(|e| NotifyError::Transport(e.to_string()))?;
		let reply: Option<ApiReply<T>> = serde_json::from_str(&body).ok();
		match reply {
			Some(reply) if status.is_success() && reply.ok => Ok(reply.result),
			Some(reply) => Err(NotifyError::Rejected(reply.description.unwrap_or_else(|| status.to_string()))),
			None => Err(NotifyError::Rejected(format!("{status}: {body}"))),
		}
	}

	/// Long-polls for chat updates newer than `offset`.
	pub(crate) async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, NotifyError> {
		let mut query = vec![("timeout", LONG_POLL_SECS.to_string())];
		if let Some(offset) = offset {
			query.push(("offset", offset.to_string()));
		}
		let response = self
			.client
			.get(self.endpoint("getUpdates"))
			.query(&query)
			.send()
			.await
			.map_err(|e| NotifyError::Transport(format!("Failed to poll Telegram updates: {}", e.without_url())))?;
		Ok(Self::parse::<Vec<Update>>(response).await?.unwrap_or_default())
	}
}

fn truncate(text: &str, limit: usize) -> &str {
	match text.char_indices().nth(limit) {
		Some((index, _)) => &text[..index],
		None => text,
	}
}

#[async_trait]
impl Notifier for TelegramNotifier {
	async fn send(&self, text: &str) -> Result<(), NotifyError> {
		let request = SendMessageRequest {
			chat_id: &self.chat_id,
			text,
			disable_web_page_preview: true,
		};
		let response = self
			.client
			.post(self.endpoint("sendMessage"))
			.json(&request)
			.send()
			.await
			.map_err(|e| NotifyError::Transport(format!("Failed to send Telegram message: {}", e.without_url())))?;
		Self::check(response).await
	}

	async fn send_image(&self, image: &[u8], caption: &str) -> Result<(), NotifyError> {
		let photo = Part::bytes(image.to_vec())
			.file_name("screenshot.png")
			.mime_str("image/png")
			.map_err(|e| NotifyError::Transport(e.to_string()))?;
		let form = Form::new()
			.text("chat_id", self.chat_id.clone())
			.text("caption", truncate(caption, CAPTION_LIMIT).to_string())
			.part("photo", photo);
		let response = self
			.client
			.post(self.endpoint("sendPhoto"))
			.multipart(form)
			.send()
			.await
			.map_err(|e| NotifyError::Transport(format!("Failed to send Telegram photo: {}", e.without_url())))?;
		Self::check(response).await
	}
}

/// Writes notifications to the log instead of a chat.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
	async fn send(&self, text: &str) -> Result<(), NotifyError> {
		info!(target = "slotwatch.notify", %text, "notification");
		Ok(())
	}

	async fn send_image(&self, image: &[u8], caption: &str) -> Result<(), NotifyError> {
		info!(target = "slotwatch.notify", caption, bytes = image.len(), "image notification");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_http;

	fn notifier(port: u16) -> TelegramNotifier {
		TelegramNotifier::new(&NotifySettings {
			bot_token: "123:abc".to_string(),
			chat_id: "-100200300".to_string(),
			api_base: format!("http://127.0.0.1:{port}/"),
			..NotifySettings::default()
		})
		.unwrap()
	}

	#[tokio::test]
	async fn message_is_posted_to_the_bot_endpoint() {
		let (port, server) = test_http::serve(vec![(200, r#"{"ok":true,"result":{}}"#.to_string())]).await;

		notifier(port).send("Slot found: 2025-03-01").await.unwrap();

		let requests = server.await.unwrap();
		assert_eq!(requests[0].request_line, "POST /bot123:abc/sendMessage HTTP/1.1");
		let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
		assert_eq!(body["chat_id"], "-100200300");
		assert_eq!(body["text"], "Slot found: 2025-03-01");
	}

	#[tokio::test]
	async fn api_rejection_carries_the_description() {
		let (port, _server) = test_http::serve(vec![(400, r#"{"ok":false,"description":"Bad Request: chat not found"}"#.to_string())]).await;

		let err = notifier(port).send("hello").await.unwrap_err();

		assert!(matches!(err, NotifyError::Rejected(ref m) if m == "Bad Request: chat not found"), "got {err:?}");
	}

	#[tokio::test]
	async fn photo_goes_out_as_multipart() {
		let (port, server) = test_http::serve(vec![(200, r#"{"ok":true}"#.to_string())]).await;

		notifier(port).send_image(b"\x89PNG", "Could not book 2025-03-01").await.unwrap();

		let requests = server.await.unwrap();
		assert_eq!(requests[0].request_line, "POST /bot123:abc/sendPhoto HTTP/1.1");
		assert!(requests[0].body.contains("name=\"caption\""));
		assert!(requests[0].body.contains("Could not book 2025-03-01"));
		assert!(requests[0].body.contains("filename=\"screenshot.png\""));
	}

	#[tokio::test]
	async fn updates_are_polled_from_the_offset() {
		let body = r#"{"ok":true,"result":[
			{"update_id":41,"message":{"message_id":1,"chat":{"id":-100200300,"type":"group"},"text":"/status"}},
			{"update_id":42,"edited_message":{"message_id":1,"chat":{"id":-100200300,"type":"group"}}}
		]}"#;
		let (port, server) = test_http::serve(vec![(200, body.to_string())]).await;

		let updates = notifier(port).get_updates(Some(41)).await.unwrap();

		let requests = server.await.unwrap();
		assert_eq!(requests[0].request_line, "GET /bot123:abc/getUpdates?timeout=20&offset=41 HTTP/1.1");
		assert_eq!(updates.len(), 2);
		let message = updates[0].message.as_ref().unwrap();
		assert_eq!(message.chat.id, -100200300);
		assert_eq!(message.text.as_deref(), Some("/status"));
		assert!(updates[1].message.is_none());
	}

	#[tokio::test]
	async fn empty_update_batch_is_not_an_error() {
		let (port, server) = test_http::serve(vec![(200, r#"{"ok":true,"result":[]}"#.to_string())]).await;

		let updates = notifier(port).get_updates(None).await.unwrap();

		assert!(updates.is_empty());
		assert_eq!(server.await.unwrap()[0].request_line, "GET /bot123:abc/getUpdates?timeout=20 HTTP/1.1");
	}

	#[test]
	fn captions_are_cut_on_char_boundaries() {
		assert_eq!(truncate("ab€d", 3), "ab€");
		assert_eq!(truncate("short", 1024), "short");
	}
}
