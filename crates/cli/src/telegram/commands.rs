//! Operator commands received through the bot chat.
//!
//! Only messages from the configured chat are obeyed. Each command is turned
//! into a [`ControlRequest`] and handed to the control server, and the answer
//! goes back to the chat as plain text.

use std::sync::Arc;
use std::time::Duration;

use slotwatch::{ControlRequest, ControlResponse, Notifier};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{ChatMessage, TelegramNotifier};
use crate::captcha::CaptchaAnswers;
use crate::control::RemoteRequest;

/// Pause after a failed poll.
const RETRY_DELAY: Duration = Duration::from_secs(5);

const HELP: &str = "\
/start - start watching
/quit - stop watching
/status - current counters
/fill - book for the current identity now
/setting <section> <key> <value> - change one setting
/captcha <text> - answer a pending captcha
/help - this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
	Control(ControlRequest),
	CaptchaAnswer(String),
	Help,
}

/// Reads a `/command args` message. Anything that is not a known command is
/// `None`; a known command with missing arguments reads as `Help`.
pub fn parse_command(text: &str) -> Option<ChatCommand> {
	let mut words = text.split_whitespace();
	let head = words.next()?.strip_prefix('/')?;
	// Group chats address commands as `/status@my_bot`.
	let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

	let command = match name.as_str() {
		"start" => ChatCommand::Control(ControlRequest::Start),
		"quit" | "stop" => ChatCommand::Control(ControlRequest::Stop),
		"status" | "stat" => ChatCommand::Control(ControlRequest::Status),
		"fill" => ChatCommand::Control(ControlRequest::ManualFill),
		"setting" => {
			let (Some(section), Some(key)) = (words.next(), words.next()) else {
				return Some(ChatCommand::Help);
			};
			let value = words.collect::<Vec<_>>().join(" ");
			if value.is_empty() {
				return Some(ChatCommand::Help);
			}
			ChatCommand::Control(ControlRequest::UpdateConfig {
				section: section.to_string(),
				key: key.to_string(),
				value,
			})
		}
		"captcha" => {
			let answer: String = words.collect();
			if answer.is_empty() {
				return Some(ChatCommand::Help);
			}
			ChatCommand::CaptchaAnswer(answer)
		}
		"help" => ChatCommand::Help,
		_ => return None,
	};
	Some(command)
}

fn describe(response: ControlResponse) -> String {
	match response {
		ControlResponse::Pong => "pong".to_string(),
		ControlResponse::Ok => "Done.".to_string(),
		ControlResponse::Status { status } => status.report(),
		ControlResponse::ConfigUpdated { update } => {
			let when = if update.live { "" } else { " (applies at the next start)" };
			format!("{}.{} set to {}{when}", update.section, update.key, update.value)
		}
		ControlResponse::Error { message, .. } => format!("Failed: {message}"),
	}
}

/// Long-polls the bot for commands and forwards them to the control server.
pub struct CommandPoller {
	bot: Arc<TelegramNotifier>,
	requests: mpsc::Sender<RemoteRequest>,
	answers: CaptchaAnswers,
}

impl CommandPoller {
	pub fn new(bot: Arc<TelegramNotifier>, requests: mpsc::Sender<RemoteRequest>, answers: CaptchaAnswers) -> Self {
		Self { bot, requests, answers }
	}

	/// Polls until the task is dropped.
	pub async fn run(self) {
		info!(target = "slotwatch.telegram", "listening for chat commands");
		let mut offset = None;
		loop {
			match self.bot.get_updates(offset).await {
				Ok(updates) => {
					for update in updates {
						offset = Some(update.update_id + 1);
						if let Some(message) = update.message {
							self.handle(message).await;
						}
					}
				}
				Err(err) => {
					warn!(target = "slotwatch.telegram", error = %err, "polling chat updates failed");
					tokio::time::sleep(RETRY_DELAY).await;
				}
			}
		}
	}

	async fn handle(&self, message: ChatMessage) {
		if message.chat.id.to_string() != self.bot.chat_id() {
			debug!(target = "slotwatch.telegram", chat = message.chat.id, "ignoring message from another chat");
			return;
		}
		let Some(command) = message.text.as_deref().and_then(parse_command) else {
			return;
		};
		debug!(target = "slotwatch.telegram", ?command, "chat command received");

		let reply = self.execute(command).await;
		if let Err(err) = self.bot.send(&reply).await {
			warn!(target = "slotwatch.telegram", error = %err, "cannot answer chat command");
		}
	}

	async fn execute(&self, command: ChatCommand) -> String {
		match command {
			ChatCommand::Help => HELP.to_string(),
			ChatCommand::CaptchaAnswer(answer) => {
				if self.answers.answer(answer) {
					"Captcha answer passed on.".to_string()
				} else {
					"No captcha is waiting for an answer.".to_string()
				}
			}
			ChatCommand::Control(request) => {
				let (reply, response) = oneshot::channel();
				if self.requests.send(RemoteRequest { request, reply }).await.is_err() {
					return "Watcher is shutting down.".to_string();
				}
				match response.await {
					Ok(response) => describe(response),
					Err(_) => "Watcher is shutting down.".to_string(),
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use slotwatch::config::NotifySettings;

	use super::super::Chat;
	use super::*;
	use crate::test_http;

	#[test]
	fn commands_map_onto_control_requests() {
		assert_eq!(parse_command("/start"), Some(ChatCommand::Control(ControlRequest::Start)));
		assert_eq!(parse_command("/quit"), Some(ChatCommand::Control(ControlRequest::Stop)));
		assert_eq!(parse_command("/stat@slot_bot"), Some(ChatCommand::Control(ControlRequest::Status)));
		assert_eq!(parse_command("  /FILL "), Some(ChatCommand::Control(ControlRequest::ManualFill)));
		assert_eq!(
			parse_command("/setting timer poll_interval_secs 45"),
			Some(ChatCommand::Control(ControlRequest::UpdateConfig {
				section: "timer".to_string(),
				key: "poll_interval_secs".to_string(),
				value: "45".to_string(),
			}))
		);
		assert_eq!(parse_command("/captcha x7 k2"), Some(ChatCommand::CaptchaAnswer("x7k2".to_string())));
	}

	#[test]
	fn incomplete_commands_ask_for_help() {
		assert_eq!(parse_command("/setting timer"), Some(ChatCommand::Help));
		assert_eq!(parse_command("/captcha"), Some(ChatCommand::Help));
		assert_eq!(parse_command("/help"), Some(ChatCommand::Help));
	}

	#[test]
	fn chatter_is_not_a_command() {
		assert_eq!(parse_command("good morning"), None);
		assert_eq!(parse_command("/reboot"), None);
		assert_eq!(parse_command(""), None);
	}

	fn poller(port: u16, answers: CaptchaAnswers) -> (CommandPoller, mpsc::Receiver<RemoteRequest>) {
		let bot = TelegramNotifier::new(&NotifySettings {
			bot_token: "123:abc".to_string(),
			chat_id: "-100200300".to_string(),
			api_base: format!("http://127.0.0.1:{port}"),
			..NotifySettings::default()
		})
		.unwrap();
		let (tx, rx) = mpsc::channel(4);
		(CommandPoller::new(Arc::new(bot), tx, answers), rx)
	}

	fn message(chat: i64, text: &str) -> ChatMessage {
		ChatMessage {
			chat: Chat { id: chat },
			text: Some(text.to_string()),
		}
	}

	#[tokio::test]
	async fn command_from_the_chat_is_forwarded_and_answered() {
		let (port, server) = test_http::serve(vec![(200, r#"{"ok":true,"result":{}}"#.to_string())]).await;
		let (poller, mut requests) = poller(port, CaptchaAnswers::new());

		let control = async {
			let remote = requests.recv().await.unwrap();
			assert_eq!(remote.request, ControlRequest::Stop);
			remote.reply.send(ControlResponse::Ok).unwrap();
		};
		tokio::join!(poller.handle(message(-100200300, "/quit")), control);

		let sent = server.await.unwrap();
		assert_eq!(sent[0].request_line, "POST /bot123:abc/sendMessage HTTP/1.1");
		assert!(sent[0].body.contains("Done."));
	}

	#[tokio::test]
	async fn other_chats_are_ignored() {
		let (poller, mut requests) = poller(9, CaptchaAnswers::new());

		poller.handle(message(555, "/start")).await;

		assert!(requests.try_recv().is_err());
	}

	#[tokio::test]
	async fn captcha_reply_reaches_the_waiting_solver() {
		let (port, server) = test_http::serve(vec![(200, r#"{"ok":true}"#.to_string())]).await;
		let answers = CaptchaAnswers::new();
		let (poller, _requests) = poller(port, answers.clone());
		let waiting = answers.expect();

		poller.handle(message(-100200300, "/captcha Ab12")).await;

		assert_eq!(waiting.await.unwrap(), "Ab12");
		assert!(server.await.unwrap()[0].body.contains("Captcha answer passed on."));
	}

	#[test]
	fn failure_reply_carries_the_message() {
		let reply = describe(ControlResponse::Error {
			code: "not_running".to_string(),
			message: "watcher is not running".to_string(),
		});
		assert_eq!(reply, "Failed: watcher is not running");
	}
}
