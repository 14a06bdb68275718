//! Settings and fakes shared by the binary's tests.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use slotwatch::{Notifier, NotifyError, Settings};

/// Minimal valid settings rooted at `state_dir`, with no chat configured.
pub fn sample_settings(state_dir: &Path) -> Settings {
	serde_json::from_value(json!({
		"site": {
			"login_url": "https://visa.example.com/login",
			"email": "watcher@example.com",
			"password": "hunter2"
		},
		"paths": { "state_dir": state_dir },
		"identities": [
			{ "id": "alice", "first_name": "Alice", "last_name": "Liddell", "category": "National Visa" },
			{ "id": "bob", "first_name": "Bob", "last_name": "Builder", "category": "Schengen" }
		]
	}))
	.unwrap()
}

/// Keeps every text and image caption it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
	messages: Mutex<Vec<String>>,
	captions: Mutex<Vec<String>>,
}

impl RecordingNotifier {
	pub fn messages(&self) -> Vec<String> {
		self.messages.lock().clone()
	}

	pub fn captions(&self) -> Vec<String> {
		self.captions.lock().clone()
	}
}

#[async_trait]
impl Notifier for RecordingNotifier {
	async fn send(&self, text: &str) -> Result<(), NotifyError> {
		self.messages.lock().push(text.to_string());
		Ok(())
	}

	async fn send_image(&self, _image: &[u8], caption: &str) -> Result<(), NotifyError> {
		self.captions.lock().push(caption.to_string());
		Ok(())
	}
}
