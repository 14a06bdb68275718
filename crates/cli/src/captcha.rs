//! CAPTCHA solving through a local `tesseract` binary, with an operator relay
//! over the notification chat for images OCR cannot read.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use slotwatch::{CaptchaSolver, Notifier};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub struct TesseractSolver {
	binary: PathBuf,
	timeout: Duration,
}

impl TesseractSolver {
	pub fn new(binary: PathBuf) -> Self {
		Self {
			binary,
			timeout: Duration::from_secs(20),
		}
	}

	/// Finds `tesseract` on `PATH`.
	pub fn detect() -> Option<Self> {
		which::which("tesseract").ok().map(Self::new)
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}
}

/// Keeps the ASCII letters and digits of the OCR output; nothing left means unsolved.
pub(crate) fn normalize(raw: &str) -> Option<String> {
	let answer: String = raw.chars().filter(char::is_ascii_alphanumeric).collect();
	(!answer.is_empty()).then_some(answer)
}

#[async_trait]
impl CaptchaSolver for TesseractSolver {
	async fn solve(&self, image: &[u8]) -> Option<String> {
		let mut file = match tempfile::Builder::new().prefix("captcha_").suffix(".png").tempfile() {
			Ok(file) => file,
			Err(err) => {
				warn!(target = "slotwatch.captcha", error = %err, "cannot create temp image");
				return None;
			}
		};
		if let Err(err) = file.write_all(image).and_then(|()| file.flush()) {
			warn!(target = "slotwatch.captcha", error = %err, "cannot write temp image");
			return None;
		}
		let path = file.into_temp_path();

		let run = Command::new(&self.binary)
			.arg(path.as_os_str())
			.arg("stdout")
			.args(["--psm", "8"])
			.kill_on_drop(true)
			.output();
		let output = match tokio::time::timeout(self.timeout, run).await {
			Ok(Ok(output)) => output,
			Ok(Err(err)) => {
				warn!(target = "slotwatch.captcha", binary = %self.binary.display(), error = %err, "tesseract failed to run");
				return None;
			}
			Err(_) => {
				warn!(target = "slotwatch.captcha", timeout_secs = self.timeout.as_secs(), "tesseract timed out");
				return None;
			}
		};
		if !output.status.success() {
			debug!(target = "slotwatch.captcha", status = %output.status, "tesseract exited with failure");
			return None;
		}

		let answer = normalize(&String::from_utf8_lossy(&output.stdout));
		debug!(target = "slotwatch.captcha", solved = answer.is_some(), "captcha processed");
		answer
	}
}

/// Rendezvous between a waiting [`RelaySolver`] and the chat command that
/// carries the operator's answer. Only the most recent request is answerable.
#[derive(Clone, Default)]
pub struct CaptchaAnswers {
	pending: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl CaptchaAnswers {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a new request, replacing any earlier one.
	pub(crate) fn expect(&self) -> oneshot::Receiver<String> {
		let (tx, rx) = oneshot::channel();
		*self.pending.lock() = Some(tx);
		rx
	}

	/// Hands `answer` to the waiting solver. `false` when nothing is waiting.
	pub fn answer(&self, answer: String) -> bool {
		match self.pending.lock().take() {
			Some(tx) => tx.send(answer).is_ok(),
			None => false,
		}
	}
}

/// Falls back to asking the operator when `primary` cannot read the image.
pub struct RelaySolver {
	primary: Arc<dyn CaptchaSolver>,
	notifier: Arc<dyn Notifier>,
	answers: CaptchaAnswers,
	wait: Duration,
}

impl RelaySolver {
	pub fn new(primary: Arc<dyn CaptchaSolver>, notifier: Arc<dyn Notifier>, answers: CaptchaAnswers, wait: Duration) -> Self {
		Self {
			primary,
			notifier,
			answers,
			wait,
		}
	}
}

#[async_trait]
impl CaptchaSolver for RelaySolver {
	async fn solve(&self, image: &[u8]) -> Option<String> {
		if let Some(answer) = self.primary.solve(image).await {
			return Some(answer);
		}

		let reply = self.answers.expect();
		let caption = format!("Captcha needs an answer: reply /captcha <text> within {}s", self.wait.as_secs());
		if let Err(err) = self.notifier.send_image(image, &caption).await {
			warn!(target = "slotwatch.captcha", error = %err, "cannot send captcha to the operator");
			return None;
		}
		info!(target = "slotwatch.captcha", wait_secs = self.wait.as_secs(), "waiting for the operator's captcha answer");

		match tokio::time::timeout(self.wait, reply).await {
			Ok(Ok(answer)) => normalize(&answer),
			Ok(Err(_)) => {
				debug!(target = "slotwatch.captcha", "captcha request superseded");
				None
			}
			Err(_) => {
				warn!(target = "slotwatch.captcha", "no captcha answer from the operator");
				None
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use slotwatch::NoSolver;

	use super::*;
	use crate::fixtures::RecordingNotifier;

	struct Fixed(&'static str);

	#[async_trait]
	impl CaptchaSolver for Fixed {
		async fn solve(&self, _image: &[u8]) -> Option<String> {
			Some(self.0.to_string())
		}
	}

	fn relay(primary: Arc<dyn CaptchaSolver>, notifier: Arc<RecordingNotifier>, answers: &CaptchaAnswers) -> RelaySolver {
		RelaySolver::new(primary, notifier, answers.clone(), Duration::from_secs(120))
	}

	#[test]
	fn ocr_noise_is_stripped() {
		assert_eq!(normalize(" aB3 x-9\n\x0c").as_deref(), Some("aB3x9"));
		assert_eq!(normalize("  \n").as_deref(), None);
		assert_eq!(normalize("¿ñ?").as_deref(), None);
	}

	#[tokio::test]
	async fn missing_binary_is_unsolved() {
		let solver = TesseractSolver::new(PathBuf::from("/nonexistent/tesseract"));
		assert_eq!(solver.solve(b"png").await, None);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn failing_binary_is_unsolved() {
		let solver = TesseractSolver::new(PathBuf::from("false")).with_timeout(Duration::from_secs(5));
		assert_eq!(solver.solve(b"png").await, None);
	}

	#[tokio::test]
	async fn ocr_answer_skips_the_operator() {
		let notifier = Arc::new(RecordingNotifier::default());
		let answers = CaptchaAnswers::new();

		let answer = relay(Arc::new(Fixed("x7k2")), notifier.clone(), &answers).solve(b"png").await;

		assert_eq!(answer.as_deref(), Some("x7k2"));
		assert!(notifier.captions().is_empty());
		assert!(!answers.answer("late".to_string()));
	}

	#[tokio::test]
	async fn operator_answer_is_used_when_ocr_fails() {
		let notifier = Arc::new(RecordingNotifier::default());
		let answers = CaptchaAnswers::new();
		let solver = relay(Arc::new(NoSolver), notifier.clone(), &answers);

		let operator = async {
			while notifier.captions().is_empty() {
				tokio::task::yield_now().await;
			}
			assert!(answers.answer(" Ab 12 ".to_string()));
		};
		let (answer, ()) = tokio::join!(solver.solve(b"png"), operator);

		assert_eq!(answer.as_deref(), Some("Ab12"));
		assert!(notifier.captions()[0].contains("/captcha"));
	}

	#[tokio::test(start_paused = true)]
	async fn silent_operator_leaves_the_captcha_unsolved() {
		let notifier = Arc::new(RecordingNotifier::default());
		let answers = CaptchaAnswers::new();

		let answer = relay(Arc::new(NoSolver), notifier.clone(), &answers).solve(b"png").await;

		assert_eq!(answer, None);
		assert_eq!(notifier.captions().len(), 1);
	}
}
