use async_trait::async_trait;

/// Turns a CAPTCHA image into its answer text.
///
/// `None` means "unsolved": the login attempt is abandoned and classified as a
/// rejected CAPTCHA.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
	async fn solve(&self, image: &[u8]) -> Option<String>;
}

/// Solver used when automatic solving is disabled. Always unsolved.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSolver;

#[async_trait]
impl CaptchaSolver for NoSolver {
	async fn solve(&self, _image: &[u8]) -> Option<String> {
		None
	}
}
