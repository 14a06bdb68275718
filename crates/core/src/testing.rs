//! Scripted collaborators for unit and scenario tests.
//!
//! [`FakeFactory`] hands out [`FakePage`]s that all share one [`PageScript`], so a
//! test can keep steering the "site" across session rebuilds.
//!
//! The fake site works like this: opening any URL shows the login page; clicking
//! `login_submit` replaces the page text with the next scripted login response
//! (or [`LOGGED_IN_TEXT`] once the script runs dry); each lookup of
//! `no_availability_notice` starts a new poll and pops the next scripted marker
//! (`None` = banner shown), repeating the last one forever.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::captcha::CaptchaSolver;
use crate::error::{NotifyError, PageError};
use crate::identity::{Identity, IdentityId};
use crate::notify::Notifier;
use crate::page::{Action, ActionOutput, BrowserFactory, ElementDescriptor, ElementHandle, PageDriver, PageState, SelectOption};

pub const LOGGED_IN_TEXT: &str = "Welcome back. Book an appointment. Logout";
pub const LOGIN_PAGE_TEXT: &str = "Sign in to your account";

pub fn identity(id: &str, category: &str) -> Identity {
	Identity {
		id: IdentityId(id.to_string()),
		first_name: format!("First-{id}"),
		last_name: "Tester".to_string(),
		category: category.to_string(),
		appointment_type: None,
		gender: Some("Female".to_string()),
		date_of_birth: Some("1990-01-01".to_string()),
		nationality: None,
		passport_number: Some(format!("P{id}")),
		passport_valid_until: None,
		contact_phone: None,
		contact_email: Some(format!("{id}@example.com")),
		application_ref: None,
		claim_on_find: false,
	}
}

pub struct PageScript {
	pub alive: bool,
	pub windows: usize,
	pub url: String,
	pub title: String,
	pub text: String,
	pub login_responses: VecDeque<String>,
	pub markers: VecDeque<Option<String>>,
	pub current_marker: Option<String>,
	pub category: String,
	/// The category select ignores submissions.
	pub category_locked: bool,
	pub missing: HashSet<ElementDescriptor>,
	pub locate_errors: HashMap<ElementDescriptor, VecDeque<PageError>>,
	pub open_errors: VecDeque<PageError>,
	pub time_options: Vec<SelectOption>,
	pub captcha_image: Vec<u8>,
	/// Every act call, in order.
	pub actions: Vec<(ElementDescriptor, Action)>,
	pub opened: Vec<String>,
	pub closes: u32,
	pub polls: u32,
}

impl Default for PageScript {
	fn default() -> Self {
		Self {
			alive: true,
			windows: 1,
			url: String::new(),
			title: String::new(),
			text: String::new(),
			login_responses: VecDeque::new(),
			markers: VecDeque::new(),
			current_marker: None,
			category: String::new(),
			category_locked: false,
			missing: HashSet::new(),
			locate_errors: HashMap::new(),
			open_errors: VecDeque::new(),
			time_options: vec![
				SelectOption {
					value: String::new(),
					label: "--Select--".to_string(),
				},
				SelectOption {
					value: "slot-0930".to_string(),
					label: "09:30".to_string(),
				},
			],
			captcha_image: b"\x89PNG captcha".to_vec(),
			actions: Vec::new(),
			opened: Vec::new(),
			closes: 0,
			polls: 0,
		}
	}
}

pub type SharedScript = Arc<Mutex<PageScript>>;

pub fn script() -> SharedScript {
	Arc::new(Mutex::new(PageScript::default()))
}

pub struct FakePage {
	script: SharedScript,
}

impl FakePage {
	fn crashed(&self) -> Option<PageError> {
		(!self.script.lock().alive).then(|| PageError::Crashed("fake browser is gone".to_string()))
	}
}

#[async_trait]
impl PageDriver for FakePage {
	async fn open(&self, url: &str, _timeout: std::time::Duration) -> Result<(), PageError> {
		if let Some(err) = self.crashed() {
			return Err(err);
		}
		let mut script = self.script.lock();
		script.opened.push(url.to_string());
		if let Some(err) = script.open_errors.pop_front() {
			return Err(err);
		}
		script.url = url.to_string();
		script.title = "Appointments".to_string();
		script.text = if url == "about:blank" { String::new() } else { LOGIN_PAGE_TEXT.to_string() };
		Ok(())
	}

	async fn current_state(&self) -> Result<PageState, PageError> {
		if let Some(err) = self.crashed() {
			return Err(err);
		}
		let script = self.script.lock();
		Ok(PageState {
			url: script.url.clone(),
			title: script.title.clone(),
			text: script.text.clone(),
		})
	}

	async fn locate(&self, descriptor: ElementDescriptor) -> Result<Option<ElementHandle>, PageError> {
		if let Some(err) = self.crashed() {
			return Err(err);
		}
		let mut script = self.script.lock();
		if let Some(err) = script.locate_errors.get_mut(&descriptor).and_then(VecDeque::pop_front) {
			return Err(err);
		}
		if script.missing.contains(&descriptor) {
			return Ok(None);
		}

		let present = match descriptor {
			ElementDescriptor::NoAvailabilityNotice => {
				script.polls += 1;
				if let Some(next) = script.markers.pop_front() {
					script.current_marker = next;
				}
				script.current_marker.is_none()
			}
			ElementDescriptor::AvailabilityMarker | ElementDescriptor::EarliestSlot => script.current_marker.is_some(),
			_ => true,
		};
		Ok(present.then(|| ElementHandle {
			descriptor,
			token: descriptor.key(),
		}))
	}

	async fn act(&self, element: &ElementHandle, action: Action) -> Result<ActionOutput, PageError> {
		if let Some(err) = self.crashed() {
			return Err(err);
		}
		let mut script = self.script.lock();
		script.actions.push((element.descriptor, action.clone()));

		let output = match (element.descriptor, action) {
			(ElementDescriptor::LoginSubmit, Action::Click) => {
				script.text = script.login_responses.pop_front().unwrap_or_else(|| LOGGED_IN_TEXT.to_string());
				ActionOutput::Done
			}
			(ElementDescriptor::CategorySelect, Action::ReadValue) => ActionOutput::Text(script.category.clone()),
			(ElementDescriptor::CategorySelect, Action::SelectValue(value)) => {
				if !script.category_locked {
					script.category = value;
				}
				ActionOutput::Done
			}
			(ElementDescriptor::AvailabilityMarker, Action::ReadText) => ActionOutput::Text(script.current_marker.clone().unwrap_or_default()),
			(ElementDescriptor::TimeSlotSelect, Action::ListOptions) => ActionOutput::Options(script.time_options.clone()),
			(ElementDescriptor::CaptchaImage, Action::Capture) => ActionOutput::Image(script.captcha_image.clone()),
			(_, Action::ReadText | Action::ReadValue) => ActionOutput::Text(String::new()),
			_ => ActionOutput::Done,
		};
		Ok(output)
	}

	async fn screenshot(&self) -> Result<Vec<u8>, PageError> {
		Ok(b"\x89PNG page".to_vec())
	}

	async fn is_alive(&self) -> bool {
		self.script.lock().alive
	}

	async fn window_count(&self) -> Result<usize, PageError> {
		Ok(self.script.lock().windows)
	}

	async fn close(&self) -> Result<(), PageError> {
		let mut script = self.script.lock();
		script.closes += 1;
		script.alive = false;
		script.windows = 0;
		Ok(())
	}
}

pub struct FakeFactory {
	pub script: SharedScript,
	pub launches: AtomicU32,
	pub cleanups: AtomicU32,
	/// Launches that fail before one succeeds; `u32::MAX` fails forever.
	pub failures_left: Mutex<u32>,
}

impl FakeFactory {
	pub fn new(script: SharedScript) -> Arc<Self> {
		Arc::new(Self {
			script,
			launches: AtomicU32::new(0),
			cleanups: AtomicU32::new(0),
			failures_left: Mutex::new(0),
		})
	}

	pub fn failing(script: SharedScript, failures: u32) -> Arc<Self> {
		let factory = Self::new(script);
		*factory.failures_left.lock() = failures;
		factory
	}

	pub fn launches(&self) -> u32 {
		self.launches.load(Ordering::SeqCst)
	}

	pub fn cleanups(&self) -> u32 {
		self.cleanups.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl BrowserFactory for FakeFactory {
	async fn launch(&self) -> Result<Box<dyn PageDriver>, PageError> {
		self.launches.fetch_add(1, Ordering::SeqCst);
		{
			let mut left = self.failures_left.lock();
			if *left > 0 {
				if *left != u32::MAX {
					*left -= 1;
				}
				return Err(PageError::Crashed("fake launch failure".to_string()));
			}
		}
		{
			let mut script = self.script.lock();
			script.alive = true;
			script.windows = 1;
		}
		Ok(Box::new(FakePage {
			script: Arc::clone(&self.script),
		}))
	}

	async fn cleanup(&self) {
		self.cleanups.fetch_add(1, Ordering::SeqCst);
	}
}

#[derive(Default)]
pub struct RecordingNotifier {
	pub messages: Mutex<Vec<String>>,
	pub images: Mutex<Vec<String>>,
}

impl RecordingNotifier {
	pub fn messages(&self) -> Vec<String> {
		self.messages.lock().clone()
	}

	pub fn count_containing(&self, needle: &str) -> usize {
		self.messages.lock().iter().filter(|m| m.contains(needle)).count()
	}
}

#[async_trait]
impl Notifier for RecordingNotifier {
	async fn send(&self, text: &str) -> Result<(), NotifyError> {
		self.messages.lock().push(text.to_string());
		Ok(())
	}

	async fn send_image(&self, _image: &[u8], caption: &str) -> Result<(), NotifyError> {
		self.images.lock().push(caption.to_string());
		Ok(())
	}
}

pub struct FixedSolver(pub Option<String>);

#[async_trait]
impl CaptchaSolver for FixedSolver {
	async fn solve(&self, _image: &[u8]) -> Option<String> {
		self.0.clone()
	}
}
