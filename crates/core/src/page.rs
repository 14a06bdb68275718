//! The page-interaction boundary.
//!
//! The core never talks to a browser directly. It opens URLs, reads page state,
//! locates logical elements and acts on them through [`PageDriver`], and obtains
//! drivers from a [`BrowserFactory`]. Every call returns a typed [`PageError`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PageError;

/// Form fields the manual-fill flow knows how to populate from an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormField {
	FirstName,
	LastName,
	Gender,
	DateOfBirth,
	Nationality,
	PassportNumber,
	PassportValidUntil,
	ContactPhone,
	ContactEmail,
	ApplicationRef,
}

impl FormField {
	pub const ALL: [FormField; 10] = [
		FormField::FirstName,
		FormField::LastName,
		FormField::Gender,
		FormField::DateOfBirth,
		FormField::Nationality,
		FormField::PassportNumber,
		FormField::PassportValidUntil,
		FormField::ContactPhone,
		FormField::ContactEmail,
		FormField::ApplicationRef,
	];

	pub fn key(self) -> &'static str {
		match self {
			FormField::FirstName => "first_name",
			FormField::LastName => "last_name",
			FormField::Gender => "gender",
			FormField::DateOfBirth => "date_of_birth",
			FormField::Nationality => "nationality",
			FormField::PassportNumber => "passport_number",
			FormField::PassportValidUntil => "passport_valid_until",
			FormField::ContactPhone => "contact_phone",
			FormField::ContactEmail => "contact_email",
			FormField::ApplicationRef => "application_ref",
		}
	}
}

/// Logical page elements, resolved to concrete selectors by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementDescriptor {
	CookieReject,
	EmailInput,
	PasswordInput,
	CaptchaImage,
	CaptchaInput,
	LoginSubmit,
	BookingEntry,
	CategorySelect,
	NoAvailabilityNotice,
	AvailabilityMarker,
	EarliestSlot,
	TimeSlotSelect,
	ConfirmButton,
	FormField(FormField),
}

impl ElementDescriptor {
	/// Key used in the selector catalogue.
	pub fn key(&self) -> String {
		let fixed = match self {
			ElementDescriptor::CookieReject => "cookie_reject",
			ElementDescriptor::EmailInput => "email_input",
			ElementDescriptor::PasswordInput => "password_input",
			ElementDescriptor::CaptchaImage => "captcha_image",
			ElementDescriptor::CaptchaInput => "captcha_input",
			ElementDescriptor::LoginSubmit => "login_submit",
			ElementDescriptor::BookingEntry => "booking_entry",
			ElementDescriptor::CategorySelect => "category_select",
			ElementDescriptor::NoAvailabilityNotice => "no_availability_notice",
			ElementDescriptor::AvailabilityMarker => "availability_marker",
			ElementDescriptor::EarliestSlot => "earliest_slot",
			ElementDescriptor::TimeSlotSelect => "time_slot_select",
			ElementDescriptor::ConfirmButton => "confirm_button",
			ElementDescriptor::FormField(field) => return format!("form_field.{}", field.key()),
		};
		fixed.to_string()
	}
}

impl fmt::Display for ElementDescriptor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.key())
	}
}

/// Opaque reference to a located element. Only valid until the page changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
	pub descriptor: ElementDescriptor,
	pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
	Click,
	Fill(String),
	SelectValue(String),
	SelectIndex(usize),
	ReadText,
	ReadValue,
	ListOptions,
	/// Screenshot clipped to the element.
	Capture,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOption {
	pub value: String,
	pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutput {
	Done,
	Text(String),
	Options(Vec<SelectOption>),
	Image(Vec<u8>),
}

impl ActionOutput {
	pub fn into_text(self) -> Option<String> {
		match self {
			ActionOutput::Text(text) => Some(text),
			_ => None,
		}
	}

	pub fn into_options(self) -> Option<Vec<SelectOption>> {
		match self {
			ActionOutput::Options(options) => Some(options),
			_ => None,
		}
	}

	pub fn into_image(self) -> Option<Vec<u8>> {
		match self {
			ActionOutput::Image(bytes) => Some(bytes),
			_ => None,
		}
	}
}

/// Snapshot of the current page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageState {
	pub url: String,
	pub title: String,
	/// Visible text of the document body.
	pub text: String,
}

impl PageState {
	pub fn contains_any(&self, needles: &[String]) -> Option<String> {
		let haystack = self.text.to_lowercase();
		needles.iter().find(|needle| haystack.contains(&needle.to_lowercase())).cloned()
	}
}

/// One browser window with a single page, plus the process-level probes the
/// session health check needs.
#[async_trait]
pub trait PageDriver: Send + Sync {
	async fn open(&self, url: &str, timeout: Duration) -> Result<(), PageError>;

	async fn current_state(&self) -> Result<PageState, PageError>;

	async fn locate(&self, descriptor: ElementDescriptor) -> Result<Option<ElementHandle>, PageError>;

	async fn act(&self, element: &ElementHandle, action: Action) -> Result<ActionOutput, PageError>;

	async fn screenshot(&self) -> Result<Vec<u8>, PageError>;

	/// Whether the browser process still exists.
	async fn is_alive(&self) -> bool;

	async fn window_count(&self) -> Result<usize, PageError>;

	/// Graceful close. Callers follow up with [`BrowserFactory::cleanup`].
	async fn close(&self) -> Result<(), PageError>;
}

#[async_trait]
pub trait BrowserFactory: Send + Sync {
	async fn launch(&self) -> Result<Box<dyn PageDriver>, PageError>;

	/// Best-effort removal of lingering browser processes and caches. Never fails.
	async fn cleanup(&self);
}
