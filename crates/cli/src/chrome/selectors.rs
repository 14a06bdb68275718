//! Selector catalogue: ordered CSS or XPath candidates per logical element.
//!
//! A selector starting with `/` or `(` is evaluated as XPath, anything else as
//! CSS. Entries under `selectors` in the settings replace the built-in list for
//! their key.

use std::collections::BTreeMap;

use slotwatch::{ElementDescriptor, FormField};

#[derive(Debug, Clone)]
pub struct SelectorCatalog {
	entries: BTreeMap<String, Vec<String>>,
}

fn list(items: &[&str]) -> Vec<String> {
	items.iter().map(|s| s.to_string()).collect()
}

fn builtin(key: &str) -> Vec<String> {
	match key {
		"cookie_reject" => list(&["#onetrust-reject-all-handler", "//button[contains(text(), 'Reject')]"]),
		"email_input" => list(&["#EmailId", "input[name='EmailId']", "input[type='email']", "input[name*='email' i]"]),
		"password_input" => list(&["#Password", "input[name='Password']", "input[type='password']"]),
		"captcha_image" => list(&["#CaptchaImage", "img.captcha-image", "img[src*='captcha' i]"]),
		"captcha_input" => list(&["#CaptchaInputText", "input[name='CaptchaInputText']", "input[name*='captcha' i]"]),
		"login_submit" => list(&["#btnSubmit", "#btnLogin", "form button[type='submit']", "form input[type='submit']"]),
		"booking_entry" => list(&[
			"//a[contains(text(), 'Schedule Appointment')]",
			"//a[contains(text(), 'Book Appointment')]",
			"//a[contains(text(), 'Start New Booking')]",
		]),
		"category_select" => list(&["#VisaCategoryId", "select[name='VisaCategoryId']"]),
		"no_availability_notice" => list(&[
			"//*[contains(text(), 'no appointment slots')]",
			"//*[contains(text(), 'No slots available')]",
			"//*[contains(text(), 'no open seats')]",
		]),
		"availability_marker" => list(&["#lblDate", "#dvEarliestDateLnk"]),
		"earliest_slot" => list(&["#dvEarliestDateLnk", "//a[contains(@id, 'EarliestDate')]", "//button[contains(@id, 'EarliestDate')]"]),
		"time_slot_select" => list(&["#TimeSlotId", "select[name='TimeSlotId']"]),
		"confirm_button" => list(&["#btnConfirm", "//button[contains(text(), 'Confirm')]", "input[type='submit'][value='Confirm']"]),
		_ => Vec::new(),
	}
}

fn form_field(field: FormField) -> Vec<String> {
	let name = match field {
		FormField::FirstName => "FirstName",
		FormField::LastName => "LastName",
		FormField::Gender => "GenderId",
		FormField::DateOfBirth => "DateOfBirth",
		FormField::Nationality => "NationalityId",
		FormField::PassportNumber => "PassportNumber",
		FormField::PassportValidUntil => "PassportExpiryDate",
		FormField::ContactPhone => "Mobile",
		FormField::ContactEmail => "validateEmailId",
		FormField::ApplicationRef => "ApplicationReference",
	};
	vec![format!("#{name}"), format!("[name='{name}']"), format!("[name='{}' i]", field.key().replace('_', ""))]
}

impl SelectorCatalog {
	pub fn new(overrides: &BTreeMap<String, Vec<String>>) -> Self {
		let mut entries = BTreeMap::new();
		let keys = [
			ElementDescriptor::CookieReject,
			ElementDescriptor::EmailInput,
			ElementDescriptor::PasswordInput,
			ElementDescriptor::CaptchaImage,
			ElementDescriptor::CaptchaInput,
			ElementDescriptor::LoginSubmit,
			ElementDescriptor::BookingEntry,
			ElementDescriptor::CategorySelect,
			ElementDescriptor::NoAvailabilityNotice,
			ElementDescriptor::AvailabilityMarker,
			ElementDescriptor::EarliestSlot,
			ElementDescriptor::TimeSlotSelect,
			ElementDescriptor::ConfirmButton,
		];
		for descriptor in keys {
			let key = descriptor.key();
			let selectors = builtin(&key);
			entries.insert(key, selectors);
		}
		for field in FormField::ALL {
			entries.insert(ElementDescriptor::FormField(field).key(), form_field(field));
		}

		for (key, selectors) in overrides {
			let selectors: Vec<String> = selectors.iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
			if !selectors.is_empty() {
				entries.insert(key.trim().to_lowercase(), selectors);
			}
		}
		Self { entries }
	}

	pub fn get(&self, descriptor: ElementDescriptor) -> &[String] {
		self.entries.get(&descriptor.key()).map(Vec::as_slice).unwrap_or(&[])
	}
}

impl Default for SelectorCatalog {
	fn default() -> Self {
		Self::new(&BTreeMap::new())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn every_descriptor_has_candidates() {
		let catalog = SelectorCatalog::default();
		assert_eq!(catalog.get(ElementDescriptor::CategorySelect)[0], "#VisaCategoryId");
		for field in FormField::ALL {
			assert!(!catalog.get(ElementDescriptor::FormField(field)).is_empty(), "{}", field.key());
		}
	}

	#[test]
	fn overrides_replace_the_builtin_list() {
		let mut overrides = BTreeMap::new();
		overrides.insert("Availability_Marker".to_string(), vec!["#slotDate".to_string(), " ".to_string()]);
		overrides.insert("email_input".to_string(), vec![]);
		let catalog = SelectorCatalog::new(&overrides);

		assert_eq!(catalog.get(ElementDescriptor::AvailabilityMarker), ["#slotDate".to_string()]);
		assert_eq!(catalog.get(ElementDescriptor::EmailInput)[0], "#EmailId");
	}
}
