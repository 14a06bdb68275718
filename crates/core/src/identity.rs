use std::fmt;

use serde::{Deserialize, Serialize};

use crate::page::FormField;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl fmt::Display for IdentityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// One applicant on whose behalf the site is watched.
///
/// `category` doubles as the resource key for availability records, so two
/// identities watching the same category share one notification history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub id: IdentityId,
	pub first_name: String,
	pub last_name: String,
	pub category: String,
	#[serde(default)]
	pub appointment_type: Option<String>,
	#[serde(default)]
	pub gender: Option<String>,
	#[serde(default)]
	pub date_of_birth: Option<String>,
	#[serde(default)]
	pub nationality: Option<String>,
	#[serde(default)]
	pub passport_number: Option<String>,
	#[serde(default)]
	pub passport_valid_until: Option<String>,
	#[serde(default)]
	pub contact_phone: Option<String>,
	#[serde(default)]
	pub contact_email: Option<String>,
	#[serde(default)]
	pub application_ref: Option<String>,
	/// Attempt to book the first slot as soon as new availability is detected.
	#[serde(default)]
	pub claim_on_find: bool,
}

impl Identity {
	pub fn display_name(&self) -> String {
		format!("{} {}", self.first_name, self.last_name)
	}

	pub fn resource(&self) -> &str {
		&self.category
	}

	/// Value to type into `field`, if this identity has one.
	pub fn form_value(&self, field: FormField) -> Option<&str> {
		let value = match field {
			FormField::FirstName => Some(&self.first_name),
			FormField::LastName => Some(&self.last_name),
			FormField::Gender => self.gender.as_ref(),
			FormField::DateOfBirth => self.date_of_birth.as_ref(),
			FormField::Nationality => self.nationality.as_ref(),
			FormField::PassportNumber => self.passport_number.as_ref(),
			FormField::PassportValidUntil => self.passport_valid_until.as_ref(),
			FormField::ContactPhone => self.contact_phone.as_ref(),
			FormField::ContactEmail => self.contact_email.as_ref(),
			FormField::ApplicationRef => self.application_ref.as_ref(),
		};
		value.map(String::as_str).filter(|v| !v.trim().is_empty())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn optional_fields_default_when_missing() {
		let identity: Identity = serde_json::from_value(serde_json::json!({
			"id": "p1",
			"first_name": "Ana",
			"last_name": "Lee",
			"category": "National Visa"
		}))
		.expect("minimal identity");

		assert!(!identity.claim_on_find);
		assert_eq!(identity.resource(), "National Visa");
		assert_eq!(identity.form_value(FormField::FirstName), Some("Ana"));
		assert_eq!(identity.form_value(FormField::PassportNumber), None);
	}

	#[test]
	fn blank_values_are_not_filled() {
		let mut identity: Identity = serde_json::from_value(serde_json::json!({
			"id": "p1", "first_name": "Ana", "last_name": "Lee", "category": "c"
		}))
		.unwrap();
		identity.contact_phone = Some("  ".to_string());
		assert_eq!(identity.form_value(FormField::ContactPhone), None);
	}
}
