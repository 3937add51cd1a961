use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::ContactType;
use crate::error::AppError;

/// A verified-or-verifiable contact channel: exactly one of email or phone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Contact {
    Email(String),
    Phone(String),
}

impl Contact {
    /// Builds a contact from the optional request fields, enforcing email XOR phone.
    pub fn from_parts(email: Option<&str>, phone: Option<&str>) -> Result<Self, AppError> {
        let email = email.map(str::trim).filter(|s| !s.is_empty());
        let phone = phone.map(str::trim).filter(|s| !s.is_empty());
        match (email, phone) {
            (Some(email), None) => Self::email(email),
            (None, Some(phone)) => Self::phone(phone),
            (Some(_), Some(_)) => Err(AppError::ValidationError(
                "Provide either an email address or a phone number, not both".into(),
            )),
            (None, None) => Err(AppError::ValidationError("Missing required fields".into())),
        }
    }

    /// Accepts free-form sign-in input and decides which channel it names.
    pub fn parse(value: &str) -> Result<Self, AppError> {
        let value = value.trim();
        if value.contains('@') {
            Self::email(value)
        } else {
            Self::phone(value)
        }
    }

    pub fn email(value: &str) -> Result<Self, AppError> {
        let email = value.trim().to_lowercase();
        let valid = match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && domain.contains('.')
                    && !email.chars().any(char::is_whitespace)
                    && !domain.contains('@')
            }
            None => false,
        };
        if !valid {
            return Err(AppError::ValidationError("Invalid email address".into()));
        }
        Ok(Contact::Email(email))
    }

    /// Canonical E.164 form: `+` followed by the country code and number.
    /// The leading `+` is optional on input, so `15551234567` and
    /// `+1 (555) 123-4567` name the same phone.
    pub fn phone(value: &str) -> Result<Self, AppError> {
        let value = value.trim();
        let rest = value.strip_prefix('+').unwrap_or(value);
        if rest.chars().any(|c| !(c.is_ascii_digit() || "-() .".contains(c))) {
            return Err(AppError::ValidationError("Invalid phone number".into()));
        }
        let digits: String = rest.chars().filter(char::is_ascii_digit).collect();
        if !(7..=15).contains(&digits.len()) {
            return Err(AppError::ValidationError("Invalid phone number".into()));
        }
        Ok(Contact::Phone(format!("+{}", digits)))
    }

    pub fn contact_type(&self) -> ContactType {
        match self {
            Contact::Email(_) => ContactType::Email,
            Contact::Phone(_) => ContactType::Phone,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Contact::Email(v) | Contact::Phone(v) => v,
        }
    }

    /// Key under which the identity store indexes this contact.
    ///
    /// The identity store accepts either channel natively; this is the one
    /// place that decides how a contact maps to a principal.
    pub fn principal(&self) -> String {
        match self {
            Contact::Email(email) => email.clone(),
            Contact::Phone(phone) => phone.clone(),
        }
    }

    pub fn from_stored(contact_type: ContactType, value: String) -> Self {
        match contact_type {
            ContactType::Email => Contact::Email(value),
            ContactType::Phone => Contact::Phone(value),
        }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_is_normalized() {
        let contact = Contact::email("  Ann@X.com ").unwrap();
        assert_eq!(contact, Contact::Email("ann@x.com".into()));
        assert_eq!(contact.contact_type(), ContactType::Email);
    }

    #[test]
    fn test_invalid_emails_are_rejected() {
        for bad in ["", "ann", "ann@", "@x.com", "ann@x", "ann@.com", "a n@x.com"] {
            assert!(Contact::email(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_phone_is_normalized() {
        assert_eq!(
            Contact::phone("+1 (555) 123-4567").unwrap(),
            Contact::Phone("+15551234567".into())
        );
        assert!(Contact::phone("12345").is_err());
        assert!(Contact::phone("+1555abc4567").is_err());
        assert!(Contact::phone("1555+1234567").is_err());
    }

    #[test]
    fn test_phone_with_and_without_plus_is_one_contact() {
        let bare = Contact::phone("15551234567").unwrap();
        let plus = Contact::phone("+15551234567").unwrap();
        assert_eq!(bare, plus);
        assert_eq!(bare.principal(), "+15551234567");
    }

    #[test]
    fn test_from_parts_requires_exactly_one_channel() {
        assert!(Contact::from_parts(None, None).is_err());
        assert!(Contact::from_parts(Some("a@x.com"), Some("+15551234567")).is_err());
        assert!(matches!(
            Contact::from_parts(Some(""), Some("+15551234567")).unwrap(),
            Contact::Phone(_)
        ));
    }

    #[test]
    fn test_parse_picks_channel() {
        assert!(matches!(Contact::parse("a@x.com").unwrap(), Contact::Email(_)));
        assert!(matches!(Contact::parse("+15551234567").unwrap(), Contact::Phone(_)));
    }
}
