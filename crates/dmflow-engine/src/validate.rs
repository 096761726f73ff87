//! Type-specific validation for collected free-text answers.

use regex::Regex;

use dmflow_core::error::{DmFlowError, Result};
use dmflow_core::types::FieldType;

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

/// Outcome of validating one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The cleaned, normalized value to store.
    Valid(String),
    Invalid,
}

/// Validate and normalize a free-text answer for a field type. `custom`
/// is the node's configured validation regex, only consulted for
/// [`FieldType::Custom`].
pub fn validate(field: FieldType, raw: &str, custom: Option<&str>) -> Result<Validation> {
    let value = raw.trim();

    match field {
        FieldType::Email => {
            let re = Regex::new(EMAIL_PATTERN)
                .map_err(|e| DmFlowError::Config(format!("email pattern: {}", e)))?;
            if re.is_match(value) {
                Ok(Validation::Valid(value.to_lowercase()))
            } else {
                Ok(Validation::Invalid)
            }
        }
        FieldType::Phone => {
            // Strip formatting, keep digits and a leading +.
            let cleaned: String = value.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
            if cleaned.len() >= 7 {
                Ok(Validation::Valid(cleaned))
            } else {
                Ok(Validation::Invalid)
            }
        }
        FieldType::Name => {
            if (1..=100).contains(&value.len()) {
                Ok(Validation::Valid(title_case(value)))
            } else {
                Ok(Validation::Invalid)
            }
        }
        FieldType::Custom => match custom {
            Some(pattern) => {
                let re = Regex::new(pattern)
                    .map_err(|e| DmFlowError::Config(format!("validation pattern: {}", e)))?;
                if re.is_match(value) {
                    Ok(Validation::Valid(value.to_string()))
                } else {
                    Ok(Validation::Invalid)
                }
            }
            None if value.is_empty() => Ok(Validation::Invalid),
            None => Ok(Validation::Valid(value.to_string())),
        },
    }
}

/// Re-prompt text for an invalid answer. The node's configured message
/// wins over the per-field default.
pub fn error_prompt(field: FieldType, configured: Option<&str>) -> String {
    if let Some(msg) = configured {
        if !msg.is_empty() {
            return msg.to_string();
        }
    }
    match field {
        FieldType::Email => {
            "That doesn't look like a valid email. Please enter a valid email address.".to_string()
        }
        FieldType::Phone => "Please enter a valid phone number.".to_string(),
        FieldType::Name => "Please enter your name.".to_string(),
        FieldType::Custom => "Please try again.".to_string(),
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut boundary = true;
    for c in s.chars() {
        if c.is_alphabetic() {
            if boundary {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            boundary = false;
        } else {
            out.push(c);
            boundary = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_requires_tld_and_lowercases() {
        assert_eq!(
            validate(FieldType::Email, "abc@def", None).unwrap(),
            Validation::Invalid
        );
        assert_eq!(
            validate(FieldType::Email, " ABC@Def.com ", None).unwrap(),
            Validation::Valid("abc@def.com".into())
        );
    }

    #[test]
    fn phone_strips_formatting() {
        assert_eq!(
            validate(FieldType::Phone, "+49 (155) 112-2334", None).unwrap(),
            Validation::Valid("+491551122334".into())
        );
        assert_eq!(
            validate(FieldType::Phone, "12-34", None).unwrap(),
            Validation::Invalid
        );
    }

    #[test]
    fn name_is_title_cased() {
        assert_eq!(
            validate(FieldType::Name, "ada lovelace", None).unwrap(),
            Validation::Valid("Ada Lovelace".into())
        );
        assert_eq!(
            validate(FieldType::Name, "", None).unwrap(),
            Validation::Invalid
        );
    }

    #[test]
    fn custom_regex_and_fallbacks() {
        assert_eq!(
            validate(FieldType::Custom, "AB-12", Some(r"^[A-Z]{2}-\d{2}$")).unwrap(),
            Validation::Valid("AB-12".into())
        );
        assert_eq!(
            validate(FieldType::Custom, "nope", Some(r"^[A-Z]{2}-\d{2}$")).unwrap(),
            Validation::Invalid
        );
        // No pattern: any non-empty value passes.
        assert_eq!(
            validate(FieldType::Custom, "anything", None).unwrap(),
            Validation::Valid("anything".into())
        );
        assert!(validate(FieldType::Custom, "x", Some("(broken")).is_err());
    }

    #[test]
    fn configured_error_message_wins() {
        assert_eq!(
            error_prompt(FieldType::Email, Some("Try an email like a@b.com")),
            "Try an email like a@b.com"
        );
        assert!(error_prompt(FieldType::Phone, None).contains("phone"));
    }
}
