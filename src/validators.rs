/// Input validators for account data
/// Features:
/// 1. DoS Protection: input length limits
/// 2. Email and username format checks
/// 3. SQL Injection Prevention: pattern screening of email addresses

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ValidationError;

const MAX_EMAIL_LENGTH: usize = 254; // RFC 5321
const MIN_EMAIL_LENGTH: usize = 5;
const MIN_USERNAME_LENGTH: usize = 3;
const MAX_USERNAME_LENGTH: usize = 32;
const MAX_DISPLAY_NAME_LENGTH: usize = 256;
const MAX_DEVICE_LENGTH: usize = 128;

lazy_static! {
    // RFC 5322 simplified email regex (practical validation)
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$"
    ).unwrap();

    // Letters, digits, dot, dash and underscore; must start with a letter or digit
    static ref USERNAME_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*$").unwrap();

    static ref SQL_INJECTION_PATTERNS: [Regex; 4] = [
        Regex::new(r"(?i)\s+UNION\s+").unwrap(),
        Regex::new(r"(--|;|/\*|\*/)").unwrap(),
        Regex::new(r"(?i);\s*(INSERT|UPDATE|DELETE|DROP|CREATE|ALTER)").unwrap(),
        Regex::new(r#"(?i)(\bOR\b|\bAND\b)\s*(['"][0-9]*['"]|[0-9]*)\s*=\s*(['"][0-9]*['"]|[0-9]*|True|False)"#).unwrap(),
    ];
}

fn bounded<'a>(field: &str, value: &'a str, min: usize, max: usize) -> Result<&'a str, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField(field.to_string()));
    }
    if trimmed.chars().count() < min {
        return Err(ValidationError::TooShort(field.to_string(), min));
    }
    if trimmed.chars().count() > max {
        return Err(ValidationError::TooLong(field.to_string(), max));
    }
    Ok(trimmed)
}

/// Validates an email address and returns it trimmed and lowercased
pub fn is_valid_email(email: &str) -> Result<String, ValidationError> {
    let trimmed = bounded("email", email, MIN_EMAIL_LENGTH, MAX_EMAIL_LENGTH)?;

    if !EMAIL_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidFormat("email".to_string()));
    }

    // Local part over 64 chars is not deliverable
    if let Some(at_pos) = trimmed.find('@') {
        if at_pos > 64 {
            return Err(ValidationError::SuspiciousContent("email".to_string()));
        }
    }

    if contains_sql_injection_patterns(trimmed) {
        return Err(ValidationError::PossibleSQLInjection);
    }

    Ok(trimmed.to_lowercase())
}

pub fn is_valid_username(username: &str) -> Result<String, ValidationError> {
    let trimmed = bounded("username", username, MIN_USERNAME_LENGTH, MAX_USERNAME_LENGTH)?;

    if !USERNAME_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidFormat("username".to_string()));
    }

    Ok(trimmed.to_string())
}

/// Free-text profile name. Stored through bound parameters, so only
/// control characters are refused.
pub fn is_valid_display_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = bounded("display_name", name, 1, MAX_DISPLAY_NAME_LENGTH)?;

    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ValidationError::SuspiciousContent("display_name".to_string()));
    }

    Ok(trimmed.to_string())
}

/// Device label attached to a session. Blank labels become "unknown".
pub fn normalize_device(device: &str) -> Result<String, ValidationError> {
    let trimmed = device.trim();
    if trimmed.is_empty() {
        return Ok("unknown".to_string());
    }
    if trimmed.chars().count() > MAX_DEVICE_LENGTH {
        return Err(ValidationError::TooLong("device".to_string(), MAX_DEVICE_LENGTH));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ValidationError::SuspiciousContent("device".to_string()));
    }
    Ok(trimmed.to_string())
}

fn contains_sql_injection_patterns(input: &str) -> bool {
    SQL_INJECTION_PATTERNS.iter().any(|pattern| pattern.is_match(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_email() {
        assert_eq!(is_valid_email(" User@Example.com ").unwrap(), "user@example.com");
        assert!(is_valid_email("test.email@domain.co.uk").is_ok());
        assert!(is_valid_email("user+tag@example.com").is_ok());
    }

    #[test]
    fn test_invalid_email_format() {
        assert!(is_valid_email("invalid").is_err());
        assert!(is_valid_email("user@").is_err());
        assert!(is_valid_email("@example.com").is_err());
        assert!(is_valid_email("user@@example.com").is_err());
    }

    #[test]
    fn test_email_length_limits() {
        let too_long = format!("{}@example.com", "a".repeat(250));
        assert!(matches!(is_valid_email(&too_long), Err(ValidationError::TooLong(_, _))));
        assert!(matches!(is_valid_email("a@b"), Err(ValidationError::TooShort(_, _))));
    }

    #[test]
    fn test_sql_injection_in_email() {
        assert!(is_valid_email("user' OR '1'='1@example.com").is_err());
        assert!(is_valid_email("user; DROP TABLE@example.com").is_err());
    }

    #[test]
    fn test_username_rules() {
        assert!(is_valid_username("jane_doe-1").is_ok());
        assert!(is_valid_username("ab").is_err());
        assert!(is_valid_username("_hidden").is_err());
        assert!(is_valid_username("has space").is_err());
        assert!(is_valid_username(&"x".repeat(33)).is_err());
    }

    #[test]
    fn test_display_name() {
        assert!(is_valid_display_name("Jean-Pierre O'Brien").is_ok());
        assert!(is_valid_display_name("").is_err());
        assert!(is_valid_display_name("Name\0with\0null").is_err());
    }

    #[test]
    fn test_display_name_allows_sql_punctuation() {
        assert_eq!(is_valid_display_name("Jean--Luc").unwrap(), "Jean--Luc");
        assert!(is_valid_display_name("A; B").is_ok());
        assert!(is_valid_display_name("Robert'); DROP TABLE users;--").is_ok());
    }

    #[test]
    fn test_device_labels() {
        assert_eq!(normalize_device("  ").unwrap(), "unknown");
        assert_eq!(normalize_device(" pixel-7 ").unwrap(), "pixel-7");
        assert!(normalize_device(&"d".repeat(129)).is_err());
    }
}
