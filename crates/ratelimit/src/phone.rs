use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhoneError {
    #[error("phone number is empty")]
    Empty,
    #[error("phone number contains invalid characters")]
    InvalidCharacters,
    #[error("phone number must be 10 or 11 digits starting with 0")]
    InvalidLength,
}

/// Normalize a Japanese phone number into its bare domestic digit form,
/// which is the key used for rate limiting and verification rows.
///
/// `+81 90-1234-5678`, `090 (1234) 5678` and `09012345678` all map to
/// `09012345678`.
pub fn normalize_phone(raw: &str) -> Result<String, PhoneError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PhoneError::Empty);
    }

    let mut digits = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        match c {
            '0'..='9' => digits.push(c),
            '+' if i == 0 => digits.push('+'),
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return Err(PhoneError::InvalidCharacters),
        }
    }

    let domestic = match digits.strip_prefix("+81") {
        Some(rest) => format!("0{}", rest.trim_start_matches('0')),
        None if digits.starts_with('+') => return Err(PhoneError::InvalidCharacters),
        None => digits,
    };

    if !domestic.starts_with('0') || !(10..=11).contains(&domestic.len()) {
        return Err(PhoneError::InvalidLength);
    }
    Ok(domestic)
}
