//! Value normalization used for equality, matching and deduplication.

use crate::contact::{FieldName, FieldValue};

/// Digits kept for a partial phone comparison.
pub const PARTIAL_PHONE_DIGITS: usize = 7;

/// Normalize a phone number to its digits.
///
/// Formatting characters, a leading `+` and a leading `00` international
/// prefix are dropped, so `+1 555 123 0000`, `0015551230000` and
/// `15551230000` share a key. National numbers written without their country
/// code stay distinct from the international form. Returns `None` when fewer
/// than five digits remain.
#[must_use]
pub fn phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let mut digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if trimmed.starts_with("00") {
        digits.drain(..2);
    }
    (digits.len() >= 5).then_some(digits)
}

/// Trailing digits of a normalized phone number.
#[must_use]
pub fn partial_phone(normalized: &str) -> String {
    let digits: Vec<char> = normalized.chars().filter(char::is_ascii_digit).collect();
    let start = digits.len().saturating_sub(PARTIAL_PHONE_DIGITS);
    digits[start..].iter().collect()
}

/// Lowercase and trim an email address; `None` if it is not `local@domain`.
#[must_use]
pub fn email(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let (local, domain) = lowered.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') || lowered.contains(' ') {
        return None;
    }
    Some(lowered)
}

/// Lowercase a name and strip punctuation and extra whitespace.
#[must_use]
pub fn name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Comparison key for a URL: no scheme, no `www.`, no trailing slash.
#[must_use]
pub fn url(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    without_www.trim_end_matches('/').to_string()
}

/// Trim and lowercase a tag.
#[must_use]
pub fn tag(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Collapse whitespace in free text.
#[must_use]
pub fn text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison key of one list element of `field`.
#[must_use]
pub fn list_key(field: FieldName, raw: &str) -> String {
    match field {
        FieldName::Phones => phone(raw).unwrap_or_else(|| text(raw)),
        FieldName::Emails => email(raw).unwrap_or_else(|| text(raw).to_lowercase()),
        FieldName::SocialLinks => url(raw),
        FieldName::Tags => tag(raw),
        _ => text(raw),
    }
}

/// Normalized form of a whole field value, for equality checks.
///
/// Lists compare as sets of keys; text compares after whitespace collapse
/// (names also ignore case and punctuation).
#[must_use]
pub fn value_key(field: FieldName, value: &FieldValue) -> Vec<String> {
    let mut keys: Vec<String> = match value {
        FieldValue::Text(s) => match field {
            FieldName::Name => vec![name(s)],
            _ => vec![text(s)],
        },
        FieldValue::List(items) => items.iter().map(|v| list_key(field, v)).collect(),
        FieldValue::Links(links) => links.iter().map(|l| url(&l.url)).collect(),
    };
    if !matches!(value, FieldValue::Text(_)) {
        keys.sort();
        keys.dedup();
    }
    keys
}

/// Values are equal after normalization.
#[must_use]
pub fn values_equal(field: FieldName, a: &FieldValue, b: &FieldValue) -> bool {
    value_key(field, a) == value_key(field, b)
}
