//! Phone number normalization.
//!
//! Two forms are used. Canonical numbers are E.164 strings produced with
//! libphonenumber and are what the reference store persists. Minimized numbers
//! are the short trailing-digit keys the cache indexes on, so that
//! `+358470009955` and `0470009955` land under the same key.

use rlibphonenumber::{region_code::RegionCode, PhoneNumber, PhoneNumberFormat, PHONE_NUMBER_UTIL};

/// Default number of trailing digits kept by [`minimize`].
pub const DEFAULT_MATCH_DIGITS: usize = 7;

/// Characters that start the dial-string part of a number (pause, wait,
/// extension separators). Everything from the first of these on is ignored.
const DIAL_CONTROL: &[char] = &['p', 'P', 'w', 'W', 'x', 'X', ',', ';'];

/// Characters tolerated as visual separators.
const SEPARATORS: &[char] = &[' ', '-', '.', '(', ')', '/', '\u{a0}'];

/// Strip a number down to its dialable characters, stopping at any dial
/// string. Returns `None` when the input contains characters that cannot be
/// part of a phone number.
pub fn dialable_digits(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix("tel:").unwrap_or(trimmed);

    let mut digits = String::new();
    for (index, c) in trimmed.chars().enumerate() {
        if DIAL_CONTROL.contains(&c) {
            break;
        }
        match c {
            '0'..='9' | '*' | '#' => digits.push(c),
            '+' if index == 0 => {}
            c if SEPARATORS.contains(&c) => {}
            _ => return None,
        }
    }

    Some(digits)
}

/// Reduce a number to its last `max_digits` dialable digits.
///
/// Returns an empty string for input that is not a phone number, which the
/// cache treats as "no key".
pub fn minimize(input: &str, max_digits: usize) -> String {
    let Some(digits) = dialable_digits(input) else {
        return String::new();
    };
    let skip = digits.chars().count().saturating_sub(max_digits);
    digits.chars().skip(skip).collect()
}

/// Length of the common trailing digit run of two numbers.
pub fn common_suffix_len(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Canonicalize a number to E.164, trying the default region first and then
/// the unknown region (which only accepts numbers in international form).
pub fn canonicalize(input: &str, default_region: Option<&str>) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let util = &*PHONE_NUMBER_UTIL;
    let mut candidates: Vec<&str> = Vec::new();

    if let Some(region) = default_region {
        if !region.is_empty() {
            candidates.push(region);
        }
    }

    let unknown = RegionCode::get_unknown();
    if candidates
        .iter()
        .all(|candidate| !candidate.eq_ignore_ascii_case(unknown))
    {
        candidates.push(unknown);
    }

    for region in candidates {
        if let Ok(parsed) = util.parse(trimmed, region) {
            return Some(format_e164(&parsed));
        }
    }

    None
}

fn format_e164(number: &PhoneNumber) -> String {
    let mut formatted = PHONE_NUMBER_UTIL
        .format(number, PhoneNumberFormat::E164)
        .into_owned();

    if number.has_extension() {
        let ext = number.extension();
        if !ext.is_empty() {
            formatted.push_str(";ext=");
            formatted.push_str(ext);
        }
    }

    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimize_keeps_trailing_digits() {
        assert_eq!(minimize("+358470009955", 7), "0009955");
        assert_eq!(minimize("0470009955", 7), "0009955");
        assert_eq!(minimize("(047) 000-9955", 7), "0009955");
        assert_eq!(minimize("188889999", 7), "8889999");
    }

    #[test]
    fn test_minimize_short_numbers_are_kept_whole() {
        assert_eq!(minimize("112", 7), "112");
        assert_eq!(minimize("*100#", 7), "*100#");
    }

    #[test]
    fn test_minimize_stops_at_dial_string() {
        assert_eq!(minimize("+3584700099p1234", 7), "4700099");
        assert_eq!(minimize("0470009955;ext=12", 7), "0009955");
    }

    #[test]
    fn test_minimize_rejects_non_numbers() {
        assert_eq!(minimize("alice@example.com", 7), "");
        assert_eq!(minimize("12ab34", 7), "");
        assert_eq!(minimize("", 7), "");
    }

    #[test]
    fn test_common_suffix_len() {
        assert_eq!(common_suffix_len("61188889999", "988889999"), 8);
        assert_eq!(common_suffix_len("99988889999", "988889999"), 9);
        assert_eq!(common_suffix_len("123", "456"), 0);
    }

    #[test]
    fn test_canonicalize_with_region() {
        assert_eq!(
            canonicalize("0470009955", Some("FI")).as_deref(),
            Some("+358470009955")
        );
        assert_eq!(
            canonicalize("+358 47 000 9955", None).as_deref(),
            Some("+358470009955")
        );
    }

    #[test]
    fn test_canonicalize_without_region_needs_international_form() {
        assert_eq!(canonicalize("0470009955", None), None);
        assert_eq!(canonicalize("   ", Some("FI")), None);
    }
}
