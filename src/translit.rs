//! Transliteration support for non-Latin scripts.
//!
//! Name groups are Latin letters, so names written in other scripts are
//! transliterated to ASCII before picking their index bucket.

use deunicode::deunicode;
use unicode_script::{Script, UnicodeScript};

/// Check if a string contains only Latin characters (plus common punctuation/digits).
pub fn is_all_latin(s: &str) -> bool {
    s.chars().all(|c| {
        c.is_ascii()
            || c.script() == Script::Latin
            || c.script() == Script::Common
            || c.script() == Script::Inherited
    })
}

/// Transliterate a string to ASCII, collapsing whitespace.
pub fn transliterate(s: &str) -> String {
    let result = deunicode(s);
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Index bucket of a piece of text: the uppercase ASCII letter its first
/// alphanumeric character transliterates to.
///
/// Returns `None` for text that has no such letter (digits, symbols, empty).
/// Callers fold that into the "other" group.
pub fn index_bucket(text: &str) -> Option<String> {
    let first_word = text.split_whitespace().next()?;

    let ascii = if is_all_latin(first_word) {
        deunicode(first_word)
    } else {
        transliterate(first_word)
    };

    let c = ascii.chars().find(|c| c.is_ascii_alphanumeric())?;
    c.is_ascii_alphabetic()
        .then(|| c.to_ascii_uppercase().to_string())
}
