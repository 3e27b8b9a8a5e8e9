//! Phone canonicalization used as the deduplication key.
//!
//! National Brazilian numbers (DDD + 8/9 digit subscriber) get the `55`
//! country code prepended. Anything else is passed through as bare digits
//! so a malformed phone never causes the lead itself to be discarded.

/// Country code prepended to national numbers.
pub const COUNTRY_CODE: &str = "55";

/// Canonicalize a raw phone string into a digit-only dialable string.
///
/// ```rust,ignore
/// assert_eq!(normalize("(11) 98888-7777"), "5511988887777");
/// assert_eq!(normalize("5511988887777"), "5511988887777");
/// assert_eq!(normalize(""), "");
/// ```
pub fn normalize(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() >= 12 && digits.starts_with(COUNTRY_CODE) {
        return digits;
    }

    if digits.len() == 10 || digits.len() == 11 {
        return format!("{COUNTRY_CODE}{digits}");
    }

    digits
}
