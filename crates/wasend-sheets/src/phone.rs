//! Phone number normalisation.

const MIN_DIGITS: usize = 7;
const MAX_DIGITS: usize = 15;

/// Normalise a spreadsheet phone cell into international digits.
///
/// Strips spaces, dashes, dots, and parentheses, then drops a leading `+`
/// or `00` prefix. The result must be 7 to 15 digits (E.164 length).
pub fn normalize_phone(raw: &str) -> Result<String, String> {
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '\u{a0}'))
        .collect();

    if compact.is_empty() {
        return Err("missing phone number".to_string());
    }

    let digits = if let Some(rest) = compact.strip_prefix('+') {
        rest
    } else if let Some(rest) = compact.strip_prefix("00") {
        rest
    } else {
        compact.as_str()
    };

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid phone number '{}'", raw.trim()));
    }
    if digits.len() < MIN_DIGITS || digits.len() > MAX_DIGITS {
        return Err(format!(
            "invalid phone number '{}': expected {MIN_DIGITS}-{MAX_DIGITS} digits",
            raw.trim()
        ));
    }

    Ok(digits.to_string())
}
