//! Input text normalization applied before every encode call

/// Substituted for inputs that are empty after trimming, so the model never
/// sees an empty sequence.
pub const EMPTY_TEXT_PLACEHOLDER: &str = "[EMPTY]";

/// A text ready to be handed to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedText {
    pub text: String,
    /// Set when the input was cut down to the character budget
    pub truncated: bool,
}

/// Trim, substitute the placeholder for empty input and head-truncate to
/// `max_chars` characters.
pub fn preprocess_text(raw: &str, max_chars: usize) -> PreparedText {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return PreparedText {
            text: EMPTY_TEXT_PLACEHOLDER.to_string(),
            truncated: false,
        };
    }

    match trimmed.char_indices().nth(max_chars) {
        Some((cut, _)) => PreparedText {
            text: trimmed[..cut].to_string(),
            truncated: true,
        },
        None => PreparedText {
            text: trimmed.to_string(),
            truncated: false,
        },
    }
}
