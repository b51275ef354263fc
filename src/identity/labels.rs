/// Default number of characters kept by [`short_label`].
pub const DEFAULT_LABEL_CHARS: usize = 4;

/// Pull the version-ish token off the end of a storage key.
///
/// The last path segment loses its query suffix and extension, then the longest trailing
/// run of digits wins, else the longest trailing run of ASCII alphanumerics. A segment with
/// neither comes back whole; an empty segment yields `None`.
pub fn extract_trailing_token(key: &str) -> Option<String> {
    let segment = key.rsplit('/').next().unwrap_or_default();
    let segment = segment.split(['?', '#']).next().unwrap_or_default();
    let stem = match segment.rfind('.') {
        Some(0) | None => segment,
        Some(idx) => &segment[..idx],
    };

    if stem.is_empty() {
        return None;
    }

    let digits = trailing_run(stem, |c| c.is_ascii_digit());
    if !digits.is_empty() {
        return Some(digits.to_string());
    }

    let alnum = trailing_run(stem, |c| c.is_ascii_alphanumeric());
    if !alnum.is_empty() {
        return Some(alnum.to_string());
    }

    Some(stem.to_string())
}

/// Short display label for a screenshot or render version.
///
/// Timestamp-suffixed names collapse to their last `min_chars` digits; anything else
/// keeps its last `min_chars` characters after a short trailing counter is dropped.
pub fn short_label(path: &str, fallback_token: Option<&str>, min_chars: usize) -> String {
    let token = extract_trailing_token(path)
        .filter(|token| !token.is_empty())
        .or_else(|| fallback_token.map(str::to_string))
        .unwrap_or_default();

    let cleaned: String = token.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if cleaned.is_empty() {
        return "v".to_string();
    }

    let digits = trailing_run(&cleaned, |c| c.is_ascii_digit());
    if digits.len() >= min_chars {
        return tail(digits, min_chars).to_string();
    }

    let remainder = &cleaned[..cleaned.len() - digits.len()];
    if remainder.is_empty() {
        return "v".to_string();
    }

    tail(remainder, min_chars).to_string()
}

fn trailing_run(value: &str, pred: impl Fn(char) -> bool) -> &str {
    let start = value
        .char_indices()
        .rev()
        .take_while(|(_, c)| pred(*c))
        .last()
        .map(|(idx, _)| idx)
        .unwrap_or(value.len());
    &value[start..]
}

// Callers only pass ASCII, so byte slicing is safe.
fn tail(value: &str, count: usize) -> &str {
    if value.len() <= count {
        value
    } else {
        &value[value.len() - count..]
    }
}
