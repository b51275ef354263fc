use url::Url;

/// Parse `raw`, drop any fragment and re-serialize. Unparseable input comes back trimmed.
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => raw.trim().to_string(),
    }
}

/// Prefix `https://` onto anything that does not already carry an http(s) scheme.
pub fn ensure_scheme(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return trimmed.to_string();
    }

    format!("https://{}", trimmed.trim_start_matches('/'))
}

pub fn is_web_url(raw: Option<&str>) -> bool {
    let Some(raw) = raw else {
        return false;
    };
    if raw.trim().is_empty() {
        return false;
    }

    Url::parse(raw)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false)
}
