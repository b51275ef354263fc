//! Pure identity and normalization helpers shared by the render pipeline.

pub mod fingerprint;
pub mod labels;
pub mod timestamp;
pub mod urls;

pub use fingerprint::fingerprint;
pub use labels::{extract_trailing_token, short_label, DEFAULT_LABEL_CHARS};
pub use timestamp::{normalize_json_timestamp, normalize_timestamp, TimestampValue};
pub use urls::{ensure_scheme, is_web_url, normalize_url};
