use crate::db::models::RenderRecord;

/// Repaint gate: true when two views render identically.
///
/// Compares `id`, `status`, `html`, `key` and `name_hint` pairwise in order, with missing
/// strings treated as empty. Timestamps and other fields are ignored.
pub fn sequence_equals(a: &[RenderRecord], b: &[RenderRecord]) -> bool {
    if std::ptr::eq(a, b) {
        return true;
    }
    if a.len() != b.len() {
        return false;
    }

    a.iter().zip(b).all(|(left, right)| {
        left.id == right.id
            && left.status == right.status
            && text(&left.html) == text(&right.html)
            && text(&left.key) == text(&right.key)
            && text(&left.name_hint) == text(&right.name_hint)
    })
}

fn text(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}
