/// Deterministic, order-sensitive, non-cryptographic fingerprint rendered in base 36.
///
/// Folds UTF-16 code units into a wrapping 32-bit accumulator (`h * 31 + c`), so the
/// output is identical on every platform and matches fingerprints produced by web
/// clients that hash `charCodeAt` values the same way.
pub fn fingerprint(input: &str) -> String {
    let mut hash: i32 = 0;
    for unit in input.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    to_base36(hash.unsigned_abs())
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut out = Vec::with_capacity(7);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize] as char);
        value /= 36;
    }
    out.iter().rev().collect()
}
