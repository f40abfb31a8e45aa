//! Anti-CSRF `state` parameter: generation and constant-time comparison.

use rand::RngCore;

/// Generates a 128-bit random hex string suitable for the OAuth `state` param.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compares two state strings in constant time (length-independent of early return).
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verifies a redirect's echoed `state` against the one we generated.
///
/// Returns `Ok(true)` on a match. On a mismatch: fails with `ConfigError`
/// unless `ignore_mismatch` is set, in which case it returns `Ok(false)` so
/// the caller can silently skip a redirect meant for a different concurrent
/// flow (spec.md §4.4).
pub fn verify_state(expected: &str, returned: &str, ignore_mismatch: bool) -> crate::error::Result<bool> {
    if constant_time_eq(expected, returned) {
        Ok(true)
    } else if ignore_mismatch {
        Ok(false)
    } else {
        Err(crate::error::Error::Config("Invalid state parameter".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_state_is_32_hex_chars() {
        let s = generate_state();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn matching_state_verifies() {
        let s = generate_state();
        assert_eq!(verify_state(&s, &s, false).unwrap(), true);
    }

    #[test]
    fn mismatched_state_fails_by_default() {
        let err = verify_state("aaaa", "bbbb", false).unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }

    #[test]
    fn mismatched_state_is_ignorable() {
        assert_eq!(verify_state("aaaa", "bbbb", true).unwrap(), false);
    }
}
