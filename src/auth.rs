//! Constant-time capability token comparison, shared by the Secret Store,
//! Result Service, and Model Proxy auth checks.

use rand::RngCore;
use subtle::ConstantTimeEq;

/// Generates a fresh 32-byte hex-encoded capability (a `secret_ref` or `result_token`).
pub fn generate_hex_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time string equality. Used everywhere a caller-supplied token is
/// checked against a stored secret, so that timing does not leak how many
/// leading bytes matched.
pub fn tokens_equal(expected: &str, supplied: &str) -> bool {
    expected.as_bytes().ct_eq(supplied.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_64_hex_chars() {
        let tok = generate_hex_token();
        assert_eq!(tok.len(), 64);
        assert!(tok.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_tokens_are_distinct() {
        assert_ne!(generate_hex_token(), generate_hex_token());
    }

    #[test]
    fn equal_tokens_compare_equal() {
        let tok = generate_hex_token();
        assert!(tokens_equal(&tok, &tok));
    }

    #[test]
    fn mismatched_tokens_compare_unequal() {
        assert!(!tokens_equal("a".repeat(64).as_str(), "b".repeat(64).as_str()));
        assert!(!tokens_equal("short", "shorter"));
    }
}
