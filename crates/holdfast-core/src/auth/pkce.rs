//! PKCE and random token helpers

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random URL-safe token from `bytes` bytes of entropy
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// New PKCE code verifier (43 characters)
pub fn code_verifier() -> String {
    random_token(32)
}

/// S256 code challenge for `verifier`
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Whether `value` only uses characters `random_token` can produce
pub fn is_url_safe_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_matches_rfc7636_vector() {
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_verifier_shape() {
        let verifier = code_verifier();
        assert_eq!(verifier.len(), 43);
        assert!(is_url_safe_token(&verifier));
        assert_ne!(verifier, code_verifier());
    }

    #[test]
    fn test_url_safe_token_check() {
        assert!(is_url_safe_token("abc-DEF_123"));
        assert!(!is_url_safe_token(""));
        assert!(!is_url_safe_token("../etc"));
        assert!(!is_url_safe_token("a b"));
    }
}
