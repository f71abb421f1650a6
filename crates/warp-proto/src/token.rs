use rand::rngs::OsRng;
use rand::RngCore;

const TOKEN_LENGTH: usize = 16;
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a 16-character random token drawn from `[A-Za-z0-9]`.
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_LENGTH * 2];
    OsRng.fill_bytes(&mut bytes);
    let mut out = String::with_capacity(TOKEN_LENGTH);
    // Rejection-sample so every alphabet character is equally likely.
    let mut pool = bytes.iter().copied();
    while out.len() < TOKEN_LENGTH {
        match pool.next() {
            Some(b) if (b as usize) < ALPHABET.len() * 4 => {
                out.push(ALPHABET[b as usize % ALPHABET.len()] as char);
            }
            Some(_) => {}
            None => {
                OsRng.fill_bytes(&mut bytes);
                pool = bytes.iter().copied();
            }
        }
    }
    out
}

/// Generate a random token with a `prefix_` marker, e.g. `session_…`.
pub fn prefixed_token(prefix: &str) -> String {
    format!("{}_{}", prefix, random_token())
}

/// Validate a warp token: one alphanumeric head character followed by up to
/// 255 characters of `[a-zA-Z0-9-_.]`.
pub fn valid_token(token: &str) -> bool {
    let bytes = token.as_bytes();
    if bytes.is_empty() || bytes.len() > 256 {
        return false;
    }
    if !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_tokens() {
        for token in ["demo-1", "a", "goofy-dev", "A1b2.c_d-e", "0leading-digit"] {
            assert!(valid_token(token), "expected {token:?} to be valid");
        }
    }

    #[test]
    fn rejects_malformed_tokens() {
        for token in ["", "-leading-dash", ".dot", "_underscore", "has space", "ünïcode"] {
            assert!(!valid_token(token), "expected {token:?} to be invalid");
        }
        let too_long = "a".repeat(257);
        assert!(!valid_token(&too_long));
        let max_len = "a".repeat(256);
        assert!(valid_token(&max_len));
    }

    #[test]
    fn random_tokens_are_valid_and_distinct() {
        let a = random_token();
        let b = random_token();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(valid_token(&a));
        assert!(valid_token(&prefixed_token("session")));
    }
}
