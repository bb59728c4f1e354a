//! Lock tokens
//!
//! A token is the value written under the resource key. It is the only
//! proof of ownership accepted by release and extend.

use rand::Rng;

/// Random bytes per token
pub const TOKEN_BYTES: usize = 16;

/// Generate a fresh hex-encoded token from the thread-local CSPRNG
pub fn generate_token() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; TOKEN_BYTES]>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_tokens_are_unique() {
        let mut tokens = HashSet::new();
        for _ in 0..10000 {
            assert!(tokens.insert(generate_token()), "Duplicate token generated");
        }
    }
}
