use crate::TokenError;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 32-byte MAC key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TokenSecret([u8; 32]);

impl TokenSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// A fresh random secret. Tokens signed with it do not survive a restart.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, TokenError> {
        let mut decoded = hex::decode(encoded.trim())
            .map_err(|e| TokenError::InvalidSecret(e.to_string()))?;
        if decoded.len() != 32 {
            let len = decoded.len();
            decoded.zeroize();
            return Err(TokenError::InvalidSecret(format!(
                "expected 32 bytes, got {len}"
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self(bytes))
    }

    pub(crate) fn key(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_hex() {
        let secret = TokenSecret::from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(secret.key()[0], 0xab);
        assert!(TokenSecret::from_hex("abcd").is_err());
        assert!(TokenSecret::from_hex("not hex").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let secret = TokenSecret::from_bytes([7u8; 32]);
        assert_eq!(format!("{secret:?}"), "TokenSecret(..)");
    }
}
