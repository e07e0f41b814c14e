use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const IV_LEN: usize = 16;
pub const SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("Random IV generation failed: {0}")]
    RandomSource(String),

    #[error("Value has no IV separator")]
    MissingSeparator,

    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("IV must be 16 bytes, got {0}")]
    InvalidIvLength(usize),

    #[error("Decryption failed: bad key or padding")]
    BadPadding,

    #[error("Decrypted value is not UTF-8")]
    InvalidUtf8,
}

/// AES-256-CBC over single column values.
///
/// Stored form is `hex(iv):hex(ciphertext)` with a fresh random IV per call.
#[derive(Clone)]
pub struct FieldCipher {
    key: [u8; 32],
}

impl FieldCipher {
    /// Key is the SHA-256 digest of the configured secret.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut iv)
            .map_err(|e| CipherError::RandomSource(e.to_string()))?;

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        Ok(format!("{}{}{}", hex::encode(iv), SEPARATOR, hex::encode(ciphertext)))
    }

    /// Strict decryption; splits at the first separator.
    pub fn try_decrypt(&self, stored: &str) -> Result<String, CipherError> {
        let (iv_hex, ct_hex) = stored
            .split_once(SEPARATOR)
            .ok_or(CipherError::MissingSeparator)?;

        let iv = hex::decode(iv_hex).map_err(|e| CipherError::InvalidHex(e.to_string()))?;
        if iv.len() != IV_LEN {
            return Err(CipherError::InvalidIvLength(iv.len()));
        }
        let ciphertext = hex::decode(ct_hex).map_err(|e| CipherError::InvalidHex(e.to_string()))?;

        let decryptor = Aes256CbcDec::new_from_slices(&self.key, &iv)
            .map_err(|_| CipherError::InvalidIvLength(iv.len()))?;
        let plaintext = decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CipherError::BadPadding)?;

        String::from_utf8(plaintext).map_err(|_| CipherError::InvalidUtf8)
    }

    /// Lenient decryption: anything that does not decrypt is returned as is,
    /// so plaintext legacy values pass through untouched.
    pub fn decrypt(&self, stored: &str) -> String {
        match self.try_decrypt(stored) {
            Ok(plaintext) => plaintext,
            Err(_) => stored.to_string(),
        }
    }

    /// Encrypt a JSON value through its textual form. Null stays null.
    pub fn encrypt_value(&self, value: &Value) -> Result<Value, CipherError> {
        let text = match value {
            Value::Null => return Ok(Value::Null),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.encrypt(&text).map(Value::String)
    }
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldCipher").field("key", &"<redacted>").finish()
    }
}

/// True when the value has the `iv:ciphertext` shape (32 hex chars, then hex).
pub fn looks_encrypted(value: &str) -> bool {
    match value.split_once(SEPARATOR) {
        Some((iv, ct)) => {
            iv.len() == IV_LEN * 2
                && !ct.is_empty()
                && iv.bytes().chain(ct.bytes()).all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_key_leaves_value_untouched() {
        let stored = FieldCipher::from_secret("one").encrypt("secret").unwrap();
        let other = FieldCipher::from_secret("two");
        // A wrong key almost always fails padding; if it happens to pass, the
        // output still differs from the plaintext
        assert_ne!(other.decrypt(&stored), "secret");
    }

    #[test]
    fn non_string_values_encrypt_as_text() {
        let cipher = FieldCipher::from_secret("k");
        let stored = cipher.encrypt_value(&Value::from(23.5)).unwrap();
        let text = stored.as_str().unwrap();
        assert!(looks_encrypted(text));
        assert_eq!(cipher.decrypt(text), "23.5");
        assert_eq!(cipher.encrypt_value(&Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn debug_hides_key() {
        let cipher = FieldCipher::from_secret("k");
        assert!(format!("{:?}", cipher).contains("redacted"));
    }
}
