//! XSalsa20-Poly1305 authenticated symmetric encryption (NaCl `secretbox`).
//!
//! Callers pass high-entropy key material; the secretbox key is its SHA-256
//! digest rather than the output of a slow KDF.

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};
use crate::format::{base64_decode, base64_encode};
use crate::keys::EncryptedData;
use crate::seal::{decode_nonce, generate_nonce};

fn derive_key(key: &[u8]) -> Key {
    let digest = Sha256::digest(key);
    Key::from(<[u8; 32]>::from(digest))
}

/// Encrypt `msg` under SHA-256(`key`) with a random nonce.
pub fn encrypt_symmetric(msg: &[u8], key: &[u8]) -> CryptoResult<EncryptedData> {
    let nonce = generate_nonce();

    let sealed = XSalsa20Poly1305::new(&derive_key(key))
        .encrypt(Nonce::from_slice(&nonce), msg)
        .map_err(|_| CryptoError::Encryption)?;

    Ok(EncryptedData {
        data: base64_encode(&sealed),
        nonce: base64_encode(&nonce),
    })
}

/// Open a secretbox sealed under SHA-256(`key`).
pub fn decrypt_symmetric(encrypted: &EncryptedData, key: &[u8]) -> CryptoResult<Vec<u8>> {
    let nonce = decode_nonce(&encrypted.nonce)?;
    let ciphertext = base64_decode(&encrypted.data)?;

    XSalsa20Poly1305::new(&derive_key(key))
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_roundtrip() {
        let encrypted = encrypt_symmetric(b"it works!", b"3UVxGywSBjbAvqwd").unwrap();
        let decrypted = decrypt_symmetric(&encrypted, b"3UVxGywSBjbAvqwd").unwrap();
        assert_eq!(decrypted.as_slice(), b"it works!");
    }

    #[test]
    fn test_symmetric_wrong_key() {
        let encrypted = encrypt_symmetric(b"secret", b"right-key").unwrap();
        let result = decrypt_symmetric(&encrypted, b"wrong-key");
        assert!(matches!(result, Err(CryptoError::Decryption)));
    }

    #[test]
    fn test_symmetric_tampered() {
        let mut encrypted = encrypt_symmetric(b"secret", b"key").unwrap();
        let mut raw = base64_decode(&encrypted.data).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        encrypted.data = base64_encode(&raw);

        let result = decrypt_symmetric(&encrypted, b"key");
        assert!(matches!(result, Err(CryptoError::Decryption)));
    }

    #[test]
    fn test_symmetric_empty_plaintext() {
        let encrypted = encrypt_symmetric(b"", b"key").unwrap();
        let decrypted = decrypt_symmetric(&encrypted, b"key").unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_distinct_nonces_distinct_ciphertexts() {
        let a = encrypt_symmetric(b"same message", b"key").unwrap();
        let b = encrypt_symmetric(b"same message", b"key").unwrap();
        assert_ne!(a.data, b.data);
    }
}
