//! Error types for cryptographic operations.

use thiserror::Error;

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Invalid base64 in a key, nonce, or ciphertext field.
    #[error("Invalid base64: {0}")]
    InvalidBase64(String),

    /// A key had the wrong length for its algorithm.
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// A nonce had the wrong length.
    #[error("Invalid nonce length: expected {expected} bytes, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    /// Encryption failed.
    #[error("Encryption failed")]
    Encryption,

    /// Decryption failed - wrong key or corrupted data.
    #[error("Decryption failed")]
    Decryption,

    /// Signature or key invalid.
    #[error("Signature or key invalid")]
    Signature,

    /// A keypair self-check round trip produced the wrong plaintext.
    #[error("Decrypted message does not match original message")]
    KeypairMismatch,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_signature() {
        let err = CryptoError::Signature;
        assert_eq!(err.to_string(), "Signature or key invalid");
    }

    #[test]
    fn test_error_display_key_length() {
        let err = CryptoError::InvalidKeyLength {
            expected: 32,
            actual: 16,
        };
        assert!(err.to_string().contains("32"));
        assert!(err.to_string().contains("16"));
    }

    #[test]
    fn test_json_error_from() {
        let json_err = serde_json::from_str::<i32>("nope").unwrap_err();
        let err: CryptoError = json_err.into();
        assert!(matches!(err, CryptoError::Json(_)));
    }
}
