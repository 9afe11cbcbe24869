//! Shared encoding utilities.

use base64::Engine;

use crate::error::{CryptoError, CryptoResult};

/// Length of Curve25519 public and private keys.
pub const BOX_KEY_LEN: usize = 32;

/// Length of NaCl box / secretbox nonces.
pub const NONCE_LEN: usize = 24;

/// Length of Ed25519 public keys.
pub const SIGNING_PUBKEY_LEN: usize = 32;

/// Length of Ed25519 secret keys (seed followed by public key).
pub const SIGNING_PRIVKEY_LEN: usize = 64;

/// Length of Ed25519 detached signatures.
pub const SIGNATURE_LEN: usize = 64;

/// Encode bytes as standard base64.
pub fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode a standard base64 string to bytes.
pub fn base64_decode(data: &str) -> CryptoResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| CryptoError::InvalidBase64(e.to_string()))
}

/// Decode base64 into a fixed-size array, checking the length.
pub fn decode_fixed<const N: usize>(data: &str) -> CryptoResult<[u8; N]> {
    let bytes = base64_decode(data)?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: N,
            actual,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let original = [42u8; 32];
        let encoded = base64_encode(&original);
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(original.as_slice(), decoded.as_slice());
    }

    #[test]
    fn test_base64_decode_invalid() {
        let result = base64_decode("not valid base64!!!");
        assert!(matches!(result, Err(CryptoError::InvalidBase64(_))));
    }

    #[test]
    fn test_decode_fixed_ok() {
        let encoded = base64_encode(&[7u8; 24]);
        let decoded: [u8; 24] = decode_fixed(&encoded).unwrap();
        assert_eq!(decoded, [7u8; 24]);
    }

    #[test]
    fn test_decode_fixed_wrong_length() {
        let encoded = base64_encode(&[7u8; 16]);
        let result: CryptoResult<[u8; 32]> = decode_fixed(&encoded);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }
}
