//! Curve25519 sealed-box encryption (NaCl `box`).

use crypto_box::aead::Aead;
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::format::{base64_decode, base64_encode, NONCE_LEN};
use crate::keys::{EncryptedData, Privkey, Pubkey};

pub(crate) fn decode_nonce(nonce: &str) -> CryptoResult<[u8; NONCE_LEN]> {
    let bytes = base64_decode(nonce)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| CryptoError::InvalidNonceLength {
            expected: NONCE_LEN,
            actual: b.len(),
        })
}

/// Generate a random 24-byte nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `msg` to `pubkey`'s encryption key, authenticated by `privkey`'s
/// encryption key.
pub fn encrypt(msg: &[u8], pubkey: &Pubkey, privkey: &Privkey) -> CryptoResult<EncryptedData> {
    let nonce = generate_nonce();

    let secret = SecretKey::from(privkey.encryption_key_bytes()?);
    let public = PublicKey::from(pubkey.encryption_key_bytes()?);

    let sealed = SalsaBox::new(&public, &secret)
        .encrypt(&nonce.into(), msg)
        .map_err(|_| CryptoError::Encryption)?;

    Ok(EncryptedData {
        data: base64_encode(&sealed),
        nonce: base64_encode(&nonce),
    })
}

/// Open a sealed box produced by the holder of `pubkey`'s encryption key for
/// the holder of `privkey`'s encryption key.
pub fn decrypt(
    encrypted: &EncryptedData,
    pubkey: &Pubkey,
    privkey: &Privkey,
) -> CryptoResult<Vec<u8>> {
    let nonce = decode_nonce(&encrypted.nonce)?;

    let secret = SecretKey::from(privkey.encryption_key_bytes()?);
    let public = PublicKey::from(pubkey.encryption_key_bytes()?);
    let ciphertext = base64_decode(&encrypted.data)?;

    SalsaBox::new(&public, &secret)
        .decrypt(&nonce.into(), ciphertext.as_slice())
        .map_err(|_| CryptoError::Decryption)
}
