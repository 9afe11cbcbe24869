//! Key and envelope types shared across the fetch protocol.
//!
//! All keys travel as standard base64 of raw key bytes. JSON field names and
//! their order are part of the signed wire format and must not change:
//! pubkey signatures are computed over the compact JSON of
//! `{"signingKey":…,"encryptionKey":…}` exactly as serialized here.

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CryptoResult;
use crate::format::{base64_encode, decode_fixed, BOX_KEY_LEN, SIGNING_PRIVKEY_LEN};

/// A pair of base64-encoded raw keys. Public or private depending on the
/// containing type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EncryptionAndSigningKeys {
    #[serde(rename = "signingKey")]
    pub signing_key: String,
    #[serde(rename = "encryptionKey")]
    pub encryption_key: String,
}

/// A public identity: Ed25519 signing key plus Curve25519 encryption key,
/// with a detached signature by the issuing identity. Only a self-rooted
/// pubkey carries an empty signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pubkey {
    pub keys: EncryptionAndSigningKeys,
    #[serde(default)]
    pub signature: String,
}

/// The private counterpart of a [`Pubkey`]. Lives for one fetch cycle and is
/// wiped on drop.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct Privkey {
    pub keys: EncryptionAndSigningKeys,
}

impl Privkey {
    /// Decode the Curve25519 secret key bytes.
    pub fn encryption_key_bytes(&self) -> CryptoResult<[u8; BOX_KEY_LEN]> {
        decode_fixed(&self.keys.encryption_key)
    }

    /// Decode the Ed25519 secret key bytes (seed followed by public key).
    pub fn signing_key_bytes(&self) -> CryptoResult<[u8; SIGNING_PRIVKEY_LEN]> {
        decode_fixed(&self.keys.signing_key)
    }
}

impl std::fmt::Debug for Privkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Privkey")
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

impl Zeroize for Privkey {
    fn zeroize(&mut self) {
        self.keys.signing_key.zeroize();
        self.keys.encryption_key.zeroize();
    }
}

impl Drop for Privkey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl Pubkey {
    /// Decode the Curve25519 public key bytes.
    pub fn encryption_key_bytes(&self) -> CryptoResult<[u8; BOX_KEY_LEN]> {
        decode_fixed(&self.keys.encryption_key)
    }

    /// Decode the Ed25519 public key bytes.
    pub fn signing_key_bytes(&self) -> CryptoResult<[u8; BOX_KEY_LEN]> {
        decode_fixed(&self.keys.signing_key)
    }
}

/// An encrypted payload: base64 ciphertext plus its 24-byte nonce. The same
/// shape carries both sealed-box and secretbox payloads; which one applies
/// is positional in the containing structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub data: String,
    pub nonce: String,
}

/// A signed-message envelope: base64 of a 64-byte Ed25519 signature followed
/// by the cleartext it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedData {
    pub data: String,
}

/// A freshly generated identity, used for ephemeral senders and test
/// fixtures.
pub struct Keypair {
    pub pubkey: Pubkey,
    pub privkey: Privkey,
}

impl Keypair {
    /// Generate a new signing + encryption keypair with an empty signature.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let signing = SigningKey::generate(&mut rng);
        let encryption = crypto_box::SecretKey::generate(&mut rng);

        let pubkey = Pubkey {
            keys: EncryptionAndSigningKeys {
                signing_key: base64_encode(signing.verifying_key().as_bytes()),
                encryption_key: base64_encode(encryption.public_key().as_bytes()),
            },
            signature: String::new(),
        };
        let privkey = Privkey {
            keys: EncryptionAndSigningKeys {
                signing_key: base64_encode(&signing.to_keypair_bytes()),
                encryption_key: base64_encode(&encryption.to_bytes()),
            },
        };

        Keypair { pubkey, privkey }
    }
}
