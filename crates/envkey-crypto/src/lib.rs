//! # envkey-crypto
//!
//! Cryptographic primitives for envkey-source.
//!
//! This crate implements the NaCl-compatible primitives the fetch protocol
//! is built on, plus the canonical-JSON signing conventions shared with the
//! server.
//!
//! ## Cryptographic Primitives
//!
//! - **Asymmetric encryption**: Curve25519 sealed boxes (XSalsa20-Poly1305)
//! - **Symmetric encryption**: XSalsa20-Poly1305 secretbox, keyed by
//!   SHA-256 of high-entropy key material
//! - **Signatures**: Ed25519, both detached and signed-message envelopes
//!   (signature bytes followed by cleartext)
//!
//! ## Canonical JSON
//!
//! Signatures are computed over exact bytes. Pubkey signatures cover the
//! compact JSON `{"signingKey":…,"encryptionKey":…}` in that field order;
//! signed trust maps are verified against the raw bytes recovered from the
//! envelope and are never re-serialized before verification.
//!
//! ## Examples
//!
//! ```rust
//! use envkey_crypto::{decrypt, encrypt, Keypair};
//!
//! let sender = Keypair::generate();
//! let recipient = Keypair::generate();
//!
//! let sealed = encrypt(b"secret config", &recipient.pubkey, &sender.privkey).unwrap();
//! let opened = decrypt(&sealed, &sender.pubkey, &recipient.privkey).unwrap();
//! assert_eq!(opened, b"secret config");
//! ```
//!
//! ```rust
//! use envkey_crypto::{encrypt_symmetric, decrypt_symmetric};
//!
//! let sealed = encrypt_symmetric(b"payload", b"high-entropy-password").unwrap();
//! let opened = decrypt_symmetric(&sealed, b"high-entropy-password").unwrap();
//! assert_eq!(opened, b"payload");
//! ```

pub mod error;
pub mod format;
pub mod keys;
pub mod seal;
pub mod secret;
pub mod sign;

pub use error::{CryptoError, CryptoResult};
pub use format::{base64_decode, base64_encode};
pub use keys::{
    EncryptedData, EncryptionAndSigningKeys, Keypair, Privkey, Pubkey, SignedData,
};
pub use seal::{decrypt, encrypt};
pub use secret::{decrypt_symmetric, encrypt_symmetric};
pub use sign::{
    sign_json, sign_json_detached, sign_pubkey, verify_detached, verify_pubkey_signature,
    verify_pubkey_with_privkey, verify_signed_cleartext,
};
