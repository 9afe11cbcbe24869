//! Ed25519 signatures: detached, signed-message envelopes, and canonical
//! JSON signing over protocol objects.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;

use crate::error::{CryptoError, CryptoResult};
use crate::format::{base64_decode, base64_encode, SIGNATURE_LEN};
use crate::keys::{Keypair, Privkey, Pubkey, SignedData};
use crate::seal;

fn verifying_key(pubkey: &Pubkey) -> CryptoResult<VerifyingKey> {
    let bytes = pubkey.signing_key_bytes()?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::Signature)
}

fn signing_key(privkey: &Privkey) -> CryptoResult<SigningKey> {
    let bytes = privkey.signing_key_bytes()?;
    SigningKey::from_keypair_bytes(&bytes).map_err(|_| CryptoError::Signature)
}

/// Verify a detached Ed25519 signature over `msg` with `pubkey`'s signing
/// key.
pub fn verify_detached(msg: &[u8], sig: &[u8], pubkey: &Pubkey) -> CryptoResult<()> {
    let signature = Signature::from_slice(sig).map_err(|_| CryptoError::Signature)?;
    verifying_key(pubkey)?
        .verify(msg, &signature)
        .map_err(|_| CryptoError::Signature)
}

/// Open a signed-message envelope (64-byte signature followed by cleartext),
/// returning the embedded cleartext.
pub fn verify_signed_cleartext(signed: &[u8], pubkey: &Pubkey) -> CryptoResult<Vec<u8>> {
    if signed.len() < SIGNATURE_LEN {
        return Err(CryptoError::Signature);
    }
    let (sig, msg) = signed.split_at(SIGNATURE_LEN);
    verify_detached(msg, sig, pubkey)?;
    Ok(msg.to_vec())
}

/// Verify that `signed_pubkey` carries a valid detached signature by
/// `signer_pubkey` over the canonical JSON of its key pair.
pub fn verify_pubkey_signature(signed_pubkey: &Pubkey, signer_pubkey: &Pubkey) -> CryptoResult<()> {
    let keys_json = serde_json::to_vec(&signed_pubkey.keys)?;
    let sig = base64_decode(&signed_pubkey.signature)?;
    verify_detached(&keys_json, &sig, signer_pubkey)
}

/// Serialize `obj` to canonical JSON and wrap it in a signed-message
/// envelope.
pub fn sign_json<T: Serialize>(obj: &T, privkey: &Privkey) -> CryptoResult<SignedData> {
    let json = serde_json::to_vec(obj)?;
    let key = signing_key(privkey)?;
    let signature = key.sign(&json);

    let mut envelope = Vec::with_capacity(SIGNATURE_LEN + json.len());
    envelope.extend_from_slice(&signature.to_bytes());
    envelope.extend_from_slice(&json);

    Ok(SignedData {
        data: base64_encode(&envelope),
    })
}

/// Serialize `obj` to canonical JSON and return a detached base64 signature
/// over it.
pub fn sign_json_detached<T: Serialize>(obj: &T, privkey: &Privkey) -> CryptoResult<String> {
    let json = serde_json::to_vec(obj)?;
    let key = signing_key(privkey)?;
    Ok(base64_encode(&key.sign(&json).to_bytes()))
}

/// Attach to `subject` a detached signature by `signer` over its canonical
/// key JSON. The inverse of [`verify_pubkey_signature`].
pub fn sign_pubkey(subject: &mut Pubkey, signer: &Privkey) -> CryptoResult<()> {
    subject.signature = sign_json_detached(&subject.keys, signer)?;
    Ok(())
}

/// Confirm that `pubkey` and `privkey` are two halves of the same identity:
/// a probe sealed to the encryption key must open with the private key, and
/// a probe signed with the private key must verify with the signing key.
pub fn verify_pubkey_with_privkey(pubkey: &Pubkey, privkey: &Privkey) -> CryptoResult<()> {
    let msg = b"test message";

    // Senders can open their own boxes, so the probe needs an ephemeral
    // sender rather than the keypair under test.
    let ephemeral = Keypair::generate();

    let encrypted = seal::encrypt(msg, pubkey, &ephemeral.privkey)?;
    let decrypted = seal::decrypt(&encrypted, &ephemeral.pubkey, privkey)?;

    if decrypted != msg {
        return Err(CryptoError::KeypairMismatch);
    }

    let key = signing_key(privkey)?;
    let sig = key.sign(msg);
    verify_detached(msg, &sig.to_bytes(), pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_json_envelope_roundtrip() {
        let keypair = Keypair::generate();
        let payload = serde_json::json!({"hello": "world"});

        let signed = sign_json(&payload, &keypair.privkey).unwrap();
        let envelope = base64_decode(&signed.data).unwrap();
        let cleartext = verify_signed_cleartext(&envelope, &keypair.pubkey).unwrap();

        assert_eq!(cleartext, serde_json::to_vec(&payload).unwrap());
    }

    #[test]
    fn test_envelope_rejects_wrong_signer() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();

        let signed = sign_json(&serde_json::json!({"a": 1}), &keypair.privkey).unwrap();
        let envelope = base64_decode(&signed.data).unwrap();

        let result = verify_signed_cleartext(&envelope, &other.pubkey);
        assert!(matches!(result, Err(CryptoError::Signature)));
    }

    #[test]
    fn test_envelope_too_short() {
        let keypair = Keypair::generate();
        let result = verify_signed_cleartext(&[0u8; 10], &keypair.pubkey);
        assert!(matches!(result, Err(CryptoError::Signature)));
    }

    #[test]
    fn test_detached_signature_roundtrip() {
        let keypair = Keypair::generate();
        let sig = sign_json_detached(&"payload", &keypair.privkey).unwrap();
        let sig_bytes = base64_decode(&sig).unwrap();
        let msg = serde_json::to_vec(&"payload").unwrap();

        assert!(verify_detached(&msg, &sig_bytes, &keypair.pubkey).is_ok());
    }

    #[test]
    fn test_detached_signature_tampered_message() {
        let keypair = Keypair::generate();
        let sig = sign_json_detached(&"payload", &keypair.privkey).unwrap();
        let sig_bytes = base64_decode(&sig).unwrap();

        let result = verify_detached(b"other message", &sig_bytes, &keypair.pubkey);
        assert!(matches!(result, Err(CryptoError::Signature)));
    }

    #[test]
    fn test_verify_pubkey_signature() {
        let signer = Keypair::generate();
        let mut subject = Keypair::generate();
        sign_pubkey(&mut subject.pubkey, &signer.privkey).unwrap();

        assert!(verify_pubkey_signature(&subject.pubkey, &signer.pubkey).is_ok());
    }

    #[test]
    fn test_verify_pubkey_signature_wrong_signer() {
        let signer = Keypair::generate();
        let impostor = Keypair::generate();
        let mut subject = Keypair::generate();
        sign_pubkey(&mut subject.pubkey, &signer.privkey).unwrap();

        let result = verify_pubkey_signature(&subject.pubkey, &impostor.pubkey);
        assert!(matches!(result, Err(CryptoError::Signature)));
    }

    #[test]
    fn test_verify_pubkey_with_privkey_matching() {
        let keypair = Keypair::generate();
        assert!(verify_pubkey_with_privkey(&keypair.pubkey, &keypair.privkey).is_ok());
    }

    #[test]
    fn test_verify_pubkey_with_privkey_mismatched() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert!(verify_pubkey_with_privkey(&a.pubkey, &b.privkey).is_err());
    }
}
