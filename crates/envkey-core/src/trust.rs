//! Trust graph verification.
//!
//! Every encrypted blob names the identity that encrypted it. That identity
//! is accepted only if it appears in the trusted root, or if an inviter walk
//! through the blob's attached trust chain terminates at a trusted-root
//! member with every hop's signature intact.

use std::collections::{HashMap, HashSet};

use envkey_crypto::{verify_pubkey_signature, Pubkey};
use thiserror::Error;

/// Trust verification failures. These never leave the parser; they collapse
/// to `ENVKEY invalid` at the boundary.
#[derive(Error, Debug)]
pub enum TrustError {
    #[error("signer pubkey does not match trusted pubkey")]
    PubkeyMismatch,

    #[error("signer not trusted")]
    SignerNotTrusted,

    #[error("no signing id")]
    NoSignerId,

    #[error("already checked signing id: {0}")]
    Cycle(String),

    #[error("no trusted root: {0}")]
    NoTrustedRoot(String),

    #[error(transparent)]
    Crypto(#[from] envkey_crypto::CryptoError),
}

/// The identity that encrypted a blob, as claimed by the blob itself.
#[derive(Debug, Clone)]
pub struct Signer {
    pub id: String,
    pub pubkey: Pubkey,
}

/// One identity in the trust graph.
///
/// With an invite pubkey present, the identity is an invited member: the
/// invite pubkey must be signed by `signer_id`, and the main pubkey by the
/// invite pubkey. Otherwise the main pubkey is signed by `signer_id`
/// directly.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustedKeyable {
    pub pubkey: Pubkey,
    pub invite_pubkey: Option<Pubkey>,
    pub signer_id: String,
}

impl TrustedKeyable {
    /// Verify this keyable's signature(s) against the identity that claims
    /// to have signed it.
    pub fn verify_inviter_or_signer(&self, signed_by: &TrustedKeyable) -> Result<(), TrustError> {
        match &self.invite_pubkey {
            None => verify_pubkey_signature(&self.pubkey, &signed_by.pubkey)?,
            Some(invite) => {
                verify_pubkey_signature(invite, &signed_by.pubkey)?;
                verify_pubkey_signature(&self.pubkey, invite)?;
            }
        }
        Ok(())
    }
}

/// Identities keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrustedKeyablesMap(pub HashMap<String, TrustedKeyable>);

impl TrustedKeyablesMap {
    /// Look up `signer` by id and require its pubkey bytes to match.
    /// `Ok(None)` means the id simply isn't present here.
    pub fn signer_trusted_keyable(
        &self,
        signer: &Signer,
    ) -> Result<Option<&TrustedKeyable>, TrustError> {
        match self.0.get(&signer.id) {
            None => Ok(None),
            Some(trusted) => {
                if trusted.pubkey.keys.signing_key == signer.pubkey.keys.signing_key
                    && trusted.pubkey.keys.encryption_key == signer.pubkey.keys.encryption_key
                {
                    Ok(Some(trusted))
                } else {
                    Err(TrustError::PubkeyMismatch)
                }
            }
        }
    }

    /// Walk `signer_id` links from `keyable` until a member of `root` is
    /// reached, verifying every hop. Lookups prefer `root` (terminal) and
    /// fall back to this map; ids may not repeat.
    pub fn verify_trusted_root(
        &self,
        keyable: &TrustedKeyable,
        root: &TrustedKeyablesMap,
    ) -> Result<(), TrustError> {
        let mut current = keyable;
        let mut checked: HashSet<String> = HashSet::new();

        loop {
            if current.signer_id.is_empty() {
                return Err(TrustError::NoSignerId);
            }
            if checked.contains(&current.signer_id) {
                return Err(TrustError::Cycle(current.signer_id.clone()));
            }

            let (signed_by, is_root) = match root.0.get(&current.signer_id) {
                Some(found) => (found, true),
                None => match self.0.get(&current.signer_id) {
                    Some(found) => (found, false),
                    None => return Err(TrustError::NoTrustedRoot(current.signer_id.clone())),
                },
            };

            current.verify_inviter_or_signer(signed_by)?;
            checked.insert(current.signer_id.clone());

            if is_root {
                return Ok(());
            }
            current = signed_by;
        }
    }
}

/// A trusted root plus the chain a blob shipped alongside itself.
#[derive(Debug, Clone)]
pub struct TrustedKeyablesChain {
    pub trusted_root: TrustedKeyablesMap,
    pub trust_chain: TrustedKeyablesMap,
}

impl TrustedKeyablesChain {
    /// Accept `signer` iff it is a trusted-root member, or a chain member
    /// whose inviter walk reaches the root.
    pub fn verify(&self, signer: &Signer) -> Result<(), TrustError> {
        // Root membership is terminal: no further checks.
        if self.trusted_root.signer_trusted_keyable(signer)?.is_some() {
            return Ok(());
        }

        let trusted = self
            .trust_chain
            .signer_trusted_keyable(signer)?
            .ok_or(TrustError::SignerNotTrusted)?;

        self.trust_chain
            .verify_trusted_root(trusted, &self.trusted_root)
    }
}
