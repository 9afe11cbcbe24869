//! Fetch-response parsing: validation, root key derivation, trust
//! verification, concurrent decryption, and composition of the final
//! environment map.
//!
//! Internally every failure carries its cause, but [`FetchResponse::parse`]
//! collapses all of them to [`Error::EnvkeyInvalid`]: a caller can't be
//! allowed to distinguish "wrong password" from "forged trust chain".

use std::collections::HashMap;

use envkey_crypto::{
    base64_decode, decrypt, decrypt_symmetric, sign_json, verify_pubkey_with_privkey,
    verify_signed_cleartext, CryptoError, Privkey, Pubkey, SignedData,
};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::debug;

use crate::defaults::INHERITANCE_FOLLOW_CAP;
use crate::error::{Error, Result};
use crate::models::{
    EnvMap, FetchResponse, InheritanceOverrides, KeyableBlob, KeyableBlobFields, KeyableEnv,
    KeyableEnvVal, RootPubkeyReplacement,
};
use crate::trust::{Signer, TrustError, TrustedKeyable, TrustedKeyablesChain, TrustedKeyablesMap};

/// Everything a successful parse yields: the flat environment, the
/// decrypted private key (needed for the root-replacement acknowledgement),
/// and the replacement outcome.
pub struct ParsedEnv {
    pub env: EnvMap,
    pub privkey: Privkey,
    pub new_signed_trusted_root: Option<SignedData>,
    pub replacement_ids: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ParseError {
    #[error("required fields are empty")]
    MissingFields,

    #[error("trusted keyable entry must be an array of 2-4 elements")]
    BadTrustedEntry,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("decrypt worker failed: {0}")]
    Join(String),
}

impl FetchResponse {
    /// Verify and decrypt this response with the ENVKEY's password segment.
    pub async fn parse(&self, encryption_key: &str) -> Result<ParsedEnv> {
        match self.parse_inner(encryption_key).await {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                debug!(error = %err, "response failed verification or decryption");
                Err(Error::EnvkeyInvalid)
            }
        }
    }

    async fn parse_inner(&self, encryption_key: &str) -> std::result::Result<ParsedEnv, ParseError> {
        self.validate()?;

        let encrypted_privkey = self.encrypted_privkey.as_ref().ok_or(ParseError::MissingFields)?;
        let pubkey = self.pubkey.as_ref().ok_or(ParseError::MissingFields)?;
        let signed_root = self
            .signed_trusted_root
            .as_ref()
            .ok_or(ParseError::MissingFields)?;

        // Unwrap the private key and confirm it matches the claimed pubkey.
        let privkey_bytes = decrypt_symmetric(encrypted_privkey, encryption_key.as_bytes())?;
        let privkey: Privkey = serde_json::from_slice(&privkey_bytes)?;
        verify_pubkey_with_privkey(pubkey, &privkey)?;

        let trusted_root = parse_trusted_keys(signed_root, pubkey)?;
        let (trusted_root, new_signed_trusted_root, replacement_ids) =
            apply_root_replacements(trusted_root, &self.root_pubkey_replacements, &privkey)?;

        // Fan out per blob; each blob fans out again per field. Any single
        // failure fails the whole parse.
        let mut tasks: JoinSet<(usize, std::result::Result<DecryptedBlob, ParseError>)> =
            JoinSet::new();

        if let Some(blob) = self.keyable_blob() {
            let privkey = privkey.clone();
            let root = trusted_root.clone();
            tasks.spawn(async move { (0, decrypt_blob(blob, privkey, root).await) });
        }
        for (i, block) in self.blocks.iter().enumerate() {
            let block = block.clone();
            let privkey = privkey.clone();
            let root = trusted_root.clone();
            tasks.spawn(async move { (i + 1, decrypt_blob(block, privkey, root).await) });
        }

        let mut top: Option<DecryptedBlob> = None;
        let mut blocks: Vec<Option<DecryptedBlob>> =
            self.blocks.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| ParseError::Join(e.to_string()))?;
            let blob = result?;
            if index == 0 {
                top = Some(blob);
            } else {
                blocks[index - 1] = Some(blob);
            }
        }
        let blocks: Vec<DecryptedBlob> = blocks.into_iter().flatten().collect();

        let env = compose(top.as_ref(), &blocks);

        Ok(ParsedEnv {
            env,
            privkey,
            new_signed_trusted_root,
            replacement_ids,
        })
    }

    fn validate(&self) -> std::result::Result<(), ParseError> {
        if self.signed_trusted_root.is_none()
            || self.encrypted_privkey.is_none()
            || self.pubkey.is_none()
        {
            return Err(ParseError::MissingFields);
        }

        if let Some(blob) = self.keyable_blob() {
            if !blob.is_valid() {
                return Err(ParseError::MissingFields);
            }
        }
        if self.blocks.iter().any(|block| !block.is_valid()) {
            return Err(ParseError::MissingFields);
        }

        Ok(())
    }
}

/// Open a signed trust-map envelope and decode its `[kind, pubkey, …]`
/// entries. Verification runs over the raw recovered bytes; nothing is
/// re-serialized.
fn parse_trusted_keys(
    raw: &SignedData,
    signer_pubkey: &Pubkey,
) -> std::result::Result<TrustedKeyablesMap, ParseError> {
    let raw_bytes = base64_decode(&raw.data)?;
    let verified = verify_signed_cleartext(&raw_bytes, signer_pubkey)?;
    let entries: HashMap<String, Vec<Value>> = serde_json::from_slice(&verified)?;

    let mut map = HashMap::with_capacity(entries.len());
    for (id, entry) in entries {
        if entry.len() < 2 || entry.len() > 4 {
            return Err(ParseError::BadTrustedEntry);
        }

        let pubkey: Pubkey = serde_json::from_value(entry[1].clone())?;
        let (invite_pubkey, signer_id) = match entry.len() {
            2 => (None, String::new()),
            3 => (None, entry_string(&entry[2])?),
            _ => {
                let invite = match &entry[2] {
                    Value::Null => None,
                    value => Some(serde_json::from_value(value.clone())?),
                };
                (invite, entry_string(&entry[3])?)
            }
        };

        map.insert(
            id,
            TrustedKeyable {
                pubkey,
                invite_pubkey,
                signer_id,
            },
        );
    }

    Ok(TrustedKeyablesMap(map))
}

fn entry_string(value: &Value) -> std::result::Result<String, ParseError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        _ => Err(ParseError::BadTrustedEntry),
    }
}

/// Apply root replacements in order. Each verified replacement collapses
/// the trusted root to a singleton holding the replacing key. When any
/// applied, the new root is re-signed with the ENVKEY's own key as the
/// acknowledgement payload to post back.
fn apply_root_replacements(
    mut trusted_root: TrustedKeyablesMap,
    replacements: &[RootPubkeyReplacement],
    privkey: &Privkey,
) -> std::result::Result<(TrustedKeyablesMap, Option<SignedData>, Vec<String>), ParseError> {
    if replacements.is_empty() {
        return Ok((trusted_root, None, Vec::new()));
    }

    let mut replacement_ids = Vec::with_capacity(replacements.len());
    let mut new_root_id = String::new();
    let mut new_root_pubkey: Option<Pubkey> = None;

    for replacement in replacements {
        let replacing_pubkey = replacement
            .replacing_pubkey
            .as_ref()
            .ok_or(ParseError::MissingFields)?;
        let signed_chain = replacement
            .signed_replacing_trust_chain
            .as_ref()
            .ok_or(ParseError::MissingFields)?;

        let trust_chain = parse_trusted_keys(signed_chain, replacing_pubkey)?;
        let chain = TrustedKeyablesChain {
            trusted_root,
            trust_chain,
        };
        chain.verify(&Signer {
            id: replacement.replacing_pubkey_id.clone(),
            pubkey: replacing_pubkey.clone(),
        })?;

        trusted_root = TrustedKeyablesMap(HashMap::from([(
            replacement.replacing_pubkey_id.clone(),
            TrustedKeyable {
                pubkey: replacing_pubkey.clone(),
                invite_pubkey: None,
                signer_id: String::new(),
            },
        )]));
        new_root_id = replacement.replacing_pubkey_id.clone();
        new_root_pubkey = Some(replacing_pubkey.clone());
        replacement_ids.push(replacement.id.clone());
    }

    let new_root_pubkey = new_root_pubkey.ok_or(ParseError::MissingFields)?;
    let mut to_sign = serde_json::Map::new();
    to_sign.insert(new_root_id, json!(["root", new_root_pubkey]));
    let signed = sign_json(&Value::Object(to_sign), privkey)?;

    Ok((trusted_root, Some(signed), replacement_ids))
}

/// One blob after trust verification and decryption.
#[derive(Debug, Default)]
struct DecryptedBlob {
    env: Option<KeyableEnv>,
    sub_env: Option<KeyableEnv>,
    locals: Option<KeyableEnv>,
    inheritance_overrides: InheritanceOverrides,
}

enum FieldSlot {
    Env,
    SubEnv,
    Locals,
    Override(String),
}

/// Verify one field's trust chain and decrypt its payload.
fn decrypt_field(
    fields: KeyableBlobFields,
    privkey: Privkey,
    trusted_root: TrustedKeyablesMap,
) -> std::result::Result<KeyableEnv, ParseError> {
    let pubkey = fields.encrypted_by_pubkey.ok_or(ParseError::MissingFields)?;
    let signed_chain = fields
        .encrypted_by_trust_chain
        .ok_or(ParseError::MissingFields)?;
    let encrypted_env = fields.encrypted_env.ok_or(ParseError::MissingFields)?;
    let encrypted_key = fields.encrypted_key.ok_or(ParseError::MissingFields)?;

    let trust_chain = parse_trusted_keys(&signed_chain, &pubkey)?;
    let chain = TrustedKeyablesChain {
        trusted_root,
        trust_chain,
    };
    chain.verify(&Signer {
        id: fields.encrypted_by_pubkey_id,
        pubkey: pubkey.clone(),
    })?;

    let sym_key = decrypt(&encrypted_key, &pubkey, &privkey)?;
    let plaintext = decrypt_symmetric(&encrypted_env, &sym_key)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Decrypt every field of a blob concurrently.
async fn decrypt_blob(
    blob: KeyableBlob,
    privkey: Privkey,
    trusted_root: TrustedKeyablesMap,
) -> std::result::Result<DecryptedBlob, ParseError> {
    let mut tasks: JoinSet<(FieldSlot, std::result::Result<KeyableEnv, ParseError>)> =
        JoinSet::new();

    {
        let mut spawn = |slot: FieldSlot, fields: KeyableBlobFields| {
            let privkey = privkey.clone();
            let root = trusted_root.clone();
            tasks.spawn_blocking(move || (slot, decrypt_field(fields, privkey, root)));
        };

        if let Some(fields) = blob.env {
            spawn(FieldSlot::Env, fields);
        }
        if let Some(fields) = blob.sub_env {
            spawn(FieldSlot::SubEnv, fields);
        }
        if let Some(fields) = blob.locals {
            spawn(FieldSlot::Locals, fields);
        }
        for (environment_id, fields) in blob.inheritance_overrides {
            spawn(FieldSlot::Override(environment_id), fields);
        }
    }

    let mut decrypted = DecryptedBlob::default();
    while let Some(joined) = tasks.join_next().await {
        let (slot, result) = joined.map_err(|e| ParseError::Join(e.to_string()))?;
        let env = result?;
        match slot {
            FieldSlot::Env => decrypted.env = Some(env),
            FieldSlot::SubEnv => decrypted.sub_env = Some(env),
            FieldSlot::Locals => decrypted.locals = Some(env),
            FieldSlot::Override(environment_id) => {
                decrypted.inheritance_overrides.insert(environment_id, env);
            }
        }
    }

    Ok(decrypted)
}

impl DecryptedBlob {
    /// Split into the base layer and the locals-or-subenv layer, resolving
    /// inheritance links against this blob's overrides.
    fn to_keyable_envs(&self) -> (KeyableEnv, KeyableEnv) {
        let mut env = KeyableEnv::new();
        let mut locals_or_sub = KeyableEnv::new();

        if let Some(base) = &self.env {
            for (key, val) in base {
                if let Some(resolved) = self.resolve(key, val) {
                    env.insert(key.clone(), resolved);
                }
            }
        }

        if let Some(sub) = &self.sub_env {
            for (key, val) in sub {
                if let Some(resolved) = self.resolve(key, val) {
                    locals_or_sub.insert(key.clone(), resolved);
                }
            }
        }

        if let Some(locals) = &self.locals {
            for (key, val) in locals {
                locals_or_sub.insert(key.clone(), val.clone());
            }
        }

        (env, locals_or_sub)
    }

    /// Follow `inheritsEnvironmentId` links, bounded so a cyclic override
    /// graph can't spin forever. A broken or over-long chain drops the key.
    fn resolve(&self, key: &str, val: &KeyableEnvVal) -> Option<KeyableEnvVal> {
        let mut current = Some(val);
        for _ in 0..INHERITANCE_FOLLOW_CAP {
            match current {
                Some(v) if !v.inherits_environment_id.is_empty() => {
                    current = self
                        .inheritance_overrides
                        .get(&v.inherits_environment_id)
                        .and_then(|overrides| overrides.get(key));
                }
                other => return other.cloned(),
            }
        }
        None
    }
}

fn set_val(env: &mut EnvMap, key: &str, val: &KeyableEnvVal) {
    if val.is_undefined {
        env.remove(key);
    } else if val.is_empty {
        env.insert(key.to_string(), String::new());
    } else {
        env.insert(key.to_string(), val.val.clone());
    }
}

/// Fold decrypted blobs into the final map. Blocks apply in input order,
/// then the top-level blob; the accumulated locals-or-subenv layer overlays
/// everything at the end.
fn compose(top: Option<&DecryptedBlob>, blocks: &[DecryptedBlob]) -> EnvMap {
    let mut env = EnvMap::new();
    let mut locals_or_sub = KeyableEnv::new();

    for block in blocks {
        let (block_env, block_locals_or_sub) = block.to_keyable_envs();
        for (key, val) in &block_env {
            set_val(&mut env, key, val);
        }
        locals_or_sub.extend(block_locals_or_sub);
    }

    if let Some(blob) = top {
        let (blob_env, blob_locals_or_sub) = blob.to_keyable_envs();
        for (key, val) in &blob_env {
            set_val(&mut env, key, val);
        }
        locals_or_sub.extend(blob_locals_or_sub);
    }

    for (key, val) in &locals_or_sub {
        set_val(&mut env, key, val);
    }

    env
}
