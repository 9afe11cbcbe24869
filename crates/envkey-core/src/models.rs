//! Wire models for the fetch protocol.
//!
//! Field names mirror the server's JSON exactly. Optional fields stay
//! `Option` so that a structurally incomplete response is caught by the
//! parser's validation step rather than by deserialization.

use std::collections::{BTreeMap, HashMap};

use envkey_crypto::{EncryptedData, Pubkey, SignedData};
use serde::{Deserialize, Serialize};

/// The final flat environment. Ordered so JSON output is deterministic.
pub type EnvMap = BTreeMap<String, String>;

/// A decrypted environment: variable name to its (possibly indirect) value.
pub type KeyableEnv = HashMap<String, KeyableEnvVal>;

/// Decrypted inheritance-override environments keyed by environment id.
pub type InheritanceOverrides = HashMap<String, KeyableEnv>;

fn is_false(b: &bool) -> bool {
    !*b
}

/// One variable's value in a decrypted environment.
///
/// `is_undefined` removes the variable from the output; `is_empty` keeps it
/// with an empty string; a non-empty `inherits_environment_id` defers to the
/// blob's inheritance overrides; otherwise `val` applies literally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyableEnvVal {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub val: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inherits_environment_id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_undefined: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_empty: bool,
}

impl KeyableEnvVal {
    /// A literal value.
    pub fn val(v: &str) -> Self {
        KeyableEnvVal {
            val: v.to_string(),
            ..Default::default()
        }
    }

    /// A value deferred to another environment.
    pub fn inherits(environment_id: &str) -> Self {
        KeyableEnvVal {
            inherits_environment_id: environment_id.to_string(),
            ..Default::default()
        }
    }
}

/// One encrypted environment payload and the identity that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyableBlobFields {
    pub encrypted_env: Option<EncryptedData>,
    pub encrypted_key: Option<EncryptedData>,
    #[serde(default)]
    pub encrypted_by_pubkey_id: String,
    pub encrypted_by_pubkey: Option<Pubkey>,
    pub encrypted_by_trust_chain: Option<SignedData>,
}

impl KeyableBlobFields {
    pub(crate) fn is_valid(&self) -> bool {
        !self.encrypted_by_pubkey_id.is_empty()
            && self.encrypted_by_pubkey.is_some()
            && self.encrypted_by_trust_chain.is_some()
            && self.encrypted_env.is_some()
    }
}

/// A group of encrypted payloads for one app or block: base env, optional
/// sub-env and locals, and any inheritance-override environments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyableBlob {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<KeyableBlobFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_env: Option<KeyableBlobFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locals: Option<KeyableBlobFields>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inheritance_overrides: HashMap<String, KeyableBlobFields>,
}

impl KeyableBlob {
    pub(crate) fn is_valid(&self) -> bool {
        let fields = [&self.env, &self.sub_env, &self.locals];
        fields
            .iter()
            .filter_map(|f| f.as_ref())
            .all(KeyableBlobFields::is_valid)
            && self.inheritance_overrides.values().all(|f| f.is_valid())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.env.is_none()
            && self.sub_env.is_none()
            && self.locals.is_none()
            && self.inheritance_overrides.is_empty()
    }
}

/// An in-band rotation of the trusted root, proven by a chain signed with
/// the replacing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootPubkeyReplacement {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub replacing_pubkey_id: String,
    pub replacing_pubkey: Option<Pubkey>,
    pub signed_replacing_trust_chain: Option<SignedData>,
}

/// The server's answer to a fetch: everything needed to verify and decrypt
/// one environment. The top-level keyable blob's fields are inlined, the
/// way the server flattens them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<KeyableBlobFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_env: Option<KeyableBlobFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locals: Option<KeyableBlobFields>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inheritance_overrides: HashMap<String, KeyableBlobFields>,

    #[serde(default)]
    pub org_id: String,
    pub encrypted_privkey: Option<EncryptedData>,
    pub pubkey: Option<Pubkey>,
    pub signed_trusted_root: Option<SignedData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<KeyableBlob>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub root_pubkey_replacements: Vec<RootPubkeyReplacement>,
}

impl FetchResponse {
    /// The inlined top-level blob, if any of its fields are present.
    pub fn keyable_blob(&self) -> Option<KeyableBlob> {
        let blob = KeyableBlob {
            env: self.env.clone(),
            sub_env: self.sub_env.clone(),
            locals: self.locals.clone(),
            inheritance_overrides: self.inheritance_overrides.clone(),
        };
        if blob.is_empty() {
            None
        } else {
            Some(blob)
        }
    }
}

/// The body a failover endpoint returns instead of the blob itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverResponse {
    pub signed_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyable_env_val_wire_names() {
        let val: KeyableEnvVal =
            serde_json::from_str(r#"{"inheritsEnvironmentId":"env-1"}"#).unwrap();
        assert_eq!(val.inherits_environment_id, "env-1");
        assert!(!val.is_undefined);

        let flags: KeyableEnvVal =
            serde_json::from_str(r#"{"isUndefined":true,"isEmpty":false}"#).unwrap();
        assert!(flags.is_undefined);
    }

    #[test]
    fn test_keyable_env_val_omits_defaults() {
        let json = serde_json::to_string(&KeyableEnvVal::val("x")).unwrap();
        assert_eq!(json, r#"{"val":"x"}"#);
    }

    #[test]
    fn test_fetch_response_flattened_blob() {
        let response: FetchResponse = serde_json::from_str(
            r#"{
                "orgId": "org-1",
                "env": {
                    "encryptedEnv": {"data": "x", "nonce": "y"},
                    "encryptedKey": {"data": "x", "nonce": "y"},
                    "encryptedByPubkeyId": "admin-id",
                    "encryptedByPubkey": {"keys": {"signingKey": "", "encryptionKey": ""}, "signature": ""},
                    "encryptedByTrustChain": {"data": "z"}
                }
            }"#,
        )
        .unwrap();

        let blob = response.keyable_blob().unwrap();
        assert!(blob.is_valid());
        assert_eq!(
            blob.env.unwrap().encrypted_by_pubkey_id,
            "admin-id"
        );
    }

    #[test]
    fn test_empty_response_has_no_blob() {
        let response = FetchResponse::default();
        assert!(response.keyable_blob().is_none());
    }

    #[test]
    fn test_blob_missing_subfield_invalid() {
        let blob = KeyableBlob {
            env: Some(KeyableBlobFields {
                encrypted_env: None,
                encrypted_key: None,
                encrypted_by_pubkey_id: "id".into(),
                encrypted_by_pubkey: None,
                encrypted_by_trust_chain: None,
            }),
            ..Default::default()
        };
        assert!(!blob.is_valid());
    }
}
