//! Server-side response builder for tests.
//!
//! Mirrors the signing and encryption rules the server applies when it
//! assembles a fetch response: a trusted root signed by the ENVKEY's own
//! signing key, invite-linked trust chains, sealed per-environment symmetric
//! keys, and secretbox-wrapped payloads. Used by the parser's unit tests and
//! by integration tests that need a decryptable body on the wire.

use envkey_crypto::{
    encrypt, encrypt_symmetric, sign_json, sign_pubkey, EncryptedData, Keypair, Privkey, Pubkey,
    SignedData,
};
use serde_json::{json, Value};

use crate::models::{FetchResponse, KeyableBlobFields};

/// One identity in a synthetic trust graph.
pub struct TestIdentity {
    pub id: String,
    pub kind: &'static str,
    pub signer_id: String,
    pub keypair: Keypair,
    pub invite: Option<Keypair>,
}

impl TestIdentity {
    /// A self-rooted identity: unsigned pubkey, no inviter.
    pub fn root(id: &str) -> Self {
        TestIdentity {
            id: id.to_string(),
            kind: "root",
            signer_id: String::new(),
            keypair: Keypair::generate(),
            invite: None,
        }
    }

    /// An invited identity: invite pubkey signed by the inviter, main
    /// pubkey signed by the invite key.
    pub fn invited(id: &str, inviter: &TestIdentity) -> Self {
        let mut invite = Keypair::generate();
        sign_pubkey(&mut invite.pubkey, &inviter.keypair.privkey).unwrap();

        let mut keypair = Keypair::generate();
        sign_pubkey(&mut keypair.pubkey, &invite.privkey).unwrap();

        TestIdentity {
            id: id.to_string(),
            kind: "orgUserDevice",
            signer_id: inviter.id.clone(),
            keypair,
            invite: Some(invite),
        }
    }

    pub fn pubkey(&self) -> &Pubkey {
        &self.keypair.pubkey
    }

    /// The `[kind, pubkey, invite?, signerId]` array form used inside
    /// signed trust maps.
    pub fn entry(&self) -> Value {
        match &self.invite {
            None => json!([self.kind, self.keypair.pubkey, Value::Null, self.signer_id]),
            Some(invite) => json!([self.kind, self.keypair.pubkey, invite.pubkey, self.signer_id]),
        }
    }
}

/// A trust map JSON object over the given members.
pub fn trust_map(members: &[&TestIdentity]) -> Value {
    let mut map = serde_json::Map::new();
    for member in members {
        map.insert(member.id.clone(), member.entry());
    }
    Value::Object(map)
}

/// A trust map envelope-signed by `signer`.
pub fn signed_trust_map(members: &[&TestIdentity], signer: &Privkey) -> SignedData {
    sign_json(&trust_map(members), signer).unwrap()
}

/// A full synthetic trust graph: a root owner, a chain of invited admins,
/// a dev at the end of the chain, and the ENVKEY identity itself.
pub struct TestGraph {
    pub password: String,
    pub owner: TestIdentity,
    pub admin: TestIdentity,
    pub admin2: TestIdentity,
    pub admin3: TestIdentity,
    pub dev: TestIdentity,
    pub keyable: Keypair,
    pub encrypted_privkey: EncryptedData,
    pub signed_trusted_root: SignedData,
}

impl TestGraph {
    pub fn new() -> Self {
        let password = "3UVxGywSBjbAvqwd".to_string();

        let owner = TestIdentity::root("owner-id");
        let admin = TestIdentity::invited("admin-id", &owner);
        let admin2 = TestIdentity::invited("admin2-id", &admin);
        let admin3 = TestIdentity::invited("admin3-id", &admin2);
        let dev = TestIdentity::invited("dev-id", &admin3);

        let mut keyable = Keypair::generate();
        sign_pubkey(&mut keyable.pubkey, &admin.keypair.privkey).unwrap();

        let privkey_json = serde_json::to_vec(&keyable.privkey).unwrap();
        let encrypted_privkey = encrypt_symmetric(&privkey_json, password.as_bytes()).unwrap();

        let signed_trusted_root = signed_trust_map(&[&owner], &keyable.privkey);

        TestGraph {
            password,
            owner,
            admin,
            admin2,
            admin3,
            dev,
            keyable,
            encrypted_privkey,
            signed_trusted_root,
        }
    }

    /// The admin-level chain, signed by the given member's key.
    pub fn admin_chain(&self, signer: &TestIdentity) -> SignedData {
        signed_trust_map(&[&self.admin, &self.admin2], &signer.keypair.privkey)
    }

    /// The full chain down to the dev identity, signed by the given member.
    pub fn dev_chain(&self, signer: &TestIdentity) -> SignedData {
        signed_trust_map(
            &[&self.admin, &self.admin2, &self.admin3, &self.dev],
            &signer.keypair.privkey,
        )
    }

    /// An encrypted payload: `env_json` secretboxed under `sym_key`, the
    /// symmetric key sealed between `by` and the ENVKEY identity.
    pub fn field(
        &self,
        env_json: &str,
        sym_key: &str,
        by: &TestIdentity,
        chain: SignedData,
    ) -> KeyableBlobFields {
        KeyableBlobFields {
            encrypted_env: Some(encrypt_symmetric(env_json.as_bytes(), sym_key.as_bytes()).unwrap()),
            encrypted_key: Some(
                encrypt(sym_key.as_bytes(), by.pubkey(), &self.keyable.privkey).unwrap(),
            ),
            encrypted_by_pubkey_id: by.id.clone(),
            encrypted_by_pubkey: Some(by.pubkey().clone()),
            encrypted_by_trust_chain: Some(chain),
        }
    }

    /// A response skeleton with keys and trusted root but no blobs.
    pub fn response_base(&self) -> FetchResponse {
        FetchResponse {
            org_id: "test-org".to_string(),
            encrypted_privkey: Some(self.encrypted_privkey.clone()),
            pubkey: Some(self.keyable.pubkey.clone()),
            signed_trusted_root: Some(self.signed_trusted_root.clone()),
            ..Default::default()
        }
    }

    /// A complete decryptable response with a two-var base env.
    pub fn basic_response(&self) -> FetchResponse {
        let mut response = self.response_base();
        response.env = Some(self.field(
            r#"{"GO_TEST":{"val":"it"},"GO_TEST_2":{"val":"works!"}}"#,
            "envSymmetricKey",
            &self.admin,
            self.admin_chain(&self.admin),
        ));
        response
    }
}

impl Default for TestGraph {
    fn default() -> Self {
        Self::new()
    }
}
