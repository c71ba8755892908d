//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use keyward_core::Result;
use keyward_core::vault::{RemoteCommand, RemoteResult, RemoteVaultClient, VaultTransport};
use num_bigint::BigUint;
use p256::ecdsa::SigningKey;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use sha2::{Digest, Sha256};
use ssh_key::private::{Ed25519Keypair, KeypairData};
use ssh_key::public::{EcdsaPublicKey, KeyData};
use ssh_key::{PrivateKey, PublicKey};

pub(crate) fn p256_signing_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

pub(crate) fn p256_public_key(seed: u8, comment: &str) -> PublicKey {
    let verifying = *p256_signing_key(seed).verifying_key();
    PublicKey::new(KeyData::Ecdsa(EcdsaPublicKey::from(verifying)), comment)
}

pub(crate) fn ed25519_private_key(seed: u8) -> PrivateKey {
    let keypair = Ed25519Keypair::from_seed(&[seed; 32]);
    PrivateKey::new(KeypairData::Ed25519(keypair), format!("local-{seed}")).unwrap()
}

/// Encode a P-256 signature the way the custody daemon does:
/// `b64(decimal R) b64(decimal S)`.
pub(crate) fn custody_reply(signature: &p256::ecdsa::Signature) -> String {
    let (r, s) = signature.split_bytes();
    let decimal = |bytes: &[u8]| B64.encode(BigUint::from_bytes_be(bytes).to_str_radix(10));
    format!("{} {}", decimal(&r), decimal(&s))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Misbehaviour {
    /// Sign with a key other than the one the secret names.
    WrongKey,
    /// Sign a digest other than the one requested.
    WrongDigest,
    /// Reply with text that is not a signature.
    Garbage,
}

/// In-process stand-in for the custody daemon.  Secrets are P-256 keys
/// derived from a one-byte seed.
#[derive(Debug, Default)]
pub(crate) struct CustodyMock {
    seeds: Mutex<HashMap<String, u8>>,
    misbehaviour: Mutex<Option<Misbehaviour>>,
    sign_calls: AtomicUsize,
}

impl CustodyMock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn client(self: &Arc<Self>) -> RemoteVaultClient {
        RemoteVaultClient::new(Arc::clone(self) as Arc<dyn VaultTransport>)
    }

    pub(crate) fn add_key(&self, name: &str, seed: u8) {
        self.seeds.lock().unwrap().insert(name.to_string(), seed);
    }

    pub(crate) fn public_key(&self, name: &str) -> PublicKey {
        let seed = self.seeds.lock().unwrap()[name];
        p256_public_key(seed, name)
    }

    pub(crate) fn misbehave(&self, how: Misbehaviour) {
        *self.misbehaviour.lock().unwrap() = Some(how);
    }

    pub(crate) fn sign_calls(&self) -> usize {
        self.sign_calls.load(Ordering::SeqCst)
    }

    fn seed(&self, name: &str) -> Option<u8> {
        self.seeds.lock().unwrap().get(name).copied()
    }

    fn sign(&self, name: &str, digest_b64: &str) -> RemoteResult {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        let Some(seed) = self.seed(name) else {
            return RemoteResult::err(format!("secret {name} not found"));
        };
        let mut digest = B64.decode(digest_b64).unwrap();
        let mut key = p256_signing_key(seed);
        match *self.misbehaviour.lock().unwrap() {
            Some(Misbehaviour::Garbage) => return RemoteResult::ok("definitely not a signature"),
            Some(Misbehaviour::WrongKey) => key = p256_signing_key(seed ^ 0x55),
            Some(Misbehaviour::WrongDigest) => digest = Sha256::digest(b"other data").to_vec(),
            None => {}
        }
        let signature: p256::ecdsa::Signature = key.sign_prehash(&digest).unwrap();
        RemoteResult::ok(custody_reply(&signature))
    }

    fn public_data(&self, name: &str) -> RemoteResult {
        let Some(seed) = self.seed(name) else {
            return RemoteResult::err(format!("secret {name} not found"));
        };
        let line = p256_public_key(seed, name).to_openssh().unwrap();
        let json = serde_json::json!({
            "Name": name,
            "PublicData": B64.encode(format!("{line}\n")),
            "Type": "ecdsa-p256",
        });
        RemoteResult::ok(B64.encode(json.to_string()))
    }
}

#[async_trait]
impl VaultTransport for CustodyMock {
    async fn call(&self, command: &RemoteCommand) -> Result<RemoteResult> {
        let args = command.args();
        Ok(match command.name() {
            "sign-ecdsa" => self.sign(&args[0], &args[1]),
            "ssh-public-data" => self.public_data(&args[0]),
            other => RemoteResult::err(format!("unexpected command {other}")),
        })
    }
}
