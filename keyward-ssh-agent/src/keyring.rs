//! In-memory identity keyring.
//!
//! The [`IdentityKeyring`] holds every identity the agent currently offers,
//! keyed by public key blob.  Each identity carries a [`SharedSigner`]: either
//! a [`DelegatedSigner`](crate::signer::DelegatedSigner) for keys held by the
//! custody daemon, or a [`LocalSigner`](crate::signer::LocalSigner) for keys
//! added with `ssh-add`.
//!
//! All state sits behind a single async mutex.  A sign request holds it for
//! the whole custody daemon round-trip, so signing is serialized across
//! connections.
//!
//! Expiry is lazy: identities added with a lifetime are swept at the start of
//! every operation that reads or mutates the identity set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyward_core::{KeywardError, Result};
use ssh_key::public::KeyData;
use ssh_key::{HashAlg, PublicKey, Signature};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::signer::{SharedSigner, SignatureAlgorithm};

/// An identity as advertised to SSH clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    pub key_data: KeyData,
    pub comment: String,
}

impl PublicIdentity {
    /// Key type name, e.g. `ecdsa-sha2-nistp256`.
    pub fn format(&self) -> String {
        self.key_data.algorithm().as_str().to_string()
    }

    /// SSH wire encoding of the public key.
    pub fn blob(&self) -> Result<Vec<u8>> {
        PublicKey::from(self.key_data.clone())
            .to_bytes()
            .map_err(|e| KeywardError::InvalidKey(e.to_string()))
    }
}

/// An identity found by an [`IdentitySource`].
#[derive(Debug)]
pub struct DiscoveredIdentity {
    pub signer: SharedSigner,
    pub comment: String,
}

/// Backing supply of identities, consulted whenever the keyring is listed
/// while unlocked.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn discover(&self) -> Result<Vec<DiscoveredIdentity>>;
}

struct Identity {
    signer: SharedSigner,
    comment: String,
    expires_at: Option<Instant>,
    confirm: bool,
}

/// Lock state.  A passphrase is held exactly while the keyring is locked.
#[derive(Default)]
struct Gate {
    passphrase: Option<Zeroizing<Vec<u8>>>,
}

impl Gate {
    fn is_locked(&self) -> bool {
        self.passphrase.is_some()
    }
}

#[derive(Default)]
struct KeyringState {
    identities: HashMap<KeyData, Identity>,
    gate: Gate,
}

impl KeyringState {
    fn ensure_unlocked(&self) -> Result<()> {
        if self.gate.is_locked() {
            return Err(KeywardError::Locked);
        }
        Ok(())
    }

    fn sweep_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<KeyData> = self
            .identities
            .iter()
            .filter(|(_, id)| id.expires_at.is_some_and(|at| now >= at))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(id) = self.identities.remove(&key) {
                info!(
                    fingerprint = %key.fingerprint(HashAlg::Sha256),
                    comment = %id.comment,
                    "identity lifetime expired"
                );
            }
        }
    }
}

pub struct IdentityKeyring {
    state: Mutex<KeyringState>,
    source: Option<Arc<dyn IdentitySource>>,
}

impl std::fmt::Debug for IdentityKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyring")
            .field("has_source", &self.source.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for IdentityKeyring {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityKeyring {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KeyringState::default()),
            source: None,
        }
    }

    /// A keyring that merges identities from `source` on every unlocked list.
    pub fn with_source(source: Arc<dyn IdentitySource>) -> Self {
        Self {
            state: Mutex::new(KeyringState::default()),
            source: Some(source),
        }
    }

    /// Identities currently offered.  A locked keyring offers none.
    ///
    /// Identities found by the source that are not yet present are added
    /// without expiry; entries already present keep their constraints.
    pub async fn list(&self) -> Result<Vec<PublicIdentity>> {
        let mut state = self.state.lock().await;
        if state.gate.is_locked() {
            return Ok(Vec::new());
        }

        if let Some(source) = &self.source {
            for found in source.discover().await? {
                let key = found.signer.public_key().key_data().clone();
                state.identities.entry(key).or_insert_with(|| {
                    debug!(comment = %found.comment, "keyring: adding discovered identity");
                    Identity {
                        signer: found.signer,
                        comment: found.comment,
                        expires_at: None,
                        confirm: false,
                    }
                });
            }
        }

        state.sweep_expired();
        Ok(state
            .identities
            .iter()
            .map(|(key, id)| PublicIdentity {
                key_data: key.clone(),
                comment: id.comment.clone(),
            })
            .collect())
    }

    /// Add or replace the identity for `signer`'s public key.
    ///
    /// `lifetime_secs == 0` means no expiry.
    pub async fn add(
        &self,
        signer: SharedSigner,
        comment: impl Into<String>,
        lifetime_secs: u32,
        confirm: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_unlocked()?;
        state.sweep_expired();

        let key = signer.public_key().key_data().clone();
        let comment = comment.into();
        let expires_at = (lifetime_secs > 0)
            .then(|| Instant::now() + Duration::from_secs(u64::from(lifetime_secs)));
        debug!(
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            comment = %comment,
            lifetime_secs,
            confirm,
            "keyring: adding identity"
        );
        state.identities.insert(
            key,
            Identity {
                signer,
                comment,
                expires_at,
                confirm,
            },
        );
        Ok(())
    }

    pub async fn remove(&self, key: &KeyData) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_unlocked()?;
        state.sweep_expired();
        match state.identities.remove(key) {
            Some(id) => {
                debug!(comment = %id.comment, "keyring: removed identity");
                Ok(())
            }
            None => Err(not_found(key)),
        }
    }

    pub async fn remove_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_unlocked()?;
        let removed = state.identities.len();
        state.identities.clear();
        debug!(removed, "keyring: removed all identities");
        Ok(())
    }

    pub async fn lock(&self, passphrase: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_unlocked()?;
        state.gate.passphrase = Some(Zeroizing::new(passphrase.to_vec()));
        info!("keyring locked");
        Ok(())
    }

    pub async fn unlock(&self, passphrase: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(expected) = &state.gate.passphrase else {
            return Err(KeywardError::NotLocked);
        };
        if !bool::from(expected.as_slice().ct_eq(passphrase)) {
            warn!("keyring unlock attempt with incorrect passphrase");
            return Err(KeywardError::IncorrectPassphrase);
        }
        state.gate.passphrase = None;
        info!("keyring unlocked");
        Ok(())
    }

    /// Sign `data` with the identity for `key`.
    ///
    /// `flags` selects the signature algorithm (`SSH_AGENT_RSA_SHA2_*`).
    /// Unknown flag values fail with `UnsupportedAlgorithm`; known values the
    /// identity cannot honour fail with `UnsupportedFlags`.
    pub async fn sign(&self, key: &KeyData, data: &[u8], flags: u32) -> Result<Signature> {
        let mut state = self.state.lock().await;
        state.ensure_unlocked()?;
        state.sweep_expired();

        let identity = state.identities.get(key).ok_or_else(|| not_found(key))?;
        let algorithm = SignatureAlgorithm::from_flags(flags)?;
        if !identity.signer.supports(algorithm) {
            return Err(KeywardError::UnsupportedFlags(flags));
        }
        if identity.confirm {
            // No prompt integration; confirmation is only recorded.
            warn!(comment = %identity.comment, "signing with a confirm-constrained identity without confirmation");
        }
        debug!(
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            comment = %identity.comment,
            algorithm = algorithm.as_str(),
            "keyring: signing"
        );
        identity.signer.sign(data, algorithm).await
    }

    /// Vendor extensions are not implemented.
    pub async fn extension(&self, name: &str, contents: &[u8]) -> Result<Vec<u8>> {
        debug!(
            extension = name,
            contents_len = contents.len(),
            "keyring: rejecting extension request"
        );
        Err(KeywardError::ExtensionUnsupported)
    }

    pub async fn is_locked(&self) -> bool {
        self.state.lock().await.gate.is_locked()
    }

    /// Number of identities held, expired or not, regardless of lock state.
    pub async fn len(&self) -> usize {
        self.state.lock().await.identities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn not_found(key: &KeyData) -> KeywardError {
    KeywardError::NotFound(format!(
        "no identity for key {}",
        key.fingerprint(HashAlg::Sha256)
    ))
}
