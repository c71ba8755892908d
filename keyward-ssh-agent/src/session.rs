//! SSH agent session and listener.

use std::io;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use keyward_core::KeywardError;
use ssh_agent_lib::agent::{Agent, ListeningSocket, Session, listen};
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Extension, Identity, KeyConstraint, Credential,
    RemoveIdentity, SignRequest,
};
use ssh_encoding::Encode as _;
use ssh_key::{HashAlg, PrivateKey, Signature};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::keyring::IdentityKeyring;
use crate::signer::LocalSigner;

/// Top-level SSH agent.  Cloned per incoming connection by `ssh_agent_lib`.
#[derive(Clone, Debug)]
pub struct KeywardAgent {
    keyring: Arc<IdentityKeyring>,
}

impl KeywardAgent {
    pub fn new(keyring: Arc<IdentityKeyring>) -> Self {
        Self { keyring }
    }

    /// Bind the Unix socket and serve connections until the listener fails.
    ///
    /// `accept` errors never end the loop; the listener sleeps for
    /// `accept_backoff` and tries again.
    pub async fn listen(self, socket_path: &Path, accept_backoff: Duration) -> anyhow::Result<()> {
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("bind SSH agent socket {socket_path:?}"))?;

        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod 0600 {socket_path:?}"))?;

        listen(BackoffListener::new(listener, accept_backoff), self)
            .await
            .context("SSH agent listener")
    }

    async fn add(
        &self,
        identity: AddIdentity,
        lifetime_secs: u32,
        confirm: bool,
    ) -> Result<(), AgentError> {
        let Credential::Key { privkey, comment } = identity.credential else {
            warn!("add_identity: certificate credentials are not supported");
            return Err(agent_err(KeywardError::UnsupportedAlgorithm(
                "certificate identities".into(),
            )));
        };
        let private_key = PrivateKey::new(privkey, comment.clone())
            .map_err(|e| agent_err(KeywardError::InvalidKey(e.to_string())))?;

        debug!(
            fingerprint = %private_key.fingerprint(HashAlg::Sha256),
            comment = %comment,
            "add_identity"
        );
        self.keyring
            .add(
                Arc::new(LocalSigner::new(private_key)),
                comment,
                lifetime_secs,
                confirm,
            )
            .await
            .map_err(agent_err)
    }
}

fn agent_err(e: KeywardError) -> AgentError {
    match e {
        KeywardError::ExtensionUnsupported => AgentError::ExtensionFailure,
        other => AgentError::other(io::Error::other(other)),
    }
}

#[ssh_agent_lib::async_trait]
impl Session for KeywardAgent {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let identities: Vec<Identity> = self
            .keyring
            .list()
            .await
            .map_err(|e| {
                warn!(error = %e, "request_identities failed");
                agent_err(e)
            })?
            .into_iter()
            .map(|id| Identity {
                pubkey: id.key_data,
                comment: id.comment,
            })
            .collect();

        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        debug!(
            fingerprint = %request.pubkey.fingerprint(HashAlg::Sha256),
            data_len = request.data.len(),
            flags = request.flags,
            "sign"
        );
        self.keyring
            .sign(&request.pubkey, &request.data, request.flags)
            .await
            .map_err(|e| {
                warn!(error = %e, "sign request failed");
                agent_err(e)
            })
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        self.add(identity, 0, false).await
    }

    async fn add_identity_constrained(
        &mut self,
        identity: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        let mut lifetime_secs = 0;
        let mut confirm = false;
        for constraint in identity.constraints {
            match constraint {
                KeyConstraint::Lifetime(secs) => lifetime_secs = secs,
                KeyConstraint::Confirm => confirm = true,
                _ => {
                    warn!("add_identity_constrained: unsupported constraint extension");
                    return Err(AgentError::Failure);
                }
            }
        }
        self.add(identity.identity, lifetime_secs, confirm).await
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        self.keyring
            .remove(&identity.pubkey)
            .await
            .map_err(agent_err)
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        self.keyring.remove_all().await.map_err(agent_err)
    }

    async fn lock(&mut self, key: String) -> Result<(), AgentError> {
        let key = Zeroizing::new(key);
        self.keyring.lock(key.as_bytes()).await.map_err(agent_err)
    }

    async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
        let key = Zeroizing::new(key);
        self.keyring.unlock(key.as_bytes()).await.map_err(agent_err)
    }

    async fn extension(&mut self, extension: Extension) -> Result<Option<Extension>, AgentError> {
        let mut contents = Vec::new();
        extension
            .details
            .encode(&mut contents)
            .map_err(|e| agent_err(anyhow::anyhow!("extension contents: {e}").into()))?;
        self.keyring
            .extension(&extension.name, &contents)
            .await
            .map(|_| None)
            .map_err(agent_err)
    }
}

impl Agent<BackoffListener> for KeywardAgent {
    fn new_session(&mut self, _socket: &UnixStream) -> impl Session {
        self.clone()
    }
}

/// Unix listener whose `accept` never fails: errors are logged and retried
/// after a fixed delay.
#[derive(Debug)]
pub struct BackoffListener {
    listener: UnixListener,
    backoff: Duration,
}

impl BackoffListener {
    pub fn new(listener: UnixListener, backoff: Duration) -> Self {
        Self { listener, backoff }
    }
}

#[ssh_agent_lib::async_trait]
impl ListeningSocket for BackoffListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("SSH agent client connected");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "SSH agent accept failed, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ssh_agent_lib::proto::Unparsed;

    use super::*;
    use crate::testutil::ed25519_private_key;

    fn agent() -> KeywardAgent {
        KeywardAgent::new(Arc::new(IdentityKeyring::new()))
    }

    fn add_request(seed: u8) -> AddIdentity {
        let key = ed25519_private_key(seed);
        AddIdentity {
            credential: Credential::Key {
                privkey: key.key_data().clone(),
                comment: format!("added-{seed}"),
            },
        }
    }

    #[tokio::test]
    async fn added_identity_is_listed_and_signs() {
        let mut agent = agent();
        agent.add_identity(add_request(1)).await.unwrap();

        let ids = agent.request_identities().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].comment, "added-1");

        let sig = agent
            .sign(SignRequest {
                pubkey: ids[0].pubkey.clone(),
                data: b"challenge".to_vec(),
                flags: 0,
            })
            .await
            .unwrap();
        assert_eq!(sig.algorithm(), ssh_key::Algorithm::Ed25519);

        agent
            .remove_identity(RemoveIdentity {
                pubkey: ids[0].pubkey.clone(),
            })
            .await
            .unwrap();
        assert!(agent.request_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn constrained_add_applies_lifetime() {
        let mut agent = agent();
        agent
            .add_identity_constrained(AddIdentityConstrained {
                identity: add_request(2),
                constraints: vec![KeyConstraint::Lifetime(60), KeyConstraint::Confirm],
            })
            .await
            .unwrap();
        assert_eq!(agent.request_identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lock_and_unlock_over_session() {
        let mut agent = agent();
        agent.add_identity(add_request(3)).await.unwrap();
        agent.lock("secret".to_string()).await.unwrap();
        assert!(agent.request_identities().await.unwrap().is_empty());
        assert!(agent.unlock("nope".to_string()).await.is_err());
        agent.unlock("secret".to_string()).await.unwrap();
        assert_eq!(agent.request_identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn errors_map_to_agent_failures() {
        let mut agent = agent();
        assert!(agent.unlock("x".to_string()).await.is_err());
        assert!(matches!(
            agent_err(KeywardError::ExtensionUnsupported),
            AgentError::ExtensionFailure
        ));
    }

    #[tokio::test]
    async fn extension_requests_are_refused() {
        let mut agent = agent();
        let reply = agent
            .extension(Extension {
                name: "session-bind@openssh.com".to_string(),
                details: Unparsed::from(vec![0, 0, 0, 1, b'k']),
            })
            .await;
        assert!(matches!(reply, Err(AgentError::ExtensionFailure)));
    }
}
