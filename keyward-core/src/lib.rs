//! Shared building blocks for keyward.
//!
//! - [`KeywardError`]: the error taxonomy used across the agent.
//! - [`config`]: TOML configuration with XDG defaults.
//! - [`store`]: the file-backed [`SecretStore`](store::SecretStore) of
//!   public key material for remotely custodied keys.
//! - [`vault`]: the [`RemoteVaultClient`](vault::RemoteVaultClient) that
//!   talks to the custody daemon.

pub mod config;
pub mod store;
pub mod vault;

#[derive(thiserror::Error, Debug)]
pub enum KeywardError {
    #[error("agent locked")]
    Locked,
    #[error("agent not locked")]
    NotLocked,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("incorrect passphrase")]
    IncorrectPassphrase,
    /// The identity cannot produce the algorithm the request flags ask for.
    #[error("signer does not support the requested signature algorithm (flags {0:#x})")]
    UnsupportedFlags(u32),
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("agent extensions are not supported")]
    ExtensionUnsupported,
    #[error("malformed signature from custody daemon: {0}")]
    MalformedSignature(String),
    /// Never downgraded: the custody daemon is trusted to hold the key, not
    /// to return correct signatures.
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),
    #[error("custody daemon unavailable: {0}")]
    RemoteUnavailable(String),
    /// The custody daemon answered, but reported an operation error.
    #[error("custody daemon error: {0}")]
    Vault(String),
    #[error("custody daemon did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("secret store: {0}")]
    PersistenceFailure(String),
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = KeywardError> = std::result::Result<T, E>;
