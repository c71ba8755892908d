//! SSH agent for keyward.
//!
//! Serves the OpenSSH agent protocol for keys whose private halves never
//! leave a custody daemon.  Sign requests are hashed locally, signed by the
//! daemon, and verified against the stored public key before being returned.
//!
//! # Architecture
//!
//! ```text
//! keywardd ──► AgentService ──► IdentityKeyring ◄── KeywardAgent (per connection)
//!                  │                   │
//!             SecretStore        DelegatedSigner ──► RemoteVaultClient ──► custody daemon
//! ```
//!
//! Keys added over the protocol with `ssh-add` are held in memory by a
//! [`LocalSigner`] and are never persisted.

pub mod keyring;
pub mod service;
pub mod session;
pub mod signer;

#[cfg(test)]
pub(crate) mod testutil;

pub use keyring::{IdentityKeyring, PublicIdentity};
pub use service::{AgentService, ServiceState};
pub use session::KeywardAgent;
pub use signer::{DelegatedSigner, IdentitySigner, LocalSigner, SignatureAlgorithm};
