//! Signing capabilities behind each agent identity.
//!
//! The keyring treats every identity through [`IdentitySigner`]:
//!
//! - [`DelegatedSigner`]: the private key lives on the custody daemon.  Data
//!   is hashed locally, the digest is signed remotely, and the returned
//!   `(R, S)` pair is re-encoded as an SSH signature and **verified** against
//!   the bound public key before it leaves this module.
//! - [`LocalSigner`]: a private key handed to the agent by `ssh-add`.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use keyward_core::store::SecretRecord;
use keyward_core::vault::RemoteVaultClient;
use keyward_core::{KeywardError, Result};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use signature::Signer as _;
use ssh_key::{Algorithm, EcdsaCurve, HashAlg, PrivateKey, PublicKey, Signature};
use tracing::{debug, warn};

/// `SSH_AGENT_RSA_SHA2_256` sign request flag.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
/// `SSH_AGENT_RSA_SHA2_512` sign request flag.
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

/// Signature algorithm selected by the flags of a sign request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// Whatever the key type signs with natively.
    Default,
    RsaSha256,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn from_flags(flags: u32) -> Result<Self> {
        match flags {
            0 => Ok(Self::Default),
            SSH_AGENT_RSA_SHA2_256 => Ok(Self::RsaSha256),
            SSH_AGENT_RSA_SHA2_512 => Ok(Self::RsaSha512),
            other => Err(KeywardError::UnsupportedAlgorithm(format!(
                "unknown signature flags {other:#x}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::RsaSha256 => "rsa-sha2-256",
            Self::RsaSha512 => "rsa-sha2-512",
        }
    }
}

/// What the keyring needs from an identity: its public key and a way to sign.
#[async_trait]
pub trait IdentitySigner: Send + Sync + std::fmt::Debug {
    fn public_key(&self) -> &PublicKey;

    fn supports(&self, algorithm: SignatureAlgorithm) -> bool {
        algorithm == SignatureAlgorithm::Default
    }

    async fn sign(&self, data: &[u8], algorithm: SignatureAlgorithm) -> Result<Signature>;
}

/// The algebraic components of an ECDSA signature as returned by the custody
/// daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureValue {
    pub r: BigUint,
    pub s: BigUint,
}

impl SignatureValue {
    /// Parse `"<b64 R> <b64 S>"`, where each side decodes to a decimal integer.
    pub fn parse(reply: &str) -> Result<Self> {
        let mut parts = reply.split_whitespace();
        let (Some(r), Some(s), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(KeywardError::MalformedSignature(
                "expected exactly two signature components".into(),
            ));
        };
        Ok(Self {
            r: decode_component(r, "R")?,
            s: decode_component(s, "S")?,
        })
    }

    /// Encode as an `ecdsa-sha2-nistp256` SSH signature.
    pub fn to_ssh_p256(&self) -> Result<Signature> {
        let r = p256::FieldBytes::clone_from_slice(&scalar_bytes(&self.r, "R")?);
        let s = p256::FieldBytes::clone_from_slice(&scalar_bytes(&self.s, "S")?);
        let sig = p256::ecdsa::Signature::from_scalars(r, s)
            .map_err(|e| KeywardError::MalformedSignature(format!("invalid P-256 scalars: {e}")))?;
        Signature::try_from(sig)
            .map_err(|e| KeywardError::MalformedSignature(format!("SSH signature encoding: {e}")))
    }
}

fn decode_component(b64: &str, label: &str) -> Result<BigUint> {
    let digits = B64
        .decode(b64)
        .map_err(|e| KeywardError::MalformedSignature(format!("{label} is not base64: {e}")))?;
    BigUint::parse_bytes(&digits, 10).ok_or_else(|| {
        KeywardError::MalformedSignature(format!("{label} is not a decimal integer"))
    })
}

/// Big-endian, left-padded to the 32-byte P-256 scalar width.
fn scalar_bytes(n: &BigUint, label: &str) -> Result<[u8; 32]> {
    let bytes = n.to_bytes_be();
    if bytes.len() > 32 {
        return Err(KeywardError::MalformedSignature(format!(
            "{label} does not fit a P-256 scalar"
        )));
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

const DELEGATED_ALGORITHM: Algorithm = Algorithm::Ecdsa {
    curve: EcdsaCurve::NistP256,
};

/// Signs with a key held by the custody daemon.
#[derive(Debug)]
pub struct DelegatedSigner {
    public_key: PublicKey,
    secret_name: String,
    client: RemoteVaultClient,
}

impl DelegatedSigner {
    /// Bind `public_key` to the daemon secret `secret_name`.
    ///
    /// Only ECDSA NIST P-256 keys can be delegated; the daemon signs nothing
    /// else.
    pub fn new(
        public_key: PublicKey,
        secret_name: impl Into<String>,
        client: RemoteVaultClient,
    ) -> Result<Self> {
        if public_key.algorithm() != DELEGATED_ALGORITHM {
            return Err(KeywardError::UnsupportedAlgorithm(format!(
                "{} keys cannot be delegated to the custody daemon",
                public_key.algorithm().as_str()
            )));
        }
        Ok(Self {
            public_key,
            secret_name: secret_name.into(),
            client,
        })
    }

    /// Build a signer from a stored record whose public data is an
    /// `authorized_keys` line.
    pub fn from_record(record: &SecretRecord, client: RemoteVaultClient) -> Result<Self> {
        let line = record.public_data_str()?;
        let public_key = PublicKey::from_openssh(line.trim())
            .map_err(|e| KeywardError::InvalidKey(format!("secret '{}': {e}", record.name)))?;
        Self::new(public_key, record.name.clone(), client)
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }
}

#[async_trait]
impl IdentitySigner for DelegatedSigner {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    async fn sign(&self, data: &[u8], algorithm: SignatureAlgorithm) -> Result<Signature> {
        if algorithm != SignatureAlgorithm::Default {
            return Err(KeywardError::UnsupportedAlgorithm(format!(
                "{} for a delegated {} key",
                algorithm.as_str(),
                DELEGATED_ALGORITHM.as_str()
            )));
        }

        let digest = B64.encode(Sha256::digest(data));
        debug!(secret = %self.secret_name, data_len = data.len(), "delegating signature");
        let reply = self.client.sign_ecdsa(&self.secret_name, &digest).await?;

        let signature = SignatureValue::parse(&reply)?.to_ssh_p256()?;

        if let Err(e) = signature::Verifier::verify(&self.public_key, data, &signature) {
            warn!(
                secret = %self.secret_name,
                fingerprint = %self.public_key.fingerprint(HashAlg::Sha256),
                "custody daemon returned a signature that does not verify"
            );
            return Err(KeywardError::SignatureVerificationFailed(format!(
                "secret '{}': {e}",
                self.secret_name
            )));
        }

        Ok(signature)
    }
}

/// Signs with a private key held in agent memory.
pub struct LocalSigner {
    private_key: PrivateKey,
}

impl LocalSigner {
    pub fn new(private_key: PrivateKey) -> Self {
        Self { private_key }
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("fingerprint", &self.private_key.fingerprint(HashAlg::Sha256).to_string())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentitySigner for LocalSigner {
    fn public_key(&self) -> &PublicKey {
        self.private_key.public_key()
    }

    async fn sign(&self, data: &[u8], algorithm: SignatureAlgorithm) -> Result<Signature> {
        if algorithm != SignatureAlgorithm::Default {
            return Err(KeywardError::UnsupportedAlgorithm(format!(
                "{} for a local {} key",
                algorithm.as_str(),
                self.private_key.algorithm().as_str()
            )));
        }
        self.private_key
            .try_sign(data)
            .map_err(|e| anyhow::anyhow!("local signing failed: {e}").into())
    }
}

/// Shared handle stored by the keyring.
pub type SharedSigner = Arc<dyn IdentitySigner>;

#[cfg(test)]
mod tests {
    use signature::Verifier;

    use super::*;
    use crate::testutil::{CustodyMock, Misbehaviour, ed25519_private_key, p256_public_key};

    fn delegated(mock: &Arc<CustodyMock>, name: &str) -> DelegatedSigner {
        DelegatedSigner::new(mock.public_key(name), name, mock.client()).unwrap()
    }

    #[test]
    fn flags_map_to_algorithms() {
        assert_eq!(SignatureAlgorithm::from_flags(0).unwrap(), SignatureAlgorithm::Default);
        assert_eq!(SignatureAlgorithm::from_flags(2).unwrap(), SignatureAlgorithm::RsaSha256);
        assert_eq!(SignatureAlgorithm::from_flags(4).unwrap(), SignatureAlgorithm::RsaSha512);
        assert!(matches!(
            SignatureAlgorithm::from_flags(8),
            Err(KeywardError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            SignatureAlgorithm::from_flags(6),
            Err(KeywardError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn parses_signature_components() {
        let reply = format!("{} {}\n", B64.encode("12345"), B64.encode("67890"));
        let value = SignatureValue::parse(&reply).unwrap();
        assert_eq!(value.r, BigUint::from(12345u32));
        assert_eq!(value.s, BigUint::from(67890u32));
    }

    #[test]
    fn rejects_malformed_components() {
        let one = B64.encode("1");
        for reply in [
            String::new(),
            one.clone(),
            format!("{one} {one} {one}"),
            format!("{one} !!!"),
            format!("{one} {}", B64.encode("12ab")),
            format!("{one} {}", B64.encode("-5")),
        ] {
            assert!(
                matches!(
                    SignatureValue::parse(&reply),
                    Err(KeywardError::MalformedSignature(_))
                ),
                "reply {reply:?} should be malformed"
            );
        }
    }

    #[test]
    fn out_of_range_scalars_are_malformed() {
        let too_big = SignatureValue {
            r: BigUint::from(1u8) << 300,
            s: BigUint::from(1u8),
        };
        assert!(matches!(
            too_big.to_ssh_p256(),
            Err(KeywardError::MalformedSignature(_))
        ));
        let zero = SignatureValue {
            r: BigUint::from(0u8),
            s: BigUint::from(1u8),
        };
        assert!(matches!(
            zero.to_ssh_p256(),
            Err(KeywardError::MalformedSignature(_))
        ));
    }

    #[test]
    fn only_p256_keys_can_be_delegated() {
        let mock = CustodyMock::new();
        let ed25519 = ed25519_private_key(9).public_key().clone();
        assert!(matches!(
            DelegatedSigner::new(ed25519, "ed", mock.client()),
            Err(KeywardError::UnsupportedAlgorithm(_))
        ));
        assert!(DelegatedSigner::new(p256_public_key(3, "ok"), "ok", mock.client()).is_ok());
    }

    #[test]
    fn builds_from_stored_record() {
        let mock = CustodyMock::new();
        let line = p256_public_key(5, "deploy").to_openssh().unwrap();
        let record = SecretRecord::new("deploy", format!("{line}\n"));
        let signer = DelegatedSigner::from_record(&record, mock.client()).unwrap();
        assert_eq!(signer.secret_name(), "deploy");

        let garbage = SecretRecord::new("junk", b"not a key".to_vec());
        assert!(matches!(
            DelegatedSigner::from_record(&garbage, mock.client()),
            Err(KeywardError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn delegated_signature_verifies() {
        let mock = CustodyMock::new();
        mock.add_key("deploy", 11);
        let signer = delegated(&mock, "deploy");

        let sig = signer.sign(b"session data", SignatureAlgorithm::Default).await.unwrap();
        assert_eq!(sig.algorithm(), DELEGATED_ALGORITHM);
        Verifier::verify(signer.public_key(), b"session data", &sig).unwrap();
        assert_eq!(mock.sign_calls(), 1);
    }

    #[tokio::test]
    async fn signature_from_wrong_key_is_rejected() {
        let mock = CustodyMock::new();
        mock.add_key("deploy", 11);
        mock.misbehave(Misbehaviour::WrongKey);
        let signer = delegated(&mock, "deploy");

        let err = signer.sign(b"session data", SignatureAlgorithm::Default).await.unwrap_err();
        assert!(matches!(err, KeywardError::SignatureVerificationFailed(_)));
    }

    #[tokio::test]
    async fn signature_over_other_data_is_rejected() {
        let mock = CustodyMock::new();
        mock.add_key("deploy", 11);
        mock.misbehave(Misbehaviour::WrongDigest);
        let signer = delegated(&mock, "deploy");

        let err = signer.sign(b"session data", SignatureAlgorithm::Default).await.unwrap_err();
        assert!(matches!(err, KeywardError::SignatureVerificationFailed(_)));
    }

    #[tokio::test]
    async fn garbage_reply_is_malformed() {
        let mock = CustodyMock::new();
        mock.add_key("deploy", 11);
        mock.misbehave(Misbehaviour::Garbage);
        let signer = delegated(&mock, "deploy");

        let err = signer.sign(b"x", SignatureAlgorithm::Default).await.unwrap_err();
        assert!(matches!(err, KeywardError::MalformedSignature(_)));
    }

    #[tokio::test]
    async fn daemon_errors_propagate() {
        let mock = CustodyMock::new();
        let signer = DelegatedSigner::new(p256_public_key(4, "gone"), "gone", mock.client()).unwrap();

        let err = signer.sign(b"x", SignatureAlgorithm::Default).await.unwrap_err();
        assert!(matches!(err, KeywardError::Vault(_)));
    }

    #[tokio::test]
    async fn delegated_signer_refuses_rsa_algorithms() {
        let mock = CustodyMock::new();
        mock.add_key("deploy", 11);
        let signer = delegated(&mock, "deploy");

        assert!(!signer.supports(SignatureAlgorithm::RsaSha256));
        let err = signer.sign(b"x", SignatureAlgorithm::RsaSha512).await.unwrap_err();
        assert!(matches!(err, KeywardError::UnsupportedAlgorithm(_)));
        assert_eq!(mock.sign_calls(), 0);
    }

    #[tokio::test]
    async fn local_signer_signs_in_memory() {
        let signer = LocalSigner::new(ed25519_private_key(1));
        let sig = signer.sign(b"hello", SignatureAlgorithm::Default).await.unwrap();
        Verifier::verify(signer.public_key(), b"hello", &sig).unwrap();
        assert!(format!("{signer:?}").contains("SHA256:"));
    }
}
