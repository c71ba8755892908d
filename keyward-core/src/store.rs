//! File-backed store of imported key metadata.
//!
//! The agent never sees private keys, but it must remember which custody
//! daemon secrets it serves and what their public keys are.  That mapping
//! lives in a single JSON document:
//!
//! ```json
//! {"Secrets": {"deploy-key": {"PublicData": "ZWNkc2Etc2hhMi1uaXN0cDI1NiBBQUFB..."}}}
//! ```
//!
//! Every mutation rewrites the whole file (write-then-rename, mode `0600`).
//! There is no incremental format and no locking across processes; callers
//! that share the file with other writers use [`SecretStore::reload`] to pick
//! up external changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{KeywardError, Result};

/// Public metadata for one remotely custodied key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    /// Name of the secret on the custody daemon.
    pub name: String,
    /// OpenSSH `authorized_keys` line for the key.
    pub public_data: Vec<u8>,
}

impl SecretRecord {
    pub fn new(name: impl Into<String>, public_data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            public_data: public_data.into(),
        }
    }

    /// Decode the payload returned by the daemon's `ssh-public-data` command:
    /// base64 of a JSON object carrying `Name` and base64 `PublicData`.
    /// Any other fields the daemon includes are ignored.
    pub fn from_public_data_payload(payload: &str) -> Result<Self> {
        let json = B64
            .decode(payload.trim())
            .map_err(|e| KeywardError::InvalidKey(format!("public data payload is not base64: {e}")))?;
        let wire: PublicDataPayload = serde_json::from_slice(&json)
            .map_err(|e| KeywardError::InvalidKey(format!("public data payload: {e}")))?;
        let public_data = B64
            .decode(&wire.public_data)
            .map_err(|e| KeywardError::InvalidKey(format!("PublicData is not base64: {e}")))?;
        Ok(Self {
            name: wire.name,
            public_data,
        })
    }

    /// The public data as text, for display and key parsing.
    pub fn public_data_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.public_data).map_err(|e| {
            KeywardError::InvalidKey(format!("public data for '{}' is not UTF-8: {e}", self.name))
        })
    }
}

#[derive(Deserialize)]
struct PublicDataPayload {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "PublicData")]
    public_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StoreData {
    #[serde(rename = "Secrets", default)]
    secrets: BTreeMap<String, StoredSecret>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredSecret {
    #[serde(rename = "PublicData")]
    public_data: String,
}

#[derive(Debug)]
pub struct SecretStore {
    path: PathBuf,
    data: StoreData,
}

impl SecretStore {
    /// Open the store at `path`.
    ///
    /// A missing file is not an error: an empty store is created and written
    /// out immediately, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            let store = Self {
                path,
                data: StoreData::default(),
            };
            if let Some(parent) = store.path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|e| {
                    KeywardError::PersistenceFailure(format!(
                        "create directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
            store.dump()?;
            info!(path = %store.path.display(), "created empty secret store");
            return Ok(store);
        }

        let data = read_data(&path)?;
        debug!(path = %path.display(), secrets = data.secrets.len(), "opened secret store");
        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory state with the current file contents.
    pub fn reload(&mut self) -> Result<()> {
        self.data = read_data(&self.path)?;
        Ok(())
    }

    pub fn get_secrets(&self) -> Result<Vec<SecretRecord>> {
        self.data
            .secrets
            .iter()
            .map(|(name, stored)| decode_secret(name, stored))
            .collect()
    }

    pub fn get_secret(&self, name: &str) -> Result<SecretRecord> {
        let stored = self
            .data
            .secrets
            .get(name)
            .ok_or_else(|| KeywardError::NotFound(format!("no secret named '{name}'")))?;
        decode_secret(name, stored)
    }

    pub fn secret_exists(&self, name: &str) -> bool {
        self.data.secrets.contains_key(name)
    }

    /// Add `record` and persist.  An existing name is rejected without
    /// touching memory or disk.
    pub fn store_secret(&mut self, record: &SecretRecord) -> Result<()> {
        if self.secret_exists(&record.name) {
            return Err(KeywardError::AlreadyExists(format!(
                "secret '{}' already exists, choose a different name",
                record.name
            )));
        }
        self.data.secrets.insert(
            record.name.clone(),
            StoredSecret {
                public_data: B64.encode(&record.public_data),
            },
        );
        if let Err(e) = self.dump() {
            self.data.secrets.remove(&record.name);
            return Err(e);
        }
        debug!(name = %record.name, "stored secret");
        Ok(())
    }

    pub fn remove_secret(&mut self, name: &str) -> Result<()> {
        let Some(previous) = self.data.secrets.remove(name) else {
            return Err(KeywardError::NotFound(format!("no secret named '{name}'")));
        };
        if let Err(e) = self.dump() {
            self.data.secrets.insert(name.to_string(), previous);
            return Err(e);
        }
        debug!(name, "removed secret");
        Ok(())
    }

    /// Serialise the whole record set and replace the backing file.
    pub fn dump(&self) -> Result<()> {
        let json = serde_json::to_vec(&self.data)
            .map_err(|e| KeywardError::PersistenceFailure(format!("serialise store: {e}")))?;
        write_private_file(&self.path, &json).map_err(|e| {
            KeywardError::PersistenceFailure(format!("write {}: {e}", self.path.display()))
        })
    }

    pub fn len(&self) -> usize {
        self.data.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.secrets.is_empty()
    }
}

fn read_data(path: &Path) -> Result<StoreData> {
    let bytes = std::fs::read(path).map_err(|e| {
        KeywardError::PersistenceFailure(format!("read {}: {e}", path.display()))
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| KeywardError::PersistenceFailure(format!("parse {}: {e}", path.display())))
}

fn decode_secret(name: &str, stored: &StoredSecret) -> Result<SecretRecord> {
    let public_data = B64.decode(&stored.public_data).map_err(|e| {
        KeywardError::PersistenceFailure(format!("secret '{name}' has corrupt public data: {e}"))
    })?;
    Ok(SecretRecord {
        name: name.to_string(),
        public_data,
    })
}

/// Write `data` to `path` with mode `0600` via a sibling temp file and rename,
/// so a crash never leaves a half-written store behind.
fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let tmp_path = path.with_extension("json.tmp");
    {
        #[cfg(unix)]
        let mut f = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?
        };
        #[cfg(not(unix))]
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        f.write_all(data)?;
        f.flush()?;
    }
    std::fs::rename(&tmp_path, path)
}
