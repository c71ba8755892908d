//! Agent service lifecycle.
//!
//! [`AgentService`] ties the [`SecretStore`], the [`RemoteVaultClient`] and
//! the [`IdentityKeyring`] together and owns the agent socket.
//!
//! ## Lifecycle
//!
//! 1. [`AgentService::start`]: loads every stored record into the keyring.
//!    Records that do not parse are logged and skipped.
//! 2. [`AgentService::run`]: removes a stale socket, binds, and serves SSH
//!    agent connections until the future is dropped.
//! 3. [`AgentService::shutdown`]: removes the socket file.  Runs once; later
//!    calls are no-ops.
//!
//! [`import_identity`](AgentService::import_identity) and
//! [`export_public_key`](AgentService::export_public_key) work in any state.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use keyward_core::config::AgentConfig;
use keyward_core::store::{SecretRecord, SecretStore};
use keyward_core::vault::RemoteVaultClient;
use keyward_core::{KeywardError, Result};
use tracing::{debug, info, warn};

use crate::keyring::{DiscoveredIdentity, IdentityKeyring, IdentitySource};
use crate::session::KeywardAgent;
use crate::signer::DelegatedSigner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Started,
    Running,
    ShuttingDown,
    Stopped,
}

type SharedStore = Arc<Mutex<SecretStore>>;

fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, SecretStore>> {
    store
        .lock()
        .map_err(|_| anyhow::anyhow!("secret store lock poisoned").into())
}

/// Re-reads the store on every discovery so keys imported by another
/// `keywardd --import` process appear without a restart.
///
/// Each record name is handed out at most once.  Names loaded by `start` or
/// imported by this process are marked seen up front, so an identity removed
/// from the keyring stays removed.
#[derive(Debug)]
struct StoreIdentitySource {
    store: SharedStore,
    client: RemoteVaultClient,
    seen: Mutex<HashSet<String>>,
}

impl StoreIdentitySource {
    fn mark_seen<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| anyhow::anyhow!("discovered-record set lock poisoned"))?;
        seen.extend(names.into_iter().map(str::to_owned));
        Ok(())
    }
}

#[async_trait]
impl IdentitySource for StoreIdentitySource {
    async fn discover(&self) -> Result<Vec<DiscoveredIdentity>> {
        let records = {
            let mut store = lock_store(&self.store)?;
            store.reload()?;
            store.get_secrets()?
        };
        let fresh: Vec<SecretRecord> = {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| anyhow::anyhow!("discovered-record set lock poisoned"))?;
            records
                .into_iter()
                .filter(|record| seen.insert(record.name.clone()))
                .collect()
        };
        Ok(fresh
            .iter()
            .filter_map(|record| match DelegatedSigner::from_record(record, self.client.clone()) {
                Ok(signer) => {
                    debug!(secret = %record.name, "discovered new stored record");
                    Some(DiscoveredIdentity {
                        signer: Arc::new(signer),
                        comment: record.name.clone(),
                    })
                }
                Err(e) => {
                    warn!(secret = %record.name, error = %e, "skipping unusable stored record");
                    None
                }
            })
            .collect())
    }
}

#[derive(Debug)]
pub struct AgentService {
    socket_path: PathBuf,
    accept_backoff: Duration,
    client: RemoteVaultClient,
    store: SharedStore,
    source: Arc<StoreIdentitySource>,
    keyring: Arc<IdentityKeyring>,
    state: Mutex<ServiceState>,
    shut_down: AtomicBool,
}

impl AgentService {
    pub fn new(config: &AgentConfig, store: SecretStore, client: RemoteVaultClient) -> Self {
        let store = Arc::new(Mutex::new(store));
        let source = Arc::new(StoreIdentitySource {
            store: Arc::clone(&store),
            client: client.clone(),
            seen: Mutex::new(HashSet::new()),
        });
        Self {
            socket_path: config.socket_path.clone(),
            accept_backoff: Duration::from_millis(config.accept_backoff_ms),
            client,
            store,
            keyring: Arc::new(IdentityKeyring::with_source(
                Arc::clone(&source) as Arc<dyn IdentitySource>
            )),
            source,
            state: Mutex::new(ServiceState::Created),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Open the store and connect to the custody daemon named in `config`.
    pub async fn connect(config: &AgentConfig) -> Result<Self> {
        let store = SecretStore::open(&config.storage_path)?;
        let client = RemoteVaultClient::connect(&config.vault_socket_path)
            .await?
            .with_timeout(config.request_timeout_secs.map(Duration::from_secs));
        Ok(Self::new(config, store, client))
    }

    pub fn keyring(&self) -> &Arc<IdentityKeyring> {
        &self.keyring
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> ServiceState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: ServiceState) {
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Move from `from` to `to`, failing if the service is elsewhere.
    fn transition(&self, from: ServiceState, to: ServiceState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("service state lock poisoned"))?;
        if *state != from {
            return Err(anyhow::anyhow!(
                "agent service is {:?}, expected {:?}",
                *state,
                from
            )
            .into());
        }
        *state = to;
        Ok(())
    }

    /// Load every stored record into the keyring.
    pub async fn start(&self) -> Result<()> {
        self.transition(ServiceState::Created, ServiceState::Started)?;

        let records = {
            let mut store = lock_store(&self.store)?;
            store.reload()?;
            store.get_secrets()?
        };
        self.source
            .mark_seen(records.iter().map(|record| record.name.as_str()))?;

        let mut loaded = 0usize;
        for record in &records {
            match DelegatedSigner::from_record(record, self.client.clone()) {
                Ok(signer) => {
                    self.keyring
                        .add(Arc::new(signer), record.name.clone(), 0, false)
                        .await?;
                    loaded += 1;
                }
                Err(e) => {
                    warn!(secret = %record.name, error = %e, "skipping stored key that cannot be loaded");
                }
            }
        }
        info!(loaded, stored = records.len(), "identities loaded from store");
        Ok(())
    }

    /// Serve the agent socket.  Only returns on a bind or listener failure;
    /// drop the future to stop serving.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.transition(ServiceState::Started, ServiceState::Running)?;

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create socket directory {parent:?}"))?;
        }

        // Remove stale socket from a previous run.
        if self.socket_path.exists()
            && let Err(e) = std::fs::remove_file(&self.socket_path)
        {
            warn!(path = %self.socket_path.display(), "failed to remove stale agent socket: {e}");
        }

        info!(socket = %self.socket_path.display(), "SSH agent listening");
        KeywardAgent::new(Arc::clone(&self.keyring))
            .listen(&self.socket_path, self.accept_backoff)
            .await
    }

    /// Remove the agent socket.  Safe to call from several places; only the
    /// first call does anything.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("agent service already shut down");
            return;
        }
        self.set_state(ServiceState::ShuttingDown);

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => info!(socket = %self.socket_path.display(), "agent socket removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(socket = %self.socket_path.display(), "no agent socket to remove");
            }
            Err(e) => warn!(socket = %self.socket_path.display(), "failed to remove agent socket: {e}"),
        }

        self.set_state(ServiceState::Stopped);
    }

    /// Fetch the public data of `secret_name` from the custody daemon, persist
    /// it, and offer the key.  Returns the `authorized_keys` line.
    pub async fn import_identity(&self, secret_name: &str) -> Result<String> {
        let payload = self.client.ssh_public_data(secret_name).await?;
        let record = SecretRecord::from_public_data_payload(&payload)?;
        if record.name != secret_name {
            debug!(requested = secret_name, stored = %record.name, "custody daemon renamed secret");
        }
        let signer = DelegatedSigner::from_record(&record, self.client.clone())?;
        let public = record.public_data_str()?.trim_end().to_string();

        lock_store(&self.store)?.store_secret(&record)?;
        self.source.mark_seen([record.name.as_str()])?;
        self.keyring
            .add(Arc::new(signer), record.name.clone(), 0, false)
            .await?;

        info!(secret = %record.name, "imported identity");
        Ok(public)
    }

    /// The stored `authorized_keys` line for `secret_name`.
    pub fn export_public_key(&self, secret_name: &str) -> Result<String> {
        let record = lock_store(&self.store)?.get_secret(secret_name)?;
        Ok(record.public_data_str()?.trim_end().to_string())
    }
}

impl Drop for AgentService {
    fn drop(&mut self) {
        if self.state() == ServiceState::Running {
            self.shutdown();
        }
    }
}
