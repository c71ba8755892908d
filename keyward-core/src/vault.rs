//! Client for the custody daemon that holds the private keys.
//!
//! The daemon accepts one command line per call (`sign-ecdsa deploy <digest>`)
//! and answers with a `{Result, Error}` pair where exactly one side is
//! meaningful.  [`RemoteVaultClient`] exposes the commands as typed methods;
//! the bytes on the wire are the concern of a [`VaultTransport`].
//!
//! [`UnixRpcTransport`] is the production transport: Go-style JSON-RPC 1.0
//! over a single persistent Unix socket connection, one JSON document per
//! line, requests correlated with replies by id.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{KeywardError, Result};

/// RPC method every command is routed through on the daemon side.
const RPC_METHOD: &str = "CommandProxy.HandleCommand";

/// Known commands and, per positional argument, whether it is quoted on the
/// command line.
const COMMANDS: &[(&str, &[bool])] = &[
    ("new-text-secret", &[false, true]),
    ("create", &[false, true]),
    ("write", &[false, false, true]),
    ("access", &[false]),
    ("delete", &[false]),
    ("sign-ecdsa", &[false, false]),
    ("new-group", &[false]),
    ("ssh-public-data", &[false]),
];

/// A named daemon command with its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    name: &'static str,
    quoting: &'static [bool],
    args: Vec<String>,
}

impl RemoteCommand {
    /// Build a command, checking the name and argument count against the
    /// commands the daemon understands.
    pub fn new(name: &str, args: Vec<String>) -> Result<Self> {
        let (name, quoting) = COMMANDS
            .iter()
            .copied()
            .find(|(known, _)| *known == name)
            .ok_or_else(|| anyhow::anyhow!("unknown custody daemon command '{name}'"))?;
        if args.len() != quoting.len() {
            return Err(anyhow::anyhow!(
                "command '{name}' takes {} arguments, got {}",
                quoting.len(),
                args.len()
            )
            .into());
        }
        Ok(Self {
            name,
            quoting,
            args,
        })
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Render the command line sent to the daemon.
    pub fn line(&self) -> String {
        let mut line = String::from(self.name);
        for (arg, quoted) in self.args.iter().zip(self.quoting) {
            line.push(' ');
            if *quoted {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line.trim_end().to_string()
    }
}

/// The daemon's answer.  A non-empty `error` means the operation failed and
/// `result` is to be ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResult {
    #[serde(rename = "Result", default)]
    pub result: String,
    #[serde(rename = "Error", default)]
    pub error: String,
}

impl RemoteResult {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            error: String::new(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            result: String::new(),
            error: error.into(),
        }
    }

    pub fn into_result(self) -> Result<String> {
        if self.error.is_empty() {
            Ok(self.result)
        } else {
            Err(KeywardError::Vault(self.error))
        }
    }
}

/// Moves one command to the daemon and brings back its answer.
///
/// Implementations return `Err` only for transport problems; an error the
/// daemon reports travels inside [`RemoteResult`].
#[async_trait]
pub trait VaultTransport: Send + Sync + std::fmt::Debug {
    async fn call(&self, command: &RemoteCommand) -> Result<RemoteResult>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'static str,
    params: [RpcArgs<'a>; 1],
    id: u64,
}

#[derive(Serialize)]
struct RpcArgs<'a> {
    #[serde(rename = "Line")]
    line: &'a str,
}

#[derive(Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<RemoteResult>,
    #[serde(default)]
    error: Option<String>,
}

struct RpcConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RpcConnection {
    async fn dial(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            KeywardError::RemoteUnavailable(format!(
                "could not connect to custody daemon at {}: {e}",
                path.display()
            ))
        })?;
        let (read_half, writer) = stream.into_split();
        debug!(path = %path.display(), "connected to custody daemon");
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    /// Send one request frame and read until the reply carrying `id`.
    /// Errors are transport errors only.
    async fn exchange(&mut self, id: u64, frame: &[u8]) -> Result<RpcResponse> {
        self.writer.write_all(frame).await.map_err(unavailable)?;
        self.writer.flush().await.map_err(unavailable)?;

        loop {
            let mut buf = String::new();
            let n = self.reader.read_line(&mut buf).await.map_err(unavailable)?;
            if n == 0 {
                return Err(unavailable("custody daemon closed the connection"));
            }
            let response: RpcResponse = serde_json::from_str(&buf)
                .map_err(|e| unavailable(format!("malformed reply from custody daemon: {e}")))?;
            if response.id != id {
                warn!(expected = id, got = response.id, "discarding stale custody daemon reply");
                continue;
            }
            return Ok(response);
        }
    }
}

/// JSON-RPC 1.0 over a persistent Unix socket connection.
///
/// Calls are serialised on the connection.  The connection is taken out of
/// its slot for the duration of a call and put back only after a complete
/// reply, so a call that fails or is dropped mid-frame leaves the slot empty
/// and the next call dials a fresh connection.
pub struct UnixRpcTransport {
    path: PathBuf,
    conn: Mutex<Option<RpcConnection>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for UnixRpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixRpcTransport")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl UnixRpcTransport {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = RpcConnection::dial(&path).await?;
        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
            next_id: AtomicU64::new(0),
        })
    }
}

fn unavailable(e: impl std::fmt::Display) -> KeywardError {
    KeywardError::RemoteUnavailable(e.to_string())
}

#[async_trait]
impl VaultTransport for UnixRpcTransport {
    async fn call(&self, command: &RemoteCommand) -> Result<RemoteResult> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = command.line();
        let request = RpcRequest {
            method: RPC_METHOD,
            params: [RpcArgs { line: &line }],
            id,
        };
        let mut frame = serde_json::to_vec(&request).map_err(|e| anyhow::anyhow!(e))?;
        frame.push(b'\n');

        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!(path = %self.path.display(), "redialing custody daemon");
                RpcConnection::dial(&self.path).await?
            }
        };
        let response = conn.exchange(id, &frame).await?;
        *slot = Some(conn);
        drop(slot);

        if let Some(error) = response.error.filter(|e| !e.is_empty()) {
            return Err(KeywardError::Vault(error));
        }
        response
            .result
            .ok_or_else(|| unavailable("custody daemon reply carries no result"))
    }
}

/// Typed access to the custody daemon.
#[derive(Debug, Clone)]
pub struct RemoteVaultClient {
    transport: Arc<dyn VaultTransport>,
    timeout: Option<Duration>,
}

impl RemoteVaultClient {
    pub fn new(transport: Arc<dyn VaultTransport>) -> Self {
        Self {
            transport,
            timeout: None,
        }
    }

    /// Connect to the daemon's Unix socket.  Failing here is fatal to
    /// anything that needs to sign.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let transport = UnixRpcTransport::connect(path).await?;
        Ok(Self::new(Arc::new(transport)))
    }

    /// Bound every call by `timeout`; `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `command` and return the daemon's success payload.
    pub async fn execute(&self, command: RemoteCommand) -> Result<String> {
        debug!(command = command.name(), "custody daemon call");
        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.call(&command))
                .await
                .map_err(|_| KeywardError::Timeout(limit))??,
            None => self.transport.call(&command).await?,
        };
        reply.into_result()
    }

    async fn run(&self, name: &str, args: &[&str]) -> Result<String> {
        let args = args.iter().map(|a| a.to_string()).collect();
        self.execute(RemoteCommand::new(name, args)?).await
    }

    /// Sign a base64-encoded SHA-256 digest with the ECDSA key `secret_name`.
    /// The reply is `"<b64 R> <b64 S>"`.
    pub async fn sign_ecdsa(&self, secret_name: &str, digest_b64: &str) -> Result<String> {
        self.run("sign-ecdsa", &[secret_name, digest_b64]).await
    }

    /// Fetch the base64 JSON public data for `secret_name`.
    pub async fn ssh_public_data(&self, secret_name: &str) -> Result<String> {
        self.run("ssh-public-data", &[secret_name]).await
    }

    pub async fn new_text_secret(&self, secret_name: &str, content: &str) -> Result<String> {
        self.run("new-text-secret", &[secret_name, content]).await
    }

    pub async fn create(&self, secret_name: &str, secret_type: &str) -> Result<String> {
        self.run("create", &[secret_name, secret_type]).await
    }

    pub async fn write(&self, secret_name: &str, content_type: &str, content: &str) -> Result<String> {
        self.run("write", &[secret_name, content_type, content]).await
    }

    pub async fn access(&self, secret_name: &str) -> Result<String> {
        self.run("access", &[secret_name]).await
    }

    pub async fn delete(&self, secret_name: &str) -> Result<String> {
        self.run("delete", &[secret_name]).await
    }

    pub async fn new_group(&self, group_name: &str) -> Result<String> {
        self.run("new-group", &[group_name]).await
    }
}
