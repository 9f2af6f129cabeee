//! Remote shell access to provisioned instances.
//!
//! Every call to [`RemoteShell::run`] opens its own SSH session, runs the
//! given steps in order and closes the session. Nothing is kept open between
//! calls.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use thiserror::Error;
use tracing::debug;

/// SSH port.
const SSH_PORT: u16 = 22;

/// Default user on provisioned images.
pub const DEFAULT_USER: &str = "root";

/// TCP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout for any single blocking SSH operation.
const COMMAND_TIMEOUT_SECS: u64 = 120;

/// Errors from remote sessions.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The server refused our key. Retrying will not help.
    #[error("SSH authentication failed: {0}")]
    Authentication(String),

    /// TCP connect or SSH handshake failed.
    #[error("SSH connection failed: {0}")]
    Connection(String),

    /// Channel, exec or SFTP failure inside an established session.
    #[error("SSH session error: {0}")]
    Session(String),

    /// Local or stream I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking worker died.
    #[error("SSH worker failed: {0}")]
    Task(String),
}

impl RemoteError {
    /// Whether this is an authentication failure.
    #[must_use]
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

impl From<ssh2::Error> for RemoteError {
    fn from(e: ssh2::Error) -> Self {
        Self::Session(e.to_string())
    }
}

/// One operation inside a remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStep {
    /// Run a command and capture its standard output.
    Exec(String),
    /// Run a launcher command without capturing output. Only the launching
    /// shell is waited for, not what it backgrounds.
    Spawn(String),
    /// Write a file.
    Upload {
        /// Remote path.
        path: String,
        /// File contents.
        contents: String,
    },
}

/// Remote command execution.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Open a session to `host`, run `steps` in order, close the session.
    ///
    /// Returns one output per step: captured stdout for
    /// [`RemoteStep::Exec`], empty for the others.
    async fn run(&self, host: &str, steps: Vec<RemoteStep>) -> Result<Vec<String>, RemoteError>;
}

/// [`RemoteShell`] backed by libssh2, using public key authentication only.
#[derive(Debug, Clone)]
pub struct SshShell {
    user: String,
    key_path: PathBuf,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshShell {
    /// Connect as `root` with the given private key.
    #[must_use]
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
            key_path: key_path.into(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(COMMAND_TIMEOUT_SECS),
        }
    }

    /// Override the login user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Private key in use.
    #[must_use]
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    fn connect(&self, host: &str) -> Result<Session, RemoteError> {
        let addr = (host, SSH_PORT)
            .to_socket_addrs()
            .map_err(|e| RemoteError::Connection(format!("{host}: {e}")))?
            .next()
            .ok_or_else(|| RemoteError::Connection(format!("{host}: no address")))?;

        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| RemoteError::Connection(format!("{addr}: {e}")))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.command_timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| RemoteError::Connection(format!("handshake with {addr}: {e}")))?;

        session
            .userauth_pubkey_file(&self.user, None, &self.key_path, None)
            .map_err(|e| RemoteError::Authentication(e.to_string()))?;
        if !session.authenticated() {
            return Err(RemoteError::Authentication(format!(
                "key {} rejected for {}",
                self.key_path.display(),
                self.user
            )));
        }

        Ok(session)
    }

    fn run_blocking(&self, host: &str, steps: &[RemoteStep]) -> Result<Vec<String>, RemoteError> {
        let session = self.connect(host)?;
        let mut outputs = Vec::with_capacity(steps.len());

        for step in steps {
            match step {
                RemoteStep::Exec(command) => {
                    debug!(host = %host, command = %command, "Running remote command");
                    let mut channel = session.channel_session()?;
                    channel.exec(command)?;
                    let mut stdout = String::new();
                    channel.read_to_string(&mut stdout)?;
                    channel.wait_close()?;
                    outputs.push(stdout);
                }
                RemoteStep::Spawn(command) => {
                    debug!(host = %host, command = %command, "Launching remote command");
                    let mut channel = session.channel_session()?;
                    channel.exec(command)?;
                    channel.send_eof()?;
                    channel.wait_eof()?;
                    channel.wait_close()?;
                    outputs.push(String::new());
                }
                RemoteStep::Upload { path, contents } => {
                    debug!(host = %host, path = %path, bytes = contents.len(), "Uploading file");
                    let sftp = session.sftp()?;
                    let mut file = sftp.create(Path::new(path))?;
                    file.write_all(contents.as_bytes())?;
                    outputs.push(String::new());
                }
            }
        }

        session.disconnect(None, "done", None).ok();
        Ok(outputs)
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, host: &str, steps: Vec<RemoteStep>) -> Result<Vec<String>, RemoteError> {
        let shell = self.clone();
        let host = host.to_string();
        tokio::task::spawn_blocking(move || shell.run_blocking(&host, &steps))
            .await
            .map_err(|e| RemoteError::Task(e.to_string()))?
    }
}
