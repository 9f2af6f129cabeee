//! Local SSH key discovery and generation.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::info;

use crate::config::candidate_paths;

/// File name of generated keys under `~/.ssh`.
pub const GENERATED_KEY_NAME: &str = "datacrunch_ed25519";

/// Comment embedded in generated keys.
const GENERATED_KEY_COMMENT: &str = "datacrunch-lerobot-training";

/// Key generation errors.
#[derive(Error, Debug)]
pub enum KeygenError {
    /// `ssh-keygen` is not installed.
    #[error("ssh-keygen command not found, install an OpenSSH client")]
    NotInstalled,

    /// `ssh-keygen` ran but failed.
    #[error("ssh-keygen failed: {0}")]
    Failed(String),

    /// A key already exists at the target path.
    #[error("Key already exists: {0}")]
    AlreadyExists(PathBuf),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Private keys present in the well-known locations under `home`.
#[must_use]
pub fn existing_keys(home: &Path) -> Vec<PathBuf> {
    candidate_paths(Some(home))
        .into_iter()
        .filter(|p| p.exists())
        .collect()
}

/// Path of the public half of `private_key`.
#[must_use]
pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut name = private_key.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// Contents of the public half of `private_key`, if present.
#[must_use]
pub fn read_public_key(private_key: &Path) -> Option<String> {
    std::fs::read_to_string(public_key_path(private_key))
        .ok()
        .map(|k| k.trim().to_string())
}

/// Generate an unencrypted ed25519 key pair at `~/.ssh/datacrunch_ed25519`.
///
/// # Errors
/// Returns an error if the key exists already or `ssh-keygen` fails.
pub fn generate_key(home: &Path) -> Result<PathBuf, KeygenError> {
    let ssh_dir = home.join(".ssh");
    let key_path = ssh_dir.join(GENERATED_KEY_NAME);
    if key_path.exists() {
        return Err(KeygenError::AlreadyExists(key_path));
    }

    std::fs::create_dir_all(&ssh_dir)?;
    set_mode(&ssh_dir, 0o700)?;

    info!(path = %key_path.display(), "Generating SSH key");
    let output = Command::new("ssh-keygen")
        .arg("-t")
        .arg("ed25519")
        .arg("-f")
        .arg(&key_path)
        .args(["-N", "", "-C", GENERATED_KEY_COMMENT])
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KeygenError::NotInstalled,
            _ => KeygenError::Io(e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(KeygenError::Failed(stderr.trim().to_string()));
    }

    set_mode(&key_path, 0o600)?;
    set_mode(&public_key_path(&key_path), 0o644)?;
    Ok(key_path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
