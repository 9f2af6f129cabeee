//! Launcher configuration.
//!
//! Everything is read from the process environment once, at startup, and
//! passed down explicitly. A `.env` file is honoured by the binary before
//! this module runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::providers::datacrunch::API_BASE_URL;

/// Default OS image for training instances.
pub const DEFAULT_IMAGE: &str = "ubuntu-24.04-cuda-12.8-open";

/// Default GPU filter.
pub const DEFAULT_REQUIRED_GPU: &str = "H100";

/// Default price cap in USD per hour.
pub const DEFAULT_PRICE_CAP: f64 = 1.0;

/// Datacenters tried, in order, when creating an instance.
pub const DEFAULT_LOCATIONS: [&str; 4] = ["FIN-01", "FIN-02", "FIN-03", "ICE-01"];

/// Private key file names looked up under `~/.ssh`, in order.
pub const SSH_KEY_CANDIDATES: [&str; 6] = [
    "id_rsa",
    "id_ed25519",
    "id_ecdsa",
    "datacrunch",
    "datacrunch_rsa",
    "datacrunch_ed25519",
];

const DEFAULT_INSTALL_SCRIPT: &str = "scripts/install_lerobot.sh";
const DEFAULT_TRAIN_SCRIPT: &str = "scripts/train.sh";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_READY_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 1800;

/// Configuration errors. All are fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required variables are unset or empty.
    #[error("Missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    /// A variable is set but cannot be used.
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    /// No private key could be found.
    #[error("No SSH private key found (checked: {})", format_paths(.checked))]
    NoSshKey { checked: Vec<PathBuf> },
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Provider API credentials.
#[derive(Clone)]
pub struct Credentials {
    /// OAuth2 client ID.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// API root URL.
    pub api_url: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("api_url", &self.api_url)
            .finish()
    }
}

impl Credentials {
    /// Read credentials from the process environment.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] naming every absent variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    /// Read credentials through an arbitrary lookup function.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] naming every absent variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let client_id = required(&lookup, "DATACRUNCH_CLIENT_ID", &mut missing);
        let client_secret = required(&lookup, "DATACRUNCH_CLIENT_SECRET", &mut missing);
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        Ok(Self {
            client_id,
            client_secret,
            api_url: api_url(&lookup),
        })
    }
}

/// Polling cadence and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Sleep between attempts.
    pub interval: Duration,
    /// Limit for the instance to reach `running` with an address.
    pub ready_timeout: Duration,
    /// Limit for the install sentinel to appear.
    pub install_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            install_timeout: Duration::from_secs(DEFAULT_INSTALL_TIMEOUT_SECS),
        }
    }
}

/// Full configuration for a provisioning run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider credentials.
    pub credentials: Credentials,
    /// Hugging Face token, substituted into the startup script.
    pub huggingface_token: String,
    /// Weights & Biases token, substituted into the startup script.
    pub wandb_token: String,
    /// Maximum spot price in USD per hour (inclusive).
    pub price_cap: f64,
    /// Case-insensitive substring the GPU description must contain.
    pub required_gpu: String,
    /// OS image name.
    pub image: String,
    /// Resolved private key, if any was found.
    pub ssh_key_path: Option<PathBuf>,
    /// Startup script template.
    pub install_script: PathBuf,
    /// Training script template.
    pub train_script: PathBuf,
    /// Datacenters to try, in order.
    pub locations: Vec<String>,
    /// Polling settings.
    pub poll: PollSettings,
}

impl Config {
    /// Read the configuration from the process environment.
    ///
    /// # Errors
    /// Returns an error if required variables are missing or malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup, dirs::home_dir().as_deref())
    }

    /// Read the configuration through a lookup function, resolving SSH keys
    /// relative to `home`.
    ///
    /// # Errors
    /// Returns an error if required variables are missing or malformed.
    pub fn from_lookup<F>(lookup: F, home: Option<&Path>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let client_id = required(&lookup, "DATACRUNCH_CLIENT_ID", &mut missing);
        let client_secret = required(&lookup, "DATACRUNCH_CLIENT_SECRET", &mut missing);
        let huggingface_token = required(&lookup, "HUGGINGFACE_TOKEN", &mut missing);
        let wandb_token = required(&lookup, "WANDB_TOKEN", &mut missing);
        let image = lookup("IMAGE_NAME").unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        if image.trim().is_empty() {
            missing.push("IMAGE_NAME");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let price_cap = match lookup("PRICE_CAP") {
            Some(raw) => parse_price_cap(&raw)?,
            None => DEFAULT_PRICE_CAP,
        };

        let poll = PollSettings {
            interval: parse_interval(&lookup)?,
            ready_timeout: parse_secs(&lookup, "READY_TIMEOUT_SECS", DEFAULT_READY_TIMEOUT_SECS)?,
            install_timeout: parse_secs(
                &lookup,
                "INSTALL_TIMEOUT_SECS",
                DEFAULT_INSTALL_TIMEOUT_SECS,
            )?,
        };

        let explicit_key = lookup("SSH_KEY_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            credentials: Credentials {
                client_id,
                client_secret,
                api_url: api_url(&lookup),
            },
            huggingface_token,
            wandb_token,
            price_cap,
            required_gpu: lookup("REQUIRED_GPU")
                .unwrap_or_else(|| DEFAULT_REQUIRED_GPU.to_string()),
            image,
            ssh_key_path: resolve_ssh_key(explicit_key.as_deref(), home),
            install_script: lookup("INSTALL_SCRIPT_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_INSTALL_SCRIPT), PathBuf::from),
            train_script: lookup("TRAIN_SCRIPT_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_TRAIN_SCRIPT), PathBuf::from),
            locations: DEFAULT_LOCATIONS.iter().map(ToString::to_string).collect(),
            poll,
        })
    }

    /// The private key to authenticate with, validated.
    ///
    /// Loose file permissions only produce a warning.
    ///
    /// # Errors
    /// Returns [`ConfigError::NoSshKey`] if no key was found.
    pub fn require_ssh_key(&self) -> Result<&Path, ConfigError> {
        let path = self
            .ssh_key_path
            .as_deref()
            .filter(|p| p.exists())
            .ok_or_else(|| ConfigError::NoSshKey {
                checked: candidate_paths(dirs::home_dir().as_deref()),
            })?;
        check_key_permissions(path);
        Ok(path)
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn required<F>(lookup: &F, name: &'static str, missing: &mut Vec<&'static str>) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        Some(value) => value,
        None => {
            missing.push(name);
            String::new()
        }
    }
}

fn api_url<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup("DATACRUNCH_API_URL")
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| API_BASE_URL.to_string())
}

fn parse_price_cap(raw: &str) -> Result<f64, ConfigError> {
    let value: f64 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
        name: "PRICE_CAP",
        reason: format!("{raw:?} is not a number ({e})"),
    })?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Invalid {
            name: "PRICE_CAP",
            reason: format!("{value} is not a valid price"),
        });
    }
    Ok(value)
}

fn parse_secs<F>(lookup: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(Duration::from_secs(default));
    };
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigError::Invalid {
            name,
            reason: format!("{raw:?} is not a number of seconds ({e})"),
        })
}

fn parse_interval<F>(lookup: &F) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let interval = parse_secs(lookup, "POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
    if interval.is_zero() {
        return Err(ConfigError::Invalid {
            name: "POLL_INTERVAL_SECS",
            reason: "must be at least 1 second".to_string(),
        });
    }
    Ok(interval)
}

/// Well-known private key locations under `home`.
#[must_use]
pub fn candidate_paths(home: Option<&Path>) -> Vec<PathBuf> {
    home.map(|h| {
        SSH_KEY_CANDIDATES
            .iter()
            .map(|name| h.join(".ssh").join(name))
            .collect()
    })
    .unwrap_or_default()
}

/// Pick the private key to use: the explicit path if it exists, otherwise the
/// first existing well-known location.
#[must_use]
pub fn resolve_ssh_key(explicit: Option<&Path>, home: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            info!(path = %path.display(), "Using provided SSH key");
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "SSH_KEY_PATH does not exist, searching default locations");
    }

    let found = candidate_paths(home).into_iter().find(|p| p.exists());
    if let Some(path) = &found {
        info!(path = %path.display(), "Found SSH key");
    }
    found
}

#[cfg(unix)]
fn check_key_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode() & 0o777;
            if mode == 0o600 || mode == 0o400 {
                info!(path = %path.display(), mode = format!("{mode:o}"), "SSH key validated");
            } else {
                warn!(
                    path = %path.display(),
                    mode = format!("{mode:o}"),
                    "SSH key has permissive permissions, consider: chmod 600 {}",
                    path.display()
                );
            }
        }
        Err(e) => warn!(error = %e, "Could not check SSH key permissions"),
    }
}

#[cfg(not(unix))]
fn check_key_permissions(_path: &Path) {}
