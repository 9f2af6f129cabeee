//! Spot GPU provisioning for training runs.
//!
//! Rents the first matching spot GPU instance from DataCrunch, waits for
//! it to install its software, and starts a detached training job on it.
//! Anything created is deleted again if the run fails or is interrupted.
//!
//! ## Workflow
//!
//! ```text
//!  select type ──► startup script ──► create instance ──► wait running
//!                                     (per location)           │
//!                                                              ▼
//!                  start training ◄── wait install sentinel ◄──┘
//!                  (upload, nohup)       (SSH polling)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use spot::config::Config;
//! use spot::launcher::{Launcher, ScriptTemplates};
//! use spot::providers::datacrunch::DataCrunch;
//! use spot::remote::SshShell;
//!
//! let config = Config::from_env()?;
//! let shell = SshShell::new(config.require_ssh_key()?);
//! let provider = DataCrunch::with_base_url(
//!     &config.credentials.client_id,
//!     &config.credentials.client_secret,
//!     &config.credentials.api_url,
//! )?;
//!
//! let templates = ScriptTemplates::load(&config)?;
//! let summary = Launcher::new(&provider, &shell, &config, templates).run().await?;
//! println!("training on {}", summary.ip);
//! ```

pub mod config;
pub mod keys;
pub mod launcher;
pub mod monitor;
pub mod providers;
pub mod remote;
pub mod selector;
pub mod session;
pub mod template;

pub use config::{Config, ConfigError, Credentials, PollSettings};
pub use launcher::{LaunchError, LaunchSummary, Launcher, Outcome, RunState, ScriptTemplates};
pub use providers::datacrunch;
pub use providers::traits::{
    Balance, CreateInstanceRequest, Instance, InstanceStatus, InstanceType, ProviderError,
    SpotProvider, SshKey, StartupScript,
};
pub use remote::{RemoteError, RemoteShell, RemoteStep, SshShell};
pub use session::Session;
