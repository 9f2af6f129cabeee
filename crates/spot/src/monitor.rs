//! Read-only inspection of running instances and training jobs.

use tracing::{debug, warn};

use crate::launcher::REMOTE_LOG_PATH;
use crate::providers::{Instance, InstanceStatus, ProviderError, SpotProvider};
use crate::remote::{RemoteError, RemoteShell, RemoteStep};

/// Lists training processes. The bracket keeps the pattern from matching the
/// shell running this pipeline.
pub const TRAINING_PROCESS_CHECK: &str = "ps aux | grep '[p]ython' | grep lerobot";

/// Number of log lines shown per host.
pub const LOG_TAIL_LINES: usize = 20;

/// Training state of one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingProgress {
    /// Host address.
    pub host: String,
    /// Whether a training process was found.
    pub training_running: bool,
    /// Last lines of the training log, trimmed. Empty if there is no log.
    pub log_tail: String,
}

/// Result of checking one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCheck {
    /// The host answered.
    Reached(TrainingProgress),
    /// The host could not be checked.
    Unreachable {
        /// Host address.
        host: String,
        /// Why.
        error: String,
    },
}

/// One monitoring pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
    /// Running instances, empty when a single host was requested.
    pub running: Vec<Instance>,
    /// Per-host checks.
    pub checks: Vec<HostCheck>,
}

/// All instances whose status is `running`.
///
/// # Errors
/// Returns the provider error if the listing fails.
pub async fn running_instances<P>(provider: &P) -> Result<Vec<Instance>, ProviderError>
where
    P: SpotProvider + ?Sized,
{
    Ok(provider
        .list_instances()
        .await?
        .into_iter()
        .filter(|i| i.status == InstanceStatus::Running)
        .collect())
}

/// Check for a training process on `host` and read the tail of its log.
///
/// # Errors
/// Returns the remote error if the session fails.
pub async fn check_training_progress<R>(remote: &R, host: &str) -> Result<TrainingProgress, RemoteError>
where
    R: RemoteShell + ?Sized,
{
    let outputs = remote
        .run(
            host,
            vec![
                RemoteStep::Exec(TRAINING_PROCESS_CHECK.to_string()),
                RemoteStep::Exec(format!("tail -{LOG_TAIL_LINES} {REMOTE_LOG_PATH}")),
            ],
        )
        .await?;

    let mut outputs = outputs.into_iter();
    let processes = outputs.next().unwrap_or_default();
    let log_tail = outputs.next().unwrap_or_default();

    Ok(TrainingProgress {
        host: host.to_string(),
        training_running: !processes.trim().is_empty(),
        log_tail: log_tail.trim().to_string(),
    })
}

async fn check_host<R>(remote: &R, host: &str) -> HostCheck
where
    R: RemoteShell + ?Sized,
{
    match check_training_progress(remote, host).await {
        Ok(progress) => HostCheck::Reached(progress),
        Err(e) => {
            warn!(host = %host, error = %e, "Failed to check training progress");
            HostCheck::Unreachable {
                host: host.to_string(),
                error: e.to_string(),
            }
        }
    }
}

/// Run one monitoring pass.
///
/// With `host`, only that address is checked. Otherwise every running
/// instance with an address is checked. Hosts are not checked at all when no
/// `remote` is available.
///
/// # Errors
/// Returns the provider error if listing instances fails.
pub async fn collect_report<P, R>(
    provider: &P,
    remote: Option<&R>,
    host: Option<&str>,
) -> Result<MonitorReport, ProviderError>
where
    P: SpotProvider + ?Sized,
    R: RemoteShell + ?Sized,
{
    if let Some(host) = host {
        let checks = match remote {
            Some(remote) => vec![check_host(remote, host).await],
            None => Vec::new(),
        };
        return Ok(MonitorReport {
            running: Vec::new(),
            checks,
        });
    }

    let running = running_instances(provider).await?;
    let mut checks = Vec::new();
    if let Some(remote) = remote {
        for instance in &running {
            match instance.address() {
                Some(ip) => checks.push(check_host(remote, ip).await),
                None => debug!(instance_id = %instance.id, "Running instance has no address"),
            }
        }
    }

    Ok(MonitorReport { running, checks })
}
