//! Provisioning workflow.
//!
//! One [`Launcher`] drives a single run through
//! `Init → Selecting → Creating → WaitingReady → Installing → RunningScript → Done`.
//! Any unrecoverable error moves it to `Cleanup`, deletes what was created,
//! and ends in `Failed`.

use std::future::Future;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::providers::{CreateInstanceRequest, InstanceStatus, InstanceType, ProviderError, SpotProvider};
use crate::remote::{RemoteError, RemoteShell, RemoteStep};
use crate::selector::{first_match, Criteria};
use crate::session::Session;
use crate::template::{Template, TemplateError};

/// Marker file written by the startup script once installation finished.
pub const SENTINEL_PATH: &str = "/root/installed_lerobot";

/// Where the training script is uploaded.
pub const REMOTE_SCRIPT_PATH: &str = "/root/train.sh";

/// Where the training script's output goes.
pub const REMOTE_LOG_PATH: &str = "/root/training.log";

/// Detached launch of the uploaded script, output to [`REMOTE_LOG_PATH`].
/// Stdin is detached too so the background job cannot hold the channel open.
pub const LAUNCH_COMMAND: &str = "cd /root && nohup ./train.sh > training.log 2>&1 < /dev/null &";

/// Hostname given to created instances.
pub const INSTANCE_HOSTNAME: &str = "lerobot-training";

/// Description given to created instances.
pub const INSTANCE_DESCRIPTION: &str = "LeRobot training instance";

const SENTINEL_READY: &str = "ready";

/// Workflow errors. Every variant is fatal for the run.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// No catalog entry satisfies the criteria.
    #[error("No suitable instance found with {gpu} GPU under ${price_cap}/hour")]
    NoSuitableInstance { gpu: String, price_cap: f64 },

    /// Every candidate location rejected the request.
    #[error("Failed to create instance in all locations ({})", .0.join(", "))]
    NoLocationAvailable(Vec<String>),

    /// The tracked instance disappeared from the provider's list.
    #[error("Instance {0} not found")]
    InstanceNotFound(String),

    /// A polling stage ran out of time.
    #[error("Timed out after {secs}s waiting for {stage}")]
    Timeout { stage: &'static str, secs: u64 },

    /// A step ran before the resource it needs existed.
    #[error("No {0} available yet")]
    NotProvisioned(&'static str),

    /// Provider call failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Remote session failed.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Workflow states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing done yet.
    Init,
    /// Choosing an instance type.
    Selecting,
    /// Creating the startup script and the instance.
    Creating,
    /// Waiting for `running` with an address.
    WaitingReady,
    /// Waiting for the install sentinel.
    Installing,
    /// Uploading and launching the training script.
    RunningScript,
    /// Training launched.
    Done,
    /// Deleting created resources.
    Cleanup,
    /// Run ended without launching training.
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Selecting => "selecting",
            Self::Creating => "creating",
            Self::WaitingReady => "waiting_ready",
            Self::Installing => "installing",
            Self::RunningScript => "running_script",
            Self::Done => "done",
            Self::Cleanup => "cleanup",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The two script templates a run needs.
#[derive(Debug, Clone)]
pub struct ScriptTemplates {
    /// Startup script, placeholders `HUGGINGFACE_TOKEN` and `WANDB_TOKEN`.
    pub install: Template,
    /// Training script, placeholders `DATACRUNCH_CLIENT_ID`,
    /// `DATACRUNCH_CLIENT_SECRET` and `INSTANCE_ID`.
    pub train: Template,
}

impl ScriptTemplates {
    /// Load both templates from the configured paths.
    ///
    /// # Errors
    /// Returns an error if either file cannot be read.
    pub fn load(config: &Config) -> Result<Self, TemplateError> {
        Ok(Self {
            install: Template::load(&config.install_script)?,
            train: Template::load(&config.train_script)?,
        })
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSummary {
    /// Created instance.
    pub instance_id: String,
    /// Its address.
    pub ip: String,
    /// Chosen instance type.
    pub instance_type: InstanceType,
}

/// How [`Launcher::run_interruptible`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Training launched.
    Completed(LaunchSummary),
    /// The interrupt signal arrived first.
    Interrupted {
        /// Whether the user asked for, and got, a cleanup.
        cleaned_up: bool,
    },
}

/// Drives one provisioning run.
pub struct Launcher<'a, P: ?Sized, R: ?Sized> {
    provider: &'a P,
    remote: &'a R,
    config: &'a Config,
    templates: ScriptTemplates,
    session: Session,
    state: RunState,
}

impl<'a, P, R> Launcher<'a, P, R>
where
    P: SpotProvider + ?Sized,
    R: RemoteShell + ?Sized,
{
    /// Create a launcher for one run.
    #[must_use]
    pub fn new(provider: &'a P, remote: &'a R, config: &'a Config, templates: ScriptTemplates) -> Self {
        Self {
            provider,
            remote,
            config,
            templates,
            session: Session::new(),
            state: RunState::Init,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Resources tracked so far.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "State transition");
        self.state = next;
    }

    /// Run the whole workflow. On error, created resources are deleted
    /// before the error is returned.
    ///
    /// # Errors
    /// Returns the error that stopped the run.
    pub async fn run(&mut self) -> Result<LaunchSummary, LaunchError> {
        match self.run_steps().await {
            Ok(summary) => {
                self.transition(RunState::Done);
                Ok(summary)
            }
            Err(e) => {
                error!(state = %self.state, error = %e, "Provisioning failed");
                self.transition(RunState::Cleanup);
                self.session.cleanup(self.provider).await;
                self.transition(RunState::Failed);
                Err(e)
            }
        }
    }

    async fn run_steps(&mut self) -> Result<LaunchSummary, LaunchError> {
        self.transition(RunState::Selecting);
        let instance_type = self.select_instance_type().await?;

        self.transition(RunState::Creating);
        let instance_id = self.create_instance(&instance_type).await?;

        self.transition(RunState::WaitingReady);
        let ip = self.wait_until_ready().await?;

        self.transition(RunState::Installing);
        self.wait_for_install().await?;

        self.transition(RunState::RunningScript);
        self.start_training().await?;

        Ok(LaunchSummary {
            instance_id,
            ip,
            instance_type,
        })
    }

    /// Run the workflow until it finishes or `interrupt` resolves.
    ///
    /// On interrupt the workflow is abandoned where it stands and `confirm`
    /// decides whether to delete what was created.
    ///
    /// # Errors
    /// Returns the workflow error if it failed before any interrupt.
    pub async fn run_interruptible<S, C>(
        &mut self,
        interrupt: S,
        confirm: C,
    ) -> Result<Outcome, LaunchError>
    where
        S: Future<Output = ()>,
        C: FnOnce() -> bool,
    {
        let finished = {
            let run = self.run();
            tokio::pin!(run);
            tokio::select! {
                result = &mut run => Some(result),
                () = interrupt => None,
            }
        };

        if let Some(result) = finished {
            return result.map(Outcome::Completed);
        }

        info!(state = %self.state, "Interrupted by user");
        if !confirm() {
            return Ok(Outcome::Interrupted { cleaned_up: false });
        }

        self.transition(RunState::Cleanup);
        self.session.cleanup(self.provider).await;
        self.transition(RunState::Failed);
        Ok(Outcome::Interrupted { cleaned_up: true })
    }

    /// Pick the first catalog entry matching the configured GPU and price cap.
    ///
    /// # Errors
    /// Returns [`LaunchError::NoSuitableInstance`] when nothing matches.
    pub async fn select_instance_type(&mut self) -> Result<InstanceType, LaunchError> {
        let catalog = self.provider.list_instance_types().await?;
        let criteria = Criteria::new(self.config.required_gpu.clone(), self.config.price_cap);

        let Some(chosen) = first_match(&catalog, &criteria) else {
            warn!(
                gpu = %self.config.required_gpu,
                price_cap = self.config.price_cap,
                "No suitable instance type found"
            );
            return Err(LaunchError::NoSuitableInstance {
                gpu: self.config.required_gpu.clone(),
                price_cap: self.config.price_cap,
            });
        };

        info!(
            instance_type = %chosen.name,
            gpu = %chosen.gpu_description,
            spot_price = chosen.spot_price_per_hour,
            "Found suitable instance"
        );
        Ok(chosen.clone())
    }

    /// Store the startup script and create the instance, trying each
    /// configured location in order.
    ///
    /// If no instance gets created the startup script is deleted again.
    ///
    /// # Errors
    /// Returns [`LaunchError::NoLocationAvailable`] if every location
    /// rejected the request, or the first non-rejection error.
    pub async fn create_instance(&mut self, instance_type: &InstanceType) -> Result<String, LaunchError> {
        let script = self.templates.install.render(&[
            ("HUGGINGFACE_TOKEN", self.config.huggingface_token.as_str()),
            ("WANDB_TOKEN", self.config.wandb_token.as_str()),
        ]);

        let name = format!("lerobot-install-{}", chrono::Utc::now().timestamp());
        let startup_script = self.provider.create_startup_script(&name, &script).await?;
        self.session.track_startup_script(startup_script.id.clone());

        match self.create_in_any_location(instance_type, &startup_script.id).await {
            Ok(id) => {
                self.session.track_instance(id.clone());
                info!(instance_id = %id, "Instance created");
                Ok(id)
            }
            Err(e) => {
                if let Some(script_id) = self.session.forget_startup_script() {
                    match self.provider.delete_startup_script(&script_id).await {
                        Ok(()) => info!("Cleaned up startup script after failed instance creation"),
                        Err(cleanup_err) => {
                            debug!(error = %cleanup_err, "Startup script cleanup failed");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn create_in_any_location(
        &self,
        instance_type: &InstanceType,
        startup_script_id: &str,
    ) -> Result<String, LaunchError> {
        let ssh_key_ids = self
            .provider
            .list_ssh_keys()
            .await?
            .into_iter()
            .map(|k| k.id)
            .collect::<Vec<_>>();

        info!(instance_type = %instance_type.name, "Creating instance");
        for location in &self.config.locations {
            debug!(location = %location, "Trying location");
            let req = CreateInstanceRequest {
                instance_type: instance_type.name.clone(),
                image: self.config.image.clone(),
                ssh_key_ids: ssh_key_ids.clone(),
                hostname: INSTANCE_HOSTNAME.to_string(),
                description: INSTANCE_DESCRIPTION.to_string(),
                is_spot: true,
                startup_script_id: Some(startup_script_id.to_string()),
                location: location.clone(),
            };

            match self.provider.create_instance(&req).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_rejection() => {
                    debug!(location = %location, error = %e, "Failed to create instance in location");
                }
                Err(e) => return Err(e.into()),
            }
        }

        error!("Failed to create instance in all locations");
        Err(LaunchError::NoLocationAvailable(self.config.locations.clone()))
    }

    /// Poll until the tracked instance is `running` and has an address.
    ///
    /// # Errors
    /// Returns [`LaunchError::Timeout`] after the ready timeout, or
    /// [`LaunchError::InstanceNotFound`] if the instance vanished.
    pub async fn wait_until_ready(&mut self) -> Result<String, LaunchError> {
        let id = self
            .session
            .instance_id()
            .ok_or(LaunchError::NotProvisioned("instance"))?
            .to_string();
        let timeout = self.config.poll.ready_timeout;
        let start = Instant::now();

        loop {
            match self.provider.list_instances().await {
                Ok(instances) => {
                    let instance = instances
                        .iter()
                        .find(|i| i.id == id)
                        .ok_or_else(|| LaunchError::InstanceNotFound(id.clone()))?;

                    if instance.status == InstanceStatus::Running {
                        if let Some(ip) = instance.address() {
                            info!(instance_id = %id, ip = %ip, "Instance ready");
                            let ip = ip.to_string();
                            self.session.set_instance_ip(ip.clone());
                            return Ok(ip);
                        }
                    }
                    info!(
                        instance_id = %id,
                        status = %instance.status,
                        elapsed_secs = start.elapsed().as_secs(),
                        "Instance not ready, waiting"
                    );
                }
                Err(e) => warn!(error = %e, "Error checking instance status"),
            }

            if start.elapsed() >= timeout {
                error!(instance_id = %id, "Timeout waiting for instance to be ready");
                return Err(LaunchError::Timeout {
                    stage: "instance to become ready",
                    secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.config.poll.interval).await;
        }
    }

    /// Poll over SSH until the install sentinel exists.
    ///
    /// A fresh connection is opened for every check. Authentication failures
    /// end the wait immediately; other connection errors are retried.
    ///
    /// # Errors
    /// Returns the authentication error, or [`LaunchError::Timeout`].
    pub async fn wait_for_install(&mut self) -> Result<(), LaunchError> {
        let ip = self
            .session
            .instance_ip()
            .ok_or(LaunchError::NotProvisioned("instance address"))?
            .to_string();
        let timeout = self.config.poll.install_timeout;
        let start = Instant::now();
        let check = format!("test -f {SENTINEL_PATH} && echo \"{SENTINEL_READY}\"");

        loop {
            match self.remote.run(&ip, vec![RemoteStep::Exec(check.clone())]).await {
                Ok(outputs) => {
                    if outputs.first().is_some_and(|o| o.trim() == SENTINEL_READY) {
                        info!(ip = %ip, "Installation completed");
                        return Ok(());
                    }
                    info!(
                        ip = %ip,
                        elapsed_secs = start.elapsed().as_secs(),
                        "Waiting for installation to complete"
                    );
                }
                Err(e) if e.is_authentication() => {
                    error!(
                        error = %e,
                        "SSH authentication failed, check the key is registered with the provider"
                    );
                    return Err(e.into());
                }
                Err(e) => debug!(error = %e, "SSH connection attempt failed"),
            }

            if start.elapsed() >= timeout {
                error!(ip = %ip, "Timeout waiting for installation");
                return Err(LaunchError::Timeout {
                    stage: "installation",
                    secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.config.poll.interval).await;
        }
    }

    /// Upload the training script and launch it in the background.
    ///
    /// Returns once the launch command was issued; the script is not
    /// watched.
    ///
    /// # Errors
    /// Returns an error if the session, upload or launch fails.
    pub async fn start_training(&mut self) -> Result<(), LaunchError> {
        let ip = self
            .session
            .instance_ip()
            .ok_or(LaunchError::NotProvisioned("instance address"))?
            .to_string();
        let instance_id = self
            .session
            .instance_id()
            .ok_or(LaunchError::NotProvisioned("instance"))?
            .to_string();

        let script = self.templates.train.render(&[
            ("DATACRUNCH_CLIENT_ID", self.config.credentials.client_id.as_str()),
            ("DATACRUNCH_CLIENT_SECRET", self.config.credentials.client_secret.as_str()),
            ("INSTANCE_ID", instance_id.as_str()),
        ]);

        info!(ip = %ip, "Starting training script");
        self.remote
            .run(
                &ip,
                vec![
                    RemoteStep::Upload {
                        path: REMOTE_SCRIPT_PATH.to_string(),
                        contents: script,
                    },
                    RemoteStep::Exec(format!("chmod +x {REMOTE_SCRIPT_PATH}")),
                    RemoteStep::Spawn(LAUNCH_COMMAND.to_string()),
                ],
            )
            .await?;

        info!("Training script started, check instance logs for progress");
        Ok(())
    }

    /// Delete everything the run created. Safe to call repeatedly.
    pub async fn cleanup(&mut self) {
        self.session.cleanup(self.provider).await;
    }
}
