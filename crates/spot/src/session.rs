//! Resources created during one provisioning run.

use tracing::{error, info};

use crate::providers::SpotProvider;

/// Identifiers of provider resources owned by the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    instance_id: Option<String>,
    startup_script_id: Option<String>,
    instance_ip: Option<String>,
}

impl Session {
    /// Empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracked instance, if any.
    #[must_use]
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Tracked startup script, if any.
    #[must_use]
    pub fn startup_script_id(&self) -> Option<&str> {
        self.startup_script_id.as_deref()
    }

    /// Address of the tracked instance, once known.
    #[must_use]
    pub fn instance_ip(&self) -> Option<&str> {
        self.instance_ip.as_deref()
    }

    pub(crate) fn track_instance(&mut self, id: impl Into<String>) {
        self.instance_id = Some(id.into());
    }

    pub(crate) fn track_startup_script(&mut self, id: impl Into<String>) {
        self.startup_script_id = Some(id.into());
    }

    pub(crate) fn forget_startup_script(&mut self) -> Option<String> {
        self.startup_script_id.take()
    }

    pub(crate) fn set_instance_ip(&mut self, ip: impl Into<String>) {
        self.instance_ip = Some(ip.into());
    }

    /// Whether anything would be deleted by [`Session::cleanup`].
    #[must_use]
    pub fn has_resources(&self) -> bool {
        self.instance_id.is_some() || self.startup_script_id.is_some()
    }

    /// Delete the tracked instance and startup script.
    ///
    /// Best effort: each deletion is attempted independently and failures
    /// are only logged. An identifier is released once its delete call has
    /// returned, so calling this again does nothing. If the future is dropped
    /// mid-call, the identifier stays tracked for the next attempt.
    pub async fn cleanup<P>(&mut self, provider: &P)
    where
        P: SpotProvider + ?Sized,
    {
        if let Some(id) = self.instance_id.clone() {
            match provider.delete_instance(&id).await {
                Ok(()) => info!(instance_id = %id, "Instance deletion requested"),
                Err(e) => error!(instance_id = %id, error = %e, "Failed to delete instance"),
            }
            self.instance_id = None;
        }

        if let Some(id) = self.startup_script_id.clone() {
            match provider.delete_startup_script(&id).await {
                Ok(()) => info!(script_id = %id, "Startup script deleted"),
                Err(e) => error!(script_id = %id, error = %e, "Failed to delete startup script"),
            }
            self.startup_script_id = None;
        }

        self.instance_ip = None;
    }
}
