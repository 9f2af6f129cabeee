//! Spot provider trait and common types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API rejected the request.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Token exchange failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Response parsed but carried unusable data.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether the provider answered with an error response, as opposed to
    /// the request never completing or the answer being unusable.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Api { .. } | Self::NotFound(_))
    }
}

/// Instance lifecycle status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Order accepted, nothing allocated yet.
    Ordered,
    /// Instance record created.
    New,
    /// Hardware is being allocated.
    Provisioning,
    /// Provider is validating the order.
    Validating,
    /// Instance is booted.
    Running,
    /// Instance is powered off.
    Offline,
    /// Instance is being deleted.
    Deleting,
    /// Instance was discontinued.
    Discontinued,
    /// No capacity at the requested location.
    NoCapacity,
    /// Provisioning failed.
    Error,
    /// Provider lost track of the instance.
    #[serde(rename = "notfound")]
    NotFound,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    /// Statuses that precede `running` in a normal boot.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::Ordered | Self::New | Self::Provisioning | Self::Validating
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ordered => write!(f, "ordered"),
            Self::New => write!(f, "new"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Validating => write!(f, "validating"),
            Self::Running => write!(f, "running"),
            Self::Offline => write!(f, "offline"),
            Self::Deleting => write!(f, "deleting"),
            Self::Discontinued => write!(f, "discontinued"),
            Self::NoCapacity => write!(f, "no_capacity"),
            Self::Error => write!(f, "error"),
            Self::NotFound => write!(f, "notfound"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// An entry of the provider's instance type catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    /// Instance type name (e.g., "1H100.80S.30V").
    pub name: String,
    /// GPU description (e.g., "1x H100 SXM5 80GB").
    pub gpu_description: String,
    /// Number of GPUs.
    pub gpu_count: u32,
    /// Number of CPU cores.
    pub cpu_cores: u32,
    /// Spot price in USD per hour.
    pub spot_price_per_hour: f64,
    /// On-demand price in USD per hour.
    pub price_per_hour: f64,
}

/// A provisioned instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique instance identifier.
    pub id: String,
    /// Hostname given at creation.
    pub hostname: String,
    /// Instance type name.
    pub instance_type: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Public IP address, once assigned.
    pub ip: Option<String>,
    /// Datacenter location code.
    pub location: Option<String>,
    /// Whether this is a spot instance.
    pub is_spot: bool,
}

impl Instance {
    /// Address to connect to, ignoring blank values.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty())
    }
}

/// A startup script stored with the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupScript {
    /// Script identifier.
    pub id: String,
    /// Script name.
    pub name: String,
}

/// An SSH public key registered with the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    /// Key identifier.
    pub id: String,
    /// Key name.
    pub name: String,
}

/// Account balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Remaining credit.
    pub amount: f64,
    /// Currency code.
    pub currency: String,
}

/// Request to create a new instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    /// Instance type name.
    pub instance_type: String,
    /// OS image name.
    pub image: String,
    /// SSH key IDs to install.
    pub ssh_key_ids: Vec<String>,
    /// Hostname.
    pub hostname: String,
    /// Free-form description.
    pub description: String,
    /// Request a spot instance.
    pub is_spot: bool,
    /// Startup script to run on first boot.
    pub startup_script_id: Option<String>,
    /// Datacenter location code.
    pub location: String,
}

/// Trait for spot instance providers.
#[async_trait]
pub trait SpotProvider: Send + Sync {
    /// List the instance type catalog, in provider order.
    async fn list_instance_types(&self) -> Result<Vec<InstanceType>, ProviderError>;

    /// List all instances of the account.
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError>;

    /// List SSH keys registered with the account.
    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>, ProviderError>;

    /// Store a startup script.
    async fn create_startup_script(
        &self,
        name: &str,
        script: &str,
    ) -> Result<StartupScript, ProviderError>;

    /// Delete a stored startup script.
    async fn delete_startup_script(&self, id: &str) -> Result<(), ProviderError>;

    /// Create an instance, returning its identifier.
    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<String, ProviderError>;

    /// Request deletion of an instance.
    async fn delete_instance(&self, id: &str) -> Result<(), ProviderError>;

    /// Get the account balance.
    async fn balance(&self) -> Result<Balance, ProviderError>;
}
