//! Spot provider implementations.
//!
//! This module contains the [`SpotProvider`] trait and the `DataCrunch`
//! implementation used by the launcher.

pub mod datacrunch;
pub mod traits;

pub use traits::{
    Balance, CreateInstanceRequest, Instance, InstanceStatus, InstanceType, ProviderError,
    SpotProvider, SshKey, StartupScript,
};
