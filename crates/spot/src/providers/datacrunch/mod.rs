//! `DataCrunch` spot instance provider.
//!
//! Implements the [`SpotProvider`](crate::providers::SpotProvider) trait on top
//! of the `DataCrunch` public REST API (v1). Authentication uses the OAuth2
//! client-credentials grant; the bearer token is refreshed when it expires.
//!
//! ## Example
//!
//! ```ignore
//! use spot::providers::datacrunch::DataCrunch;
//! use spot::providers::SpotProvider;
//!
//! let provider = DataCrunch::new(client_id, client_secret)?;
//! let catalog = provider.list_instance_types().await?;
//! ```

mod client;
mod models;

pub use client::{DataCrunch, API_BASE_URL};
pub use models::*;
