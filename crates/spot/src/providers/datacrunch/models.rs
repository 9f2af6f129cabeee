//! `DataCrunch` API models.
//!
//! Wire types only. Conversion into the provider-neutral types happens in the
//! client, where malformed values are rejected.

use serde::{Deserialize, Serialize};

// ============================================================================
// Authentication
// ============================================================================

/// OAuth2 client-credentials token request.
#[derive(Debug, Serialize)]
pub struct TokenRequest {
    /// Always `client_credentials`.
    pub grant_type: String,
    /// Client ID.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
}

/// OAuth2 token response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Bearer token.
    pub access_token: String,
    /// Refresh token (unused, tokens are re-issued from credentials).
    pub refresh_token: Option<String>,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    /// Token type, `Bearer`.
    pub token_type: Option<String>,
}

// ============================================================================
// Instance types
// ============================================================================

/// A price as sent by the API, either a JSON number or a decimal string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PriceValue {
    /// Numeric price.
    Number(f64),
    /// Decimal string price (e.g., "1.99").
    Text(String),
}

impl PriceValue {
    /// Parse into a finite, non-negative `f64`.
    ///
    /// # Errors
    /// Returns a description of the bad value.
    pub fn to_f64(&self) -> Result<f64, String> {
        let value = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("invalid price {s:?}: {e}"))?,
        };
        if value.is_finite() && value >= 0.0 {
            Ok(value)
        } else {
            Err(format!("price out of range: {value}"))
        }
    }
}

/// CPU or GPU block of an instance type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HardwareSpec {
    /// Human readable description (e.g., "1x H100 SXM5 80GB").
    pub description: Option<String>,
    /// Number of CPU cores (CPU block only).
    pub number_of_cores: Option<u32>,
    /// Number of GPUs (GPU block only).
    pub number_of_gpus: Option<u32>,
}

/// Instance type resource from `GET /instance-types`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceTypeResource {
    /// Catalog ID.
    pub id: Option<String>,
    /// Instance type name.
    pub instance_type: String,
    /// On-demand hourly price.
    pub price_per_hour: PriceValue,
    /// Spot hourly price.
    pub spot_price: PriceValue,
    /// Description.
    pub description: Option<String>,
    /// CPU block.
    #[serde(default)]
    pub cpu: Option<HardwareSpec>,
    /// GPU block.
    #[serde(default)]
    pub gpu: Option<HardwareSpec>,
}

// ============================================================================
// Instances
// ============================================================================

/// Instance resource from `GET /instances`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceResource {
    /// Instance ID.
    pub id: String,
    /// Instance type name.
    pub instance_type: Option<String>,
    /// Hostname.
    pub hostname: Option<String>,
    /// Status string.
    pub status: String,
    /// Public IP, null until assigned.
    pub ip: Option<String>,
    /// Location code.
    pub location: Option<String>,
    /// Spot flag.
    pub is_spot: Option<bool>,
}

/// Request body for `POST /instances`.
#[derive(Debug, Serialize)]
pub struct CreateInstanceBody {
    /// Instance type name.
    pub instance_type: String,
    /// OS image.
    pub image: String,
    /// SSH key IDs.
    pub ssh_key_ids: Vec<String>,
    /// Hostname.
    pub hostname: String,
    /// Description.
    pub description: String,
    /// Spot flag.
    pub is_spot: bool,
    /// Startup script ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_script_id: Option<String>,
    /// Location code.
    pub location_code: String,
}

/// Request body for `PUT /instances`.
#[derive(Debug, Serialize)]
pub struct InstanceActionBody {
    /// Action: `delete`, `shutdown`, `boot`, ...
    pub action: String,
    /// Instance ID.
    pub id: String,
}

// ============================================================================
// SSH keys, startup scripts, balance
// ============================================================================

/// SSH key resource from `GET /sshkeys`.
#[derive(Debug, Clone, Deserialize)]
pub struct SshKeyResource {
    /// Key ID.
    pub id: String,
    /// Key name.
    pub name: String,
    /// Public key text.
    pub key: Option<String>,
}

/// Request body for `POST /scripts`.
#[derive(Debug, Serialize)]
pub struct CreateScriptBody {
    /// Script name.
    pub name: String,
    /// Script content.
    pub script: String,
}

/// Balance resource from `GET /balance`.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResource {
    /// Remaining amount.
    pub amount: f64,
    /// Currency code.
    pub currency: String,
}

/// Error body returned by the API on rejected requests.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    /// Machine readable code.
    pub code: Option<String>,
    /// Human readable message.
    pub message: Option<String>,
}
