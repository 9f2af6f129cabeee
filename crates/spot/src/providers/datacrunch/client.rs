//! `DataCrunch` API client implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::{
    ApiErrorBody, BalanceResource, CreateInstanceBody, CreateScriptBody, InstanceActionBody,
    InstanceResource, InstanceTypeResource, SshKeyResource, TokenRequest, TokenResponse,
};
use crate::providers::traits::{
    Balance, CreateInstanceRequest, Instance, InstanceStatus, InstanceType, ProviderError,
    SpotProvider, SshKey, StartupScript,
};

/// Base URL for the `DataCrunch` API.
pub const API_BASE_URL: &str = "https://api.datacrunch.io/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Tokens are renewed this long before they actually expire.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now()
            .checked_add(Duration::from_secs(TOKEN_EXPIRY_MARGIN_SECS))
            .is_some_and(|deadline| deadline < self.expires_at)
    }
}

/// `DataCrunch` spot instance provider.
#[derive(Clone)]
pub struct DataCrunch {
    /// HTTP client.
    client: Client,
    /// API root, without trailing slash.
    base_url: String,
    /// OAuth2 client ID.
    client_id: String,
    /// OAuth2 client secret.
    client_secret: String,
    /// Current bearer token.
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl DataCrunch {
    /// Create a new `DataCrunch` provider against the public API.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Self::with_base_url(client_id, client_secret, API_BASE_URL)
    }

    /// Create a provider against a custom API root.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_url(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Arc::new(Mutex::new(None)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Return a valid bearer token, exchanging credentials when needed.
    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        debug!("Requesting new access token");
        let body = TokenRequest {
            grant_type: "client_credentials".to_string(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        };
        let response = self
            .client
            .post(self.url("/oauth2/token"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::Auth(format!(
                "{} - {}",
                status.as_u16(),
                error_message(&text)
            )));
        }

        let token: TokenResponse = serde_json::from_str(&text)?;
        let access_token = token.access_token.clone();
        *guard = match Instant::now().checked_add(Duration::from_secs(token.expires_in)) {
            Some(expires_at) => Some(CachedToken {
                access_token: token.access_token,
                expires_at,
            }),
            None => {
                warn!(expires_in = token.expires_in, "Token lifetime out of range, not caching");
                None
            }
        };
        Ok(access_token)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let token = self.access_token().await?;
        Ok(request.bearer_auth(token).send().await?)
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");

        let response = self.authorized(self.client.get(&url)).await?;
        let text = Self::check_response(response).await?;

        serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, body = %text, "Failed to parse response");
            ProviderError::Serialization(e)
        })
    }

    /// Make an authenticated POST request whose response body is a bare ID.
    async fn post_for_id<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<String, ProviderError> {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self.authorized(self.client.post(&url).json(body)).await?;
        let text = Self::check_response(response).await?;
        parse_id(&text)
    }

    /// Make an authenticated PUT request that returns empty body.
    async fn put_empty<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<(), ProviderError> {
        let url = self.url(path);
        debug!(url = %url, "PUT request (empty response)");

        let response = self.authorized(self.client.put(&url).json(body)).await?;
        Self::check_response(response).await.map(|_| ())
    }

    /// Make an authenticated DELETE request.
    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let url = self.url(path);
        debug!(url = %url, "DELETE request");

        let response = self.authorized(self.client.delete(&url)).await?;
        Self::check_response(response).await.map(|_| ())
    }

    /// Return the response body on success, or the matching error.
    async fn check_response(response: reqwest::Response) -> Result<String, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            Ok(text)
        } else if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(error_message(&text)))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: error_message(&text),
            })
        }
    }

    /// Convert API instance type resource to our `InstanceType`.
    fn to_instance_type(resource: &InstanceTypeResource) -> Result<InstanceType, ProviderError> {
        let invalid = |reason: String| {
            ProviderError::InvalidResponse(format!("{}: {reason}", resource.instance_type))
        };

        let gpu = resource.gpu.clone().unwrap_or_default();
        let cpu = resource.cpu.clone().unwrap_or_default();

        Ok(InstanceType {
            name: resource.instance_type.clone(),
            gpu_description: gpu.description.unwrap_or_default(),
            gpu_count: gpu.number_of_gpus.unwrap_or(0),
            cpu_cores: cpu.number_of_cores.unwrap_or(0),
            spot_price_per_hour: resource.spot_price.to_f64().map_err(invalid)?,
            price_per_hour: resource.price_per_hour.to_f64().map_err(invalid)?,
        })
    }

    /// Convert API instance resource to our `Instance`.
    fn to_instance(resource: &InstanceResource) -> Instance {
        let status = serde_json::from_value(serde_json::Value::String(resource.status.clone()))
            .unwrap_or(InstanceStatus::Unknown);

        Instance {
            id: resource.id.clone(),
            hostname: resource.hostname.clone().unwrap_or_default(),
            instance_type: resource.instance_type.clone().unwrap_or_default(),
            status,
            ip: resource.ip.clone(),
            location: resource.location.clone(),
            is_spot: resource.is_spot.unwrap_or(false),
        }
    }
}

/// Extract a readable message from an error body.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(ApiErrorBody {
            code: Some(code),
            message: Some(message),
        }) => format!("{code}: {message}"),
        Ok(ApiErrorBody {
            message: Some(message),
            ..
        }) => message,
        _ => body.trim().to_string(),
    }
}

/// Parse an identifier returned as plain text or as a JSON string.
fn parse_id(body: &str) -> Result<String, ProviderError> {
    let id = body.trim().trim_matches('"').trim();
    if id.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "empty identifier in response".to_string(),
        ));
    }
    Ok(id.to_string())
}

#[async_trait]
impl SpotProvider for DataCrunch {
    async fn list_instance_types(&self) -> Result<Vec<InstanceType>, ProviderError> {
        let resources: Vec<InstanceTypeResource> = self.get("/instance-types").await?;
        resources.iter().map(Self::to_instance_type).collect()
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let resources: Vec<InstanceResource> = self.get("/instances").await?;
        Ok(resources.iter().map(Self::to_instance).collect())
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>, ProviderError> {
        let resources: Vec<SshKeyResource> = self.get("/sshkeys").await?;
        Ok(resources
            .into_iter()
            .map(|k| SshKey {
                id: k.id,
                name: k.name,
            })
            .collect())
    }

    async fn create_startup_script(
        &self,
        name: &str,
        script: &str,
    ) -> Result<StartupScript, ProviderError> {
        info!(name = %name, "Creating startup script");

        let body = CreateScriptBody {
            name: name.to_string(),
            script: script.to_string(),
        };
        let id = self.post_for_id("/scripts", &body).await?;

        info!(script_id = %id, "Startup script created");
        Ok(StartupScript {
            id,
            name: name.to_string(),
        })
    }

    async fn delete_startup_script(&self, id: &str) -> Result<(), ProviderError> {
        info!(script_id = %id, "Deleting startup script");
        match self.delete(&format!("/scripts/{id}")).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<String, ProviderError> {
        info!(
            instance_type = %req.instance_type,
            location = %req.location,
            "Creating instance"
        );

        let body = CreateInstanceBody {
            instance_type: req.instance_type.clone(),
            image: req.image.clone(),
            ssh_key_ids: req.ssh_key_ids.clone(),
            hostname: req.hostname.clone(),
            description: req.description.clone(),
            is_spot: req.is_spot,
            startup_script_id: req.startup_script_id.clone(),
            location_code: req.location.clone(),
        };
        let id = self.post_for_id("/instances", &body).await?;

        info!(instance_id = %id, "Instance created");
        Ok(id)
    }

    async fn delete_instance(&self, id: &str) -> Result<(), ProviderError> {
        info!(instance_id = %id, "Deleting instance");

        let body = InstanceActionBody {
            action: "delete".to_string(),
            id: id.to_string(),
        };
        match self.put_empty("/instances", &body).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn balance(&self) -> Result<Balance, ProviderError> {
        let resource: BalanceResource = self.get("/balance").await?;
        Ok(Balance {
            amount: resource.amount,
            currency: resource.currency,
        })
    }
}
