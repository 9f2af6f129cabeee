//! Scripted provider and shell fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use spot::config::{Config, PollSettings};
use spot::launcher::ScriptTemplates;
use spot::providers::{
    Balance, CreateInstanceRequest, Instance, InstanceStatus, InstanceType, ProviderError,
    SpotProvider, SshKey, StartupScript,
};
use spot::remote::{RemoteError, RemoteShell, RemoteStep};
use spot::template::Template;

// =============================================================================
// Fixtures
// =============================================================================

pub fn instance_type(name: &str, gpu: &str, spot_price: f64) -> InstanceType {
    InstanceType {
        name: name.to_string(),
        gpu_description: gpu.to_string(),
        gpu_count: 1,
        cpu_cores: 30,
        spot_price_per_hour: spot_price,
        price_per_hour: spot_price * 3.0,
    }
}

pub fn instance(id: &str, status: InstanceStatus, ip: Option<&str>) -> Instance {
    Instance {
        id: id.to_string(),
        hostname: "lerobot-training".to_string(),
        instance_type: "1H100.80S.30V".to_string(),
        status,
        ip: ip.map(ToString::to_string),
        location: Some("FIN-01".to_string()),
        is_spot: true,
    }
}

/// Configuration with fast polling.
pub fn test_config() -> Config {
    let vars: HashMap<&str, &str> = [
        ("DATACRUNCH_CLIENT_ID", "client-id"),
        ("DATACRUNCH_CLIENT_SECRET", "client-secret"),
        ("HUGGINGFACE_TOKEN", "hf-token"),
        ("WANDB_TOKEN", "wandb-token"),
    ]
    .into_iter()
    .collect();
    let mut config =
        Config::from_lookup(|name| vars.get(name).map(ToString::to_string), None).unwrap();
    config.poll = PollSettings {
        interval: Duration::from_millis(1),
        ready_timeout: Duration::from_millis(200),
        install_timeout: Duration::from_millis(200),
    };
    config
}

pub fn test_templates() -> ScriptTemplates {
    ScriptTemplates {
        install: Template::new("hf=${HUGGINGFACE_TOKEN} wandb=${WANDB_TOKEN}"),
        train: Template::new(
            "id=${DATACRUNCH_CLIENT_ID} secret=${DATACRUNCH_CLIENT_SECRET} instance=${INSTANCE_ID}",
        ),
    }
}

// =============================================================================
// Fake provider
// =============================================================================

/// Provider calls in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListInstanceTypes,
    ListInstances,
    ListSshKeys,
    CreateScript { name: String, script: String },
    DeleteScript(String),
    CreateInstance { location: String, script_id: Option<String> },
    DeleteInstance(String),
    Balance,
}

/// Scripted result of one `create_instance` call.
#[derive(Debug, Clone)]
pub enum Create {
    Created(String),
    /// HTTP error response, e.g. no capacity.
    Rejected,
    /// Not an HTTP response at all.
    Broken,
}

/// Scripted result of one `list_instances` call.
#[derive(Debug, Clone)]
pub enum Listing {
    Instances(Vec<Instance>),
    Failed,
}

#[derive(Default)]
pub struct FakeProvider {
    pub catalog: Vec<InstanceType>,
    pub creates: Mutex<VecDeque<Create>>,
    /// Popped per call; the last entry repeats.
    pub listings: Mutex<VecDeque<Listing>>,
    pub fail_instance_delete: bool,
    pub fail_script_delete: bool,
    /// Instance deletions take this long and are recorded once they finish.
    pub instance_delete_delay: Option<Duration>,
    pub calls: Mutex<Vec<Call>>,
}

impl FakeProvider {
    pub fn with_catalog(catalog: Vec<InstanceType>) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    pub fn creating(self, creates: Vec<Create>) -> Self {
        *self.creates.lock().unwrap() = creates.into();
        self
    }

    pub fn listing(self, listings: Vec<Listing>) -> Self {
        *self.listings.lock().unwrap() = listings.into();
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deletions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::DeleteInstance(_) | Call::DeleteScript(_)))
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SpotProvider for FakeProvider {
    async fn list_instance_types(&self) -> Result<Vec<InstanceType>, ProviderError> {
        self.record(Call::ListInstanceTypes);
        Ok(self.catalog.clone())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        self.record(Call::ListInstances);
        let listing = {
            let mut listings = self.listings.lock().unwrap();
            if listings.len() > 1 {
                listings.pop_front()
            } else {
                listings.front().cloned()
            }
        };
        match listing {
            Some(Listing::Instances(instances)) => Ok(instances),
            Some(Listing::Failed) => Err(ProviderError::Api {
                status: 503,
                message: "unavailable".to_string(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>, ProviderError> {
        self.record(Call::ListSshKeys);
        Ok(vec![SshKey {
            id: "key-1".to_string(),
            name: "laptop".to_string(),
        }])
    }

    async fn create_startup_script(
        &self,
        name: &str,
        script: &str,
    ) -> Result<StartupScript, ProviderError> {
        self.record(Call::CreateScript {
            name: name.to_string(),
            script: script.to_string(),
        });
        Ok(StartupScript {
            id: "script-1".to_string(),
            name: name.to_string(),
        })
    }

    async fn delete_startup_script(&self, id: &str) -> Result<(), ProviderError> {
        self.record(Call::DeleteScript(id.to_string()));
        if self.fail_script_delete {
            return Err(ProviderError::Api {
                status: 500,
                message: "boom".to_string(),
            });
        }
        Ok(())
    }

    async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<String, ProviderError> {
        self.record(Call::CreateInstance {
            location: req.location.clone(),
            script_id: req.startup_script_id.clone(),
        });
        let next = self.creates.lock().unwrap().pop_front();
        match next.unwrap_or_else(|| Create::Created("inst-1".to_string())) {
            Create::Created(id) => Ok(id),
            Create::Rejected => Err(ProviderError::Api {
                status: 400,
                message: "insufficient_capacity: Not enough resources".to_string(),
            }),
            Create::Broken => Err(ProviderError::InvalidResponse(
                "empty identifier in response".to_string(),
            )),
        }
    }

    async fn delete_instance(&self, id: &str) -> Result<(), ProviderError> {
        if let Some(delay) = self.instance_delete_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(Call::DeleteInstance(id.to_string()));
        if self.fail_instance_delete {
            return Err(ProviderError::Api {
                status: 500,
                message: "boom".to_string(),
            });
        }
        Ok(())
    }

    async fn balance(&self) -> Result<Balance, ProviderError> {
        self.record(Call::Balance);
        Ok(Balance {
            amount: 10.0,
            currency: "usd".to_string(),
        })
    }
}

// =============================================================================
// Fake shell
// =============================================================================

/// Scripted result of one remote session.
#[derive(Debug, Clone)]
pub enum Reply {
    Outputs(Vec<String>),
    Refused,
    Denied,
    /// Never answers.
    Hang,
}

#[derive(Default)]
pub struct FakeShell {
    /// Popped per session; the last entry repeats.
    pub replies: Mutex<VecDeque<Reply>>,
    pub sessions: Mutex<Vec<(String, Vec<RemoteStep>)>>,
}

impl FakeShell {
    pub fn replying(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn sessions(&self) -> Vec<(String, Vec<RemoteStep>)> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn run(&self, host: &str, steps: Vec<RemoteStep>) -> Result<Vec<String>, RemoteError> {
        let count = steps.len();
        self.sessions
            .lock()
            .unwrap()
            .push((host.to_string(), steps));
        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front()
            } else {
                replies.front().cloned()
            }
        };
        match reply {
            Some(Reply::Outputs(outputs)) => Ok(outputs),
            Some(Reply::Refused) => Err(RemoteError::Connection("connection refused".to_string())),
            Some(Reply::Denied) => Err(RemoteError::Authentication("key rejected".to_string())),
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(vec![String::new(); count]),
        }
    }
}
