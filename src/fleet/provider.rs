use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::DeployConfig;
use crate::error::ProviderError;

/// A compute instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    /// Network address reachable over the remote shell; absent while the
    /// provider is still assigning one.
    pub address: Option<String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: Some(address.into()),
        }
    }
}

/// Instance lifecycle calls against a cloud provider.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// All live instances belonging to the fleet.
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError>;

    /// Provision one instance and return it once the provider has created it.
    async fn deploy_instance(&self, config: &DeployConfig) -> Result<Instance, ProviderError>;

    /// Destroy an instance. Returns [`ProviderError::NotFound`] if it is already gone.
    async fn destroy_instance(&self, id: &str) -> Result<(), ProviderError>;
}

/// The one fleet operation a worker needs: retiring its own instance.
#[async_trait]
pub trait InstanceRetirer: Send + Sync {
    /// Destroy the instance and forget it. Succeeds if it was already gone.
    async fn retire(&self, id: &str) -> Result<(), ProviderError>;
}
