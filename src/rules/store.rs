//! Rule store access
//!
//! The rule cache reads declared rule sets through [`RuleStore`] so it can be
//! exercised without an API server.

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::crd::RegistryRewriteRule;
use crate::Error;

/// Source of declared rule sets
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// List every RegistryRewriteRule in the cluster
    async fn list(&self) -> Result<Vec<RegistryRewriteRule>, Error>;
}

/// RuleStore backed by the Kubernetes API
pub struct KubeRuleStore {
    client: Client,
}

impl KubeRuleStore {
    /// Create a new KubeRuleStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RuleStore for KubeRuleStore {
    async fn list(&self) -> Result<Vec<RegistryRewriteRule>, Error> {
        let api: Api<RegistryRewriteRule> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::store(format!("failed to list RegistryRewriteRule: {}", e)))?;
        Ok(list.items)
    }
}
