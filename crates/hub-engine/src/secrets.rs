use std::collections::HashMap;

use async_trait::async_trait;

use hub_core::OrchestratorError;

pub type EnvMap = HashMap<String, String>;

/// External secret store. Given an agent identity and a caller identity,
/// returns the two merged key/value maps it holds for them.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<(EnvMap, EnvMap), OrchestratorError>;
}

/// Merge environment maps for a dispatch. Later sources override earlier
/// ones: agent metadata defaults < agent secret store < user-supplied request
/// vars < user secret store.
pub fn merge_env(
    agent_defaults: &EnvMap,
    agent_secrets: &EnvMap,
    request_vars: &EnvMap,
    user_secrets: &EnvMap,
) -> EnvMap {
    let mut merged = EnvMap::new();
    for source in [agent_defaults, agent_secrets, request_vars, user_secrets] {
        for (k, v) in source {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Fixed-map resolver for tests and local single-tenant deployments.
#[derive(Default)]
pub struct StaticResolver {
    pub agent_vars: EnvMap,
    pub user_vars: EnvMap,
}

#[async_trait]
impl SecretResolver for StaticResolver {
    async fn resolve(
        &self,
        _agent_id: &str,
        _user_id: &str,
    ) -> Result<(EnvMap, EnvMap), OrchestratorError> {
        Ok((self.agent_vars.clone(), self.user_vars.clone()))
    }
}
