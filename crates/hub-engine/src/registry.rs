use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use hub_core::OrchestratorError;

/// Resolved agent package: where the agent's code lives plus the metadata
/// the engine needs to build a run (model, instructions, runtime framework,
/// default environment).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentPackage {
    pub agent_id: String,
    /// Location of the agent's files (local path or fetchable URI).
    pub files_uri: String,
    pub model: String,
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    /// Execution framework tag, used to compose async invocation targets.
    pub framework: String,
    #[serde(default)]
    pub default_env: HashMap<String, String>,
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> Result<AgentPackage, OrchestratorError>;
}

/// Verifies that a caller identity may act on a resource owned by `owner_id`.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, caller_id: &str, owner_id: &str) -> Result<(), OrchestratorError>;
}

/// Registry backed by a fixed map. Used in tests and single-node deployments
/// where agents are provisioned out of band.
#[derive(Default)]
pub struct InMemoryRegistry {
    agents: HashMap<String, AgentPackage>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, package: AgentPackage) {
        self.agents.insert(package.agent_id.clone(), package);
    }

    /// Load a registry from a JSON file holding an array of agent packages.
    pub fn from_file(path: &std::path::Path) -> Result<Self, OrchestratorError> {
        let bytes = std::fs::read(path).map_err(|e| {
            OrchestratorError::Internal(format!("reading {}: {e}", path.display()))
        })?;
        let packages: Vec<AgentPackage> = serde_json::from_slice(&bytes).map_err(|e| {
            OrchestratorError::Internal(format!("parsing {}: {e}", path.display()))
        })?;
        let mut registry = Self::new();
        for package in packages {
            registry.register(package);
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryRegistry {
    async fn get_agent(&self, agent_id: &str) -> Result<AgentPackage, OrchestratorError> {
        self.agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {agent_id}")))
    }
}

/// Owner-equality check. Callers act only on their own threads.
pub struct OwnerOnlyVerifier;

#[async_trait]
impl AuthVerifier for OwnerOnlyVerifier {
    async fn verify(&self, caller_id: &str, owner_id: &str) -> Result<(), OrchestratorError> {
        if caller_id == owner_id {
            Ok(())
        } else {
            Err(OrchestratorError::Forbidden(format!(
                "caller {caller_id} does not own this resource"
            )))
        }
    }
}
