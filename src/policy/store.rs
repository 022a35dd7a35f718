//! Witness-policy persistence.

use std::sync::RwLock;

use async_trait::async_trait;

/// Key under which the policy is persisted.
pub const WITNESS_POLICY_KEY: &str = "witness-policy";

/// Policy store errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyStoreError {
    /// No policy has been stored yet.
    #[error("policy not found")]
    NotFound,

    #[error("policy store: {0}")]
    Store(String),
}

/// Persists the witness policy source text under [`WITNESS_POLICY_KEY`].
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(&self) -> Result<String, PolicyStoreError>;
    async fn put_policy(&self, policy: &str) -> Result<(), PolicyStoreError>;
}

/// In-memory policy store.
#[derive(Default)]
pub struct MemoryPolicyStore {
    policy: RwLock<Option<String>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an initial policy.
    pub fn with_policy(policy: impl Into<String>) -> Self {
        Self {
            policy: RwLock::new(Some(policy.into())),
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn get_policy(&self) -> Result<String, PolicyStoreError> {
        self.policy
            .read()
            .expect("policy lock")
            .clone()
            .ok_or(PolicyStoreError::NotFound)
    }

    async fn put_policy(&self, policy: &str) -> Result<(), PolicyStoreError> {
        *self.policy.write().expect("policy lock") = Some(policy.to_string());
        Ok(())
    }
}
