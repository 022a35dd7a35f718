//! Refreshing cache for the parsed witness policy.
//!
//! The policy lives in a store that other nodes may update at any time, so
//! the parsed form is cached with a TTL and reloaded transparently. The
//! loader runs at most once per refresh: expired readers race for the write
//! lock and whoever wins reloads while the rest wait.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::parser::{self, WitnessPolicyConfig};
use super::store::{PolicyStore, PolicyStoreError};
use super::PolicyError;

/// Read access to the cached policy.
///
/// `Ok(None)` means the cache holds no value — surfaced to callers as a
/// distinct error by the policy engine.
#[async_trait]
pub(crate) trait Cache: Send + Sync {
    async fn get(&self) -> Result<Option<Arc<WitnessPolicyConfig>>, PolicyError>;
}

struct Entry {
    cfg: Arc<WitnessPolicyConfig>,
    loaded_at: Instant,
}

/// TTL cache backed by a [`PolicyStore`] loader.
pub(crate) struct TtlPolicyCache {
    store: Arc<dyn PolicyStore>,
    expiry: Duration,
    entry: RwLock<Entry>,
}

impl std::fmt::Debug for TtlPolicyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlPolicyCache")
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl TtlPolicyCache {
    /// Load the policy once and construct the cache. A load failure here
    /// fails construction.
    pub(crate) async fn new(
        store: Arc<dyn PolicyStore>,
        expiry: Duration,
    ) -> Result<Self, PolicyError> {
        let cfg = load(store.as_ref()).await?;

        Ok(Self {
            store,
            expiry,
            entry: RwLock::new(Entry {
                cfg: Arc::new(cfg),
                loaded_at: Instant::now(),
            }),
        })
    }
}

#[async_trait]
impl Cache for TtlPolicyCache {
    async fn get(&self) -> Result<Option<Arc<WitnessPolicyConfig>>, PolicyError> {
        {
            let entry = self.entry.read().await;
            if entry.loaded_at.elapsed() < self.expiry {
                return Ok(Some(Arc::clone(&entry.cfg)));
            }
        }

        let mut entry = self.entry.write().await;

        // Another task may have refreshed while we waited for the lock.
        if entry.loaded_at.elapsed() < self.expiry {
            return Ok(Some(Arc::clone(&entry.cfg)));
        }

        match load(self.store.as_ref()).await {
            Ok(cfg) => {
                debug!(policy = %cfg.source, "refreshed witness policy");
                entry.cfg = Arc::new(cfg);
                entry.loaded_at = Instant::now();
            }
            Err(PolicyError::Parse(e)) => return Err(PolicyError::Parse(e)),
            Err(e) => {
                // Store unavailable: keep serving the previous policy until
                // the next refresh succeeds.
                warn!(error = %e, "witness policy reload failed, keeping previous value");
                entry.loaded_at = Instant::now();
            }
        }

        Ok(Some(Arc::clone(&entry.cfg)))
    }
}

/// Fetch and parse the policy. An absent policy parses as the default.
async fn load(store: &dyn PolicyStore) -> Result<WitnessPolicyConfig, PolicyError> {
    let source = match store.get_policy().await {
        Ok(source) => source,
        Err(PolicyStoreError::NotFound) => String::new(),
        Err(e) => return Err(PolicyError::Store(e.to_string())),
    };

    Ok(parser::parse(&source)?)
}
