//! Scope cache.
//!
//! Memoizes one [`Environment`] per scope key. First access per key is
//! serialized through a per-key `OnceCell`, so concurrent callers sharing a
//! key run the factory once and observe the same `Arc<Environment>`. A
//! failed factory is remembered: the whole scope fails with that error until
//! the key is released.

use crate::error::HarnessError;
use crate::lifecycle::{Environment, EnvironmentState};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

/// Lifetime boundary across which one environment is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScopeGranularity {
    /// One environment per test class.
    #[default]
    Class,
    /// One environment for the whole test run.
    Run,
}

impl ScopeGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Run => "run",
        }
    }
}

/// Key of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of the scope `class_name` belongs to under `granularity`.
    pub fn for_scope(granularity: ScopeGranularity, class_name: &str) -> Self {
        match granularity {
            ScopeGranularity::Class => Self(format!("class:{class_name}")),
            ScopeGranularity::Run => Self("run".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of the one factory run of a key. Failures stay until release.
type Outcome = Result<Arc<Environment>, HarnessError>;
type Entry = Arc<OnceCell<Outcome>>;

/// Map from scope key to its environment.
#[derive(Default)]
pub struct ScopeCache {
    entries: RwLock<HashMap<ScopeKey, Entry>>,
}

impl ScopeCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, key: &ScopeKey) -> Entry {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                return Arc::clone(entry);
            }
        }

        let mut entries = self.entries.write().await;
        Arc::clone(entries.entry(key.clone()).or_default())
    }

    /// Existing environment for `key`, or the one `factory` creates.
    ///
    /// `factory` runs at most once per key until the key is released. A
    /// failure is kept: every caller of the key receives the same error.
    ///
    /// # Errors
    ///
    /// The error of the factory run for `key`.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &ScopeKey,
        factory: F,
    ) -> Result<Arc<Environment>, HarnessError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Environment>, HarnessError>>,
    {
        let entry = self.entry(key).await;

        let outcome = entry
            .get_or_init(|| async {
                info!(
                    target: "crucible.scope_cache",
                    scope = %key,
                    "Creating environment for scope"
                );
                let created = factory().await;
                if let Err(e) = &created {
                    warn!(
                        target: "crucible.scope_cache",
                        scope = %key,
                        error = %e,
                        "Environment creation failed; scope stays failed until released"
                    );
                }
                created
            })
            .await;

        let environment = outcome.as_ref().map_err(Clone::clone)?;
        debug!(
            target: "crucible.scope_cache",
            scope = %key,
            environment = %environment.id(),
            "Environment resolved"
        );
        Ok(Arc::clone(environment))
    }

    /// Environment of `key`, if one was created successfully.
    pub async fn get(&self, key: &ScopeKey) -> Option<Arc<Environment>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .and_then(|entry| entry.get())
            .and_then(|outcome| outcome.as_ref().ok())
            .cloned()
    }

    /// Remove `key` and stop its environment. A second release is a no-op.
    ///
    /// A creation still in flight is awaited first, so its environment is
    /// stopped rather than left behind.
    ///
    /// Returns whether an environment was stopped.
    pub async fn release(&self, key: &ScopeKey) -> bool {
        let entry = self.entries.write().await.remove(key);

        match entry {
            Some(entry) => Self::stop_entry(key, &entry).await,
            None => {
                debug!(target: "crucible.scope_cache", scope = %key, "Nothing to release");
                false
            }
        }
    }

    /// Release every entry. Returns the number of environments stopped.
    pub async fn release_all(&self) -> usize {
        let drained: Vec<(ScopeKey, Entry)> = self.entries.write().await.drain().collect();

        let mut released = 0;
        for (key, entry) in drained {
            if Self::stop_entry(&key, &entry).await {
                released += 1;
            }
        }

        if released > 0 {
            info!(target: "crucible.scope_cache", released, "All scopes released");
        }
        released
    }

    /// Settle a removed entry and stop its environment, if any.
    async fn stop_entry(key: &ScopeKey, entry: &Entry) -> bool {
        // Waits for an in-flight creation; an idle cell is closed off instead.
        let outcome = entry
            .get_or_init(|| async {
                Err(HarnessError::InvalidState {
                    expected: EnvironmentState::NotStarted,
                    actual: EnvironmentState::Closed,
                })
            })
            .await;

        match outcome {
            Ok(environment) => {
                info!(
                    target: "crucible.scope_cache",
                    scope = %key,
                    environment = %environment.id(),
                    "Releasing environment"
                );
                environment.stop().await;
                true
            }
            Err(_) => {
                debug!(target: "crucible.scope_cache", scope = %key, "No environment to stop");
                false
            }
        }
    }

    /// Number of scopes holding an environment.
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|entry| matches!(entry.get(), Some(Ok(_))))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Drop for ScopeCache {
    fn drop(&mut self) {
        let pending = self
            .entries
            .get_mut()
            .values()
            .filter(|entry| matches!(entry.get(), Some(Ok(_))))
            .count();
        if pending > 0 {
            warn!(
                target: "crucible.scope_cache",
                pending,
                "Scope cache dropped with unreleased environments"
            );
        }
    }
}
