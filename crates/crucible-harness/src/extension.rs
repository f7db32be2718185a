//! Test-framework hooks.
//!
//! [`EnvironmentExtension`] is what a test harness calls at its hook points:
//!
//! ```text
//! before_scope   -> environment of the scope is created (once per scope key)
//! inject_shared  -> static fixture fields, no isolation key
//! before_each    -> instance fixture fields, isolation key of the test
//! after_scope    -> environment of the scope is released
//! shutdown       -> every remaining environment is released
//! ```
//!
//! The extension owns its scope cache; nothing is global.

use crate::client_factory::ClientFactory;
use crate::config::HarnessConfig;
use crate::credentials::{CredentialsConfig, CredentialsProvider};
use crate::error::HarnessError;
use crate::inject::{self, Credentials, InjectionContext, TestFixture};
use crate::isolation::{derive_isolation_key, IsolationKey};
use crate::lifecycle::Environment;
use crate::role::Role;
use crate::runtime::ServiceRuntime;
use crate::scope_cache::{ScopeCache, ScopeGranularity, ScopeKey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

/// Placeholder scope name when the test class is unknown.
const UNKNOWN_CLASS: &str = "?";

/// Identity of a scope as reported by the test framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeContext {
    class_name: Option<String>,
}

impl ScopeContext {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: Some(class_name.into()),
        }
    }

    /// Scope of a test class the framework could not name.
    pub fn anonymous() -> Self {
        Self { class_name: None }
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    fn key(&self, granularity: ScopeGranularity) -> ScopeKey {
        ScopeKey::for_scope(granularity, self.class_name().unwrap_or(UNKNOWN_CLASS))
    }
}

/// Identity of the running test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestContext {
    class_name: Option<String>,
    method_name: Option<String>,
}

impl TestContext {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: Some(class_name.into()),
            method_name: Some(method_name.into()),
        }
    }

    /// Context with possibly unknown names.
    pub fn from_parts(class_name: Option<String>, method_name: Option<String>) -> Self {
        Self {
            class_name,
            method_name,
        }
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    pub fn method_name(&self) -> Option<&str> {
        self.method_name.as_deref()
    }

    /// Scope the test runs in.
    pub fn scope(&self) -> ScopeContext {
        ScopeContext {
            class_name: self.class_name.clone(),
        }
    }

    pub fn isolation_key(&self) -> IsolationKey {
        derive_isolation_key(self.class_name(), self.method_name())
    }
}

/// Environment provisioning and injection at test-framework hook points.
pub struct EnvironmentExtension {
    config: HarnessConfig,
    runtime: Arc<dyn ServiceRuntime>,
    cache: ScopeCache,
    factory: ClientFactory,
    /// Credentials per environment id, identity variant only.
    credentials: RwLock<HashMap<String, Arc<CredentialsProvider>>>,
}

impl EnvironmentExtension {
    /// # Errors
    ///
    /// `Client` if the client factory cannot be built.
    pub fn new(
        config: HarnessConfig,
        runtime: Arc<dyn ServiceRuntime>,
    ) -> Result<Self, HarnessError> {
        let factory = ClientFactory::new(config.client_timeout)?;

        Ok(Self {
            config,
            runtime,
            cache: ScopeCache::new(),
            factory,
            credentials: RwLock::new(HashMap::new()),
        })
    }

    /// Extension configured from `CRUCIBLE_*` environment variables.
    ///
    /// # Errors
    ///
    /// `Config` for malformed variables, `Client` as for [`EnvironmentExtension::new`].
    pub fn from_env(runtime: Arc<dyn ServiceRuntime>) -> Result<Self, HarnessError> {
        Self::new(HarnessConfig::from_env()?, runtime)
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Environment of `scope`, started on first call.
    ///
    /// # Errors
    ///
    /// `InvalidTopology` or `StartupFailed`; nothing is left running.
    #[instrument(skip_all, name = "crucible.extension.before_scope")]
    pub async fn before_scope(
        &self,
        scope: &ScopeContext,
    ) -> Result<Arc<Environment>, HarnessError> {
        let key = scope.key(self.config.scope);

        self.cache
            .get_or_create(&key, || async {
                let topology = self.config.topology_builder().build(self.config.flags)?;
                Environment::launch(
                    topology,
                    Arc::clone(&self.runtime),
                    self.config.lifecycle_settings(),
                )
                .await
            })
            .await
    }

    /// Fill the static fields of `fixture` with scope-wide values.
    ///
    /// Clients injected here carry no isolation key.
    ///
    /// # Errors
    ///
    /// Errors of [`EnvironmentExtension::before_scope`], or `InjectionFailed`.
    pub async fn inject_shared(
        &self,
        scope: &ScopeContext,
        fixture: &mut dyn TestFixture,
    ) -> Result<usize, HarnessError> {
        let environment = self.before_scope(scope).await?;
        let context = self.injection_context(environment, None).await;
        inject::inject_shared(fixture, &context)
    }

    /// Fill the instance fields of `fixture` for the test described by `test`.
    ///
    /// # Errors
    ///
    /// Errors of [`EnvironmentExtension::before_scope`], or `InjectionFailed`
    /// which fails only this test.
    #[instrument(skip_all, name = "crucible.extension.before_each")]
    pub async fn before_each(
        &self,
        test: &TestContext,
        fixture: &mut dyn TestFixture,
    ) -> Result<usize, HarnessError> {
        let environment = self.before_scope(&test.scope()).await?;
        let context = self
            .injection_context(environment, Some(test.isolation_key()))
            .await;
        inject::inject(fixture, &context)
    }

    /// End of a scope. Under run granularity environments live until [`shutdown`].
    ///
    /// Returns whether an environment was released.
    ///
    /// [`shutdown`]: EnvironmentExtension::shutdown
    pub async fn after_scope(&self, scope: &ScopeContext) -> bool {
        if self.config.scope == ScopeGranularity::Run {
            return false;
        }

        let key = scope.key(self.config.scope);
        if let Some(environment) = self.cache.get(&key).await {
            self.credentials.write().await.remove(environment.id());
        }
        self.cache.release(&key).await
    }

    /// Release every environment. Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        self.credentials.write().await.clear();
        let released = self.cache.release_all().await;
        info!(target: "crucible.extension", released, "Extension shut down");
        released
    }

    /// Environment of `scope`, if already created.
    pub async fn environment(&self, scope: &ScopeContext) -> Option<Arc<Environment>> {
        self.cache.get(&scope.key(self.config.scope)).await
    }

    async fn injection_context(
        &self,
        environment: Arc<Environment>,
        isolation_key: Option<IsolationKey>,
    ) -> InjectionContext {
        let credentials = self.credentials_for(&environment).await;
        InjectionContext::resolve(environment, isolation_key, credentials, self.factory.clone())
            .await
    }

    /// Credentials for environments running the identity stack.
    ///
    /// Setup failures are carried into the context and only fail client fields.
    async fn credentials_for(&self, environment: &Environment) -> Credentials {
        if !environment.topology().contains(Role::Keycloak) {
            return Credentials::Anonymous;
        }

        if let Some(provider) = self.credentials.read().await.get(environment.id()) {
            return Credentials::Provider(Arc::clone(provider));
        }

        match self.build_credentials(environment).await {
            Ok(provider) => {
                let mut credentials = self.credentials.write().await;
                let provider = credentials
                    .entry(environment.id().to_string())
                    .or_insert(provider);
                Credentials::Provider(Arc::clone(provider))
            }
            Err(e) => {
                warn!(
                    target: "crucible.extension",
                    environment = %environment.id(),
                    error = %e,
                    "Credentials unavailable"
                );
                Credentials::Unavailable(e.to_string())
            }
        }
    }

    async fn build_credentials(
        &self,
        environment: &Environment,
    ) -> Result<Arc<CredentialsProvider>, HarnessError> {
        let keycloak = environment.address_of(Role::Keycloak).await?;
        let config = CredentialsConfig::for_keycloak(
            &keycloak,
            self.config.client_id.clone(),
            self.config.client_secret.clone(),
            self.config.client_audience.clone(),
        )
        .with_http_timeout(self.config.client_timeout);
        Ok(Arc::new(CredentialsProvider::new(config)?))
    }
}
