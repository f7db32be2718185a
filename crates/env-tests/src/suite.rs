//! Docker-backed suite setup.
//!
//! A [`Suite`] plays the role of one test class: it provisions the class
//! environment on creation, injects fixtures per test and releases the
//! environment in [`Suite::finish`].

use crucible_harness::runtime::DockerRuntime;
use crucible_harness::{
    EngineClient, Environment, EnvironmentExtension, FieldRef, HarnessConfig, HarnessError, Role,
    ScopeContext, ServiceAddress, Slot, TestContext, TestFixture, VariantFlags,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("Docker daemon not reachable: {0}")]
    DockerUnavailable(String),

    #[error("Harness error: {0}")]
    Harness(#[from] HarnessError),
}

/// Fixture with a single engine client field.
#[derive(Debug, Default)]
pub struct ClientFixture {
    pub client: Option<EngineClient>,
}

impl TestFixture for ClientFixture {
    fn declared_fields(&mut self) -> Vec<FieldRef<'_>> {
        vec![FieldRef::instance("client", Slot::EngineClient(&mut self.client))]
    }
}

/// One test class running against its own Docker environment.
pub struct Suite {
    extension: EnvironmentExtension,
    scope: ScopeContext,
    environment: Arc<Environment>,
}

impl Suite {
    /// Start the environment of `class_name` with `flags`.
    ///
    /// Everything but the variant comes from `CRUCIBLE_*` variables.
    pub async fn start(class_name: &str, flags: VariantFlags) -> Result<Self, SuiteError> {
        common::logging::init_tracing_from_env();

        let runtime = DockerRuntime::new().map_err(HarnessError::from)?;
        let version = runtime
            .server_version()
            .await
            .map_err(|e| SuiteError::DockerUnavailable(e.to_string()))?;
        info!(
            target: "crucible.env_tests",
            docker = %version,
            class = class_name,
            "Starting suite"
        );

        let config = HarnessConfig {
            flags,
            ..HarnessConfig::from_env().map_err(HarnessError::from)?
        };
        let extension = EnvironmentExtension::new(config, Arc::new(runtime))?;
        let scope = ScopeContext::new(class_name);
        let environment = extension.before_scope(&scope).await?;

        Ok(Self {
            extension,
            scope,
            environment,
        })
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    /// Inject the fixture of test `method_name`.
    pub async fn before_each(
        &self,
        method_name: &str,
        fixture: &mut dyn TestFixture,
    ) -> Result<usize, SuiteError> {
        let test = TestContext::new(
            self.scope.class_name().unwrap_or("?").to_string(),
            method_name,
        );
        Ok(self.extension.before_each(&test, fixture).await?)
    }

    /// Engine client of test `method_name`, tagged with its isolation key.
    pub async fn client_for(&self, method_name: &str) -> Result<EngineClient, SuiteError> {
        let mut fixture = ClientFixture::default();
        self.before_each(method_name, &mut fixture).await?;
        fixture.client.ok_or_else(|| {
            SuiteError::Harness(HarnessError::InjectionFailed {
                field: "client".to_string(),
                cause: "not assigned".to_string(),
            })
        })
    }

    pub async fn address_of(&self, role: Role) -> Result<ServiceAddress, SuiteError> {
        Ok(self.environment.address_of(role).await?)
    }

    /// Release the environment. Returns whether one was stopped.
    pub async fn finish(self) -> bool {
        let released = self.extension.after_scope(&self.scope).await;
        self.extension.shutdown().await;
        released
    }
}
