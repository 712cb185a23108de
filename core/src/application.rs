//! Initialization of a runtime instance
//!
//! Loads configuration, connects to PostgreSQL, optionally migrates, and
//! wires the stores and the workflow registry into a [`Dispatcher`].

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::dispatcher::Dispatcher;
use crate::store::{PostgresStore, Stores};
use crate::workflows::WorkflowRegistry;

/// A runtime instance: configuration plus a dispatcher over its stores
pub struct Application {
    pub config: Config,
    pub dispatcher: Dispatcher,
    pool: Option<PgPool>,
}

impl Application {
    /// Create an Application over the given stores (pure instantiation, no I/O)
    pub fn new(config: Config, stores: Stores, registry: WorkflowRegistry) -> Self {
        let dispatcher = Dispatcher::new(stores, registry, &config);
        Self {
            config,
            dispatcher,
            pool: None,
        }
    }

    /// Application backed by PostgreSQL
    pub fn with_pool(config: Config, pool: PgPool, registry: WorkflowRegistry) -> Self {
        let stores = Stores::from_backend(PostgresStore::new(pool.clone()));
        let mut app = Self::new(config, stores, registry);
        app.pool = Some(pool);
        app
    }

    /// Application with non-durable in-memory stores
    pub fn in_memory(config: Config, registry: WorkflowRegistry) -> Self {
        Self::new(config, Stores::in_memory(), registry)
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Options for initializing a runtime
pub struct InitOptions {
    /// Database URL (overrides config file and env vars)
    pub database_url: Option<String>,

    /// Config file path (overrides default search)
    pub config_path: Option<std::path::PathBuf>,

    /// Whether to run migrations before returning
    pub auto_migrate: bool,

    /// Workflows and side effects the runtime can execute
    pub registry: WorkflowRegistry,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            config_path: None,
            auto_migrate: true,
            registry: WorkflowRegistry::new(),
        }
    }
}

/// Builder for constructing InitOptions
#[derive(Default)]
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    pub fn registry(mut self, registry: WorkflowRegistry) -> Self {
        self.options.registry = registry;
        self
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

/// Load configuration, connect and return an Application
pub async fn initialize(options: InitOptions) -> Result<Application> {
    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path)
        .build()?;

    let pool = db::create_pool(&config.database).await?;
    if options.auto_migrate {
        db::migrate(&pool).await?;
        info!("Database migrations applied");
    }

    Ok(Application::with_pool(config, pool, options.registry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::{self, Factorial};
    use crate::types::{InvocationRequest, InvocationResponse};
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_application_runs_samples() {
        let mut registry = WorkflowRegistry::new();
        registry
            .register_workflow(samples::FACTORIAL, Factorial)
            .unwrap();
        let app = Application::in_memory(Config::default(), registry);
        assert!(app.pool().is_none());

        let response = app
            .dispatcher
            .invoke(InvocationRequest {
                task_id: Some("f5".to_string()),
                workflow_name: "factorial".to_string(),
                args: json!([5]),
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            InvocationResponse::Completed {
                id: "f5".to_string(),
                value: json!(120)
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database to be running
    async fn test_initialize_against_database() {
        let url = std::env::var("TEMPO_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://tempo@localhost/tempo".to_string());
        let app = InitBuilder::new()
            .database_url(url)
            .registry(samples::registry().unwrap())
            .init()
            .await
            .unwrap();
        assert!(app.pool().is_some());
    }
}
