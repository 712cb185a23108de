//! Shared fixtures for runtime tests

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::ManualClock;
use crate::config::Config;
use crate::context::{WorkflowContext, WorkflowError};
use crate::dispatcher::Dispatcher;
use crate::retry::RetryPolicy;
use crate::samples;
use crate::store::{InMemoryStore, Stores};
use crate::workflows::{SideEffect, Workflow, WorkflowRegistry};

/// Config with near-zero retry backoff
pub fn test_config() -> Config {
    let fast = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
        multiplier: 1.0,
    };
    let mut config = Config::default();
    config.runtime.claim_poll_ms = 1;
    config.retry.run = fast.clone();
    config.retry.rpc = fast;
    config
}

/// A dispatcher over an in-memory store and a manual clock.
///
/// `restart` builds a fresh dispatcher (empty queue, empty promise registry)
/// over the same store and clock, as a redeploy would.
pub struct TestRuntime {
    pub store: InMemoryStore,
    pub clock: Arc<ManualClock>,
    pub dispatcher: Dispatcher,
    registry: WorkflowRegistry,
    config: Config,
}

impl TestRuntime {
    pub fn new(registry: WorkflowRegistry) -> Self {
        Self::with_config(registry, test_config())
    }

    pub fn with_config(registry: WorkflowRegistry, config: Config) -> Self {
        Self::build(
            InMemoryStore::new(),
            Arc::new(ManualClock::default()),
            registry,
            config,
        )
    }

    fn build(
        store: InMemoryStore,
        clock: Arc<ManualClock>,
        registry: WorkflowRegistry,
        config: Config,
    ) -> Self {
        let dispatcher = Dispatcher::with_clock(
            Stores::from_backend(store.clone()),
            registry.clone(),
            &config,
            clock.clone(),
        );
        Self {
            store,
            clock,
            dispatcher,
            registry,
            config,
        }
    }

    pub fn restart(&self) -> Self {
        Self::build(
            self.store.clone(),
            self.clock.clone(),
            self.registry.clone(),
            self.config.clone(),
        )
    }

    pub fn advance_clock(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }
}

/// Records every `notify` call instead of sending it
#[derive(Clone, Default)]
pub struct Notifications {
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl Notifications {
    pub fn side_effect(&self) -> impl SideEffect + 'static {
        let calls = self.calls.clone();
        move |args: JsonValue| {
            let calls = calls.clone();
            async move {
                let (url, message): (String, String) = serde_json::from_value(args)?;
                calls.lock().unwrap().push((url, message));
                Ok::<JsonValue, anyhow::Error>(JsonValue::Null)
            }
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }
}

/// Sample workflows with a recording `notify`
pub fn sample_registry(notifications: &Notifications) -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    samples::register_workflows(&mut registry).unwrap();
    registry
        .register_function(samples::NOTIFY, notifications.side_effect())
        .unwrap();
    registry
}

/// Counts how often each execution's workflow function is entered
#[derive(Clone, Default)]
pub struct RunCounter {
    runs: Arc<Mutex<HashMap<String, usize>>>,
}

impl RunCounter {
    pub fn wrap<W: Workflow>(&self, inner: W) -> Counting<W> {
        Counting {
            inner,
            runs: self.runs.clone(),
        }
    }

    pub fn runs(&self, execution_id: &str) -> usize {
        self.runs
            .lock()
            .unwrap()
            .get(execution_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn executions(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> HashMap<String, usize> {
        self.runs.lock().unwrap().clone()
    }
}

pub struct Counting<W> {
    inner: W,
    runs: Arc<Mutex<HashMap<String, usize>>>,
}

#[async_trait]
impl<W: Workflow> Workflow for Counting<W> {
    async fn run(
        &self,
        ctx: &mut WorkflowContext<'_>,
        args: JsonValue,
    ) -> Result<JsonValue, WorkflowError> {
        *self
            .runs
            .lock()
            .unwrap()
            .entry(ctx.id().to_string())
            .or_default() += 1;
        self.inner.run(ctx, args).await
    }
}
