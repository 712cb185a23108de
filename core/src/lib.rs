pub mod application;
pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod promises;
pub mod queue;
pub mod retry;
pub mod samples;
pub mod store;
pub mod timers;
pub mod types;
pub mod workflows;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use types::*;

pub use application::{initialize, Application, InitBuilder, InitOptions};
pub use context::{WorkflowContext, WorkflowError};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use workflows::{SideEffect, Workflow, WorkflowRegistry};
