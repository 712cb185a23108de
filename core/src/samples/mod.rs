//! Sample workflows shipped with the runtime
//!
//! - `countdown(count, delay, url)`: posts a notification per tick, sleeping
//!   `delay` minutes between ticks
//! - `factorial(n)`: recursive nested invocations
//! - `notify(url, message)`: the HTTP side effect `countdown` uses

mod countdown;
mod factorial;
mod notify;

pub use countdown::{Countdown, CountdownArgs};
pub use factorial::Factorial;
pub use notify::Notify;

use crate::error::Result;
use crate::workflows::WorkflowRegistry;

pub const COUNTDOWN: &str = "countdown";
pub const FACTORIAL: &str = "factorial";
pub const NOTIFY: &str = "notify";

/// Registry with both samples and the real HTTP `notify`
pub fn registry() -> Result<WorkflowRegistry> {
    let mut registry = WorkflowRegistry::new();
    register_workflows(&mut registry)?;
    registry.register_function(NOTIFY, Notify::new())?;
    Ok(registry)
}

/// Register the sample workflows only, leaving `notify` to the caller
pub fn register_workflows(registry: &mut WorkflowRegistry) -> Result<()> {
    registry
        .register_workflow(COUNTDOWN, Countdown)?
        .register_workflow(FACTORIAL, Factorial)?;
    Ok(())
}
