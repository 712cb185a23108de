use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::application::{Application, InitBuilder};
use crate::config::Config;
use crate::samples;
use crate::types::{ExecutionListFilter, ExecutionStatus, InvocationRequest, StepOutcome};

#[derive(Parser)]
#[command(name = "tempo")]
#[command(about = "Tempo - a durable execution runtime", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations
    Migrate,

    /// Invoke a workflow and drive it until it finishes or suspends
    Invoke {
        /// Workflow name (countdown, factorial)
        workflow: String,

        /// Arguments as JSON
        #[arg(default_value = "[]")]
        args: String,

        /// Task id; re-invoking with the same id never starts a second execution
        #[arg(long = "id")]
        task_id: Option<String>,
    },

    /// Get the status of an execution
    Status {
        /// Execution ID to query
        execution_id: String,
    },

    /// List executions
    List {
        /// Filter by status (running, completed, failed)
        #[arg(short = 's', long = "status")]
        status: Option<String>,

        /// Filter by workflow name
        #[arg(short = 'w', long = "workflow")]
        workflow: Option<String>,

        /// Number of results
        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: i64,
    },

    /// Print the step history of an execution
    History {
        execution_id: String,
    },

    /// Cancel a running execution and its nested executions
    Cancel {
        /// Execution ID to cancel
        execution_id: String,

        /// Skip confirmation prompt
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },

    /// Run a worker that resumes suspended executions until Ctrl-C
    Worker,

    /// Print the effective configuration
    Config,
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

async fn connect(cli: &Cli, auto_migrate: bool) -> Result<Application> {
    let mut builder = InitBuilder::new()
        .auto_migrate(auto_migrate)
        .registry(samples::registry()?);
    if let Some(url) = &cli.database_url {
        builder = builder.database_url(url.clone());
    }
    if let Some(path) = &cli.config {
        builder = builder.config_path(path.clone());
    }
    builder.init().await
}

fn parse_status(status: &str) -> Result<ExecutionStatus> {
    match status.to_lowercase().as_str() {
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        other => anyhow::bail!(
            "Invalid status: {}. Must be one of: running, completed, failed",
            other
        ),
    }
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    // Eagerly load and validate configuration so config errors are shown first
    let config = Config::builder()
        .database_url(cli.database_url.clone())
        .config_path(cli.config.clone())
        .build()?;

    match &cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }

        Commands::Migrate => {
            println!("Running migrations...");
            connect(&cli, true).await?;
            println!("Migrations complete!");
        }

        Commands::Invoke {
            workflow,
            args,
            task_id,
        } => {
            let args: serde_json::Value =
                serde_json::from_str(args).context("Arguments must be valid JSON")?;
            let app = connect(&cli, false).await?;
            let response = app
                .dispatcher
                .invoke(InvocationRequest {
                    task_id: task_id.clone(),
                    workflow_name: workflow.clone(),
                    args,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Status { execution_id } => {
            let app = connect(&cli, false).await?;
            match app.dispatcher.execution(execution_id).await? {
                Some(exec) => {
                    println!("Execution: {}", exec.id);
                    println!("Workflow: {}", exec.workflow_name);
                    println!("Status: {:?}", exec.status);
                    println!("Depth: {}", exec.depth);
                    if let Some(parent) = &exec.parent {
                        println!("Parent: {} (step {})", parent.execution_id, parent.step_index);
                    }
                    println!("Created: {}", exec.created_at);
                    if let Some(completed_at) = exec.completed_at {
                        println!("Completed: {}", completed_at);
                    }
                    println!("Args: {}", exec.args);

                    if let Some(result) = exec.result {
                        println!("\nResult:");
                        println!("  {}", result);
                    }
                    if let Some(error) = exec.error {
                        println!("\nError:");
                        println!("  {}", error);
                    }

                    let children = app.dispatcher.children(&exec.id).await?;
                    if !children.is_empty() {
                        println!("\nChildren:");
                        for child in children {
                            println!("  {} | {:?} | {}", child.id, child.status, child.workflow_name);
                        }
                    }
                }
                None => anyhow::bail!("Execution {} not found", execution_id),
            }
        }

        Commands::List {
            status,
            workflow,
            limit,
        } => {
            let filter = ExecutionListFilter {
                status: status.as_deref().map(parse_status).transpose()?,
                workflow_name: workflow.clone(),
                limit: Some(*limit),
            };
            let app = connect(&cli, false).await?;
            let executions = app.dispatcher.list(filter).await?;

            if executions.is_empty() {
                println!("No executions found");
                return Ok(());
            }

            println!("Found {} execution(s):\n", executions.len());
            for exec in executions {
                println!(
                    "  {} | {:?} | {} | {}",
                    exec.id, exec.status, exec.workflow_name, exec.created_at
                );
            }
        }

        Commands::History { execution_id } => {
            let app = connect(&cli, false).await?;
            let history = app.dispatcher.history(execution_id).await?;
            if history.is_empty() {
                println!("No steps recorded for {}", execution_id);
                return Ok(());
            }
            for record in history {
                let outcome = match &record.outcome {
                    StepOutcome::Success(value) => format!("ok {}", value),
                    StepOutcome::Failure(error) => format!("err {}", error),
                };
                println!(
                    "  #{} {:?} {} -> {} ({})",
                    record.index, record.kind, record.input, outcome, record.completed_at
                );
            }
        }

        Commands::Cancel { execution_id, yes } => {
            if !*yes {
                anyhow::bail!("Confirmation required. Use --yes flag to confirm cancellation.");
            }
            let app = connect(&cli, false).await?;
            if app.dispatcher.cancel(execution_id).await? {
                println!("✓ Execution {} cancelled", execution_id);
            } else {
                println!("Execution {} had already finished", execution_id);
            }
        }

        Commands::Worker => {
            let app = connect(&cli, false).await?;
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal.cancel();
                }
            });
            app.dispatcher.run_worker(shutdown).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invoke() {
        let cli = Cli::parse_from([
            "tempo",
            "--database-url",
            "postgresql://localhost/tempo",
            "invoke",
            "factorial",
            "[4]",
            "--id",
            "f-4",
        ]);
        assert_eq!(cli.database_url.as_deref(), Some("postgresql://localhost/tempo"));
        match cli.command {
            Commands::Invoke {
                workflow,
                args,
                task_id,
            } => {
                assert_eq!(workflow, "factorial");
                assert_eq!(args, "[4]");
                assert_eq!(task_id.as_deref(), Some("f-4"));
            }
            _ => panic!("expected invoke"),
        }
    }

    #[test]
    fn test_parse_status_filter() {
        assert_eq!(parse_status("Running").unwrap(), ExecutionStatus::Running);
        assert!(parse_status("suspended").is_err());
    }
}
