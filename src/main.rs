use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use dagflow::{Engine, EngineConfig, ScriptedExecutor};

#[derive(Parser)]
#[command(name = "dagflow", version, about = "DAG-based workflow execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a YAML workflow definition and run it to completion
    Run {
        /// Path to the workflow YAML file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("dagflow=debug")
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            info!("loading workflow from {:?}", config);

            let workflow = match dagflow::loader::load_workflow_yaml(&config) {
                Ok(workflow) => workflow,
                Err(err) => {
                    error!("failed to load workflow: {err}");
                    std::process::exit(1);
                }
            };

            println!("loaded workflow '{}' ({} steps)", workflow.id, workflow.steps.len());

            let engine = Engine::new(Arc::new(ScriptedExecutor::new()), EngineConfig::default());
            let workflow_id = workflow.id.clone();
            engine.register(workflow)?;
            let execution_id = engine.start(&workflow_id, None)?;

            loop {
                let snapshot = engine.get_state(execution_id).await?;
                if snapshot.status.is_terminal() {
                    println!("final status: {:?}", snapshot.status);
                    println!("\nstep results:");
                    for (step_id, step_state) in &snapshot.steps {
                        println!("  {step_id} -> {:?}", step_state.status);
                    }
                    if let Some(failure) = snapshot.failure {
                        println!("\nfailure: {}", failure.message);
                    }
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }

    Ok(())
}
