//! orchd — blueprint store and deployment orchestrator.
//!
//! One binary that runs the invocation workers and operates the blueprint
//! store and invocation log from the command line.
//!
//! # Usage
//!
//! ```text
//! orchd --config /etc/orchd.toml blueprint push ./my-blueprint
//! orchd --config /etc/orchd.toml invoke deploy-fresh --blueprint <id>
//! orchd --config /etc/orchd.toml run
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use orch_core::{BlueprintId, DeploymentId, InvocationId, Tag};
use orch_state::Operation;

mod commands;

#[derive(Parser)]
#[command(
    name = "orchd",
    about = "Blueprint store and deployment orchestrator",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file. Built-in defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the invocation workers until Ctrl-C.
    ///
    /// Invocations left PENDING by earlier submissions are picked up first.
    Run,
    /// Manage blueprint revisions.
    Blueprint {
        #[command(subcommand)]
        action: BlueprintAction,
    },
    /// Submit an invocation.
    #[command(disable_version_flag = true)]
    Invoke {
        /// deploy-fresh, deploy-continue, update, undeploy, diff or validate.
        operation: Operation,
        #[arg(long)]
        blueprint: Option<BlueprintId>,
        /// Revision to run, e.g. v2.0.
        #[arg(long)]
        version: Option<Tag>,
        #[arg(long)]
        deployment: Option<DeploymentId>,
        /// JSON file with engine inputs.
        #[arg(long)]
        inputs: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        workers: u32,
        /// Discard engine state before a fresh deploy.
        #[arg(long)]
        clean_state: bool,
        /// Execute in this process and wait for the outcome.
        #[arg(long)]
        wait: bool,
    },
    /// Show one invocation.
    Status { invocation: InvocationId },
    /// List the invocations of a deployment.
    History { deployment: DeploymentId },
    /// Inspect or remove deployment records.
    Deployment {
        #[command(subcommand)]
        action: DeploymentAction,
    },
}

#[derive(Subcommand)]
enum BlueprintAction {
    /// Store a directory as a new revision.
    Push {
        path: PathBuf,
        /// Existing blueprint to add a revision to. A new one when omitted.
        #[arg(long)]
        blueprint: Option<BlueprintId>,
        #[arg(short, long)]
        message: Option<String>,
        /// Tag on the minor line of this revision instead of a new major.
        #[arg(long)]
        reference: Option<Tag>,
    },
    /// Check a revision out into a directory.
    #[command(disable_version_flag = true)]
    Pull {
        blueprint: BlueprintId,
        dest: PathBuf,
        /// Latest revision when omitted.
        #[arg(long)]
        version: Option<Tag>,
    },
    /// List revisions and their messages.
    Tags { blueprint: BlueprintId },
    /// Delete the blueprint repository.
    Delete {
        blueprint: BlueprintId,
        /// Delete even while deployments of it are not undeployed.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum DeploymentAction {
    Show { deployment: DeploymentId },
    /// Remove the deployment record and its invocation history.
    Delete {
        deployment: DeploymentId,
        /// Delete even if it may still hold resources.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,orchd=debug,orch=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run => commands::run::run(&config).await,
        Command::Blueprint { action } => match action {
            BlueprintAction::Push {
                path,
                blueprint,
                message,
                reference,
            } => commands::blueprint::push(&config, &path, blueprint, message.as_deref(), reference).await,
            BlueprintAction::Pull {
                blueprint,
                dest,
                version,
            } => commands::blueprint::pull(&config, blueprint, version, &dest).await,
            BlueprintAction::Tags { blueprint } => commands::blueprint::tags(&config, blueprint).await,
            BlueprintAction::Delete { blueprint, force } => {
                commands::blueprint::delete(&config, blueprint, force).await
            }
        },
        Command::Invoke {
            operation,
            blueprint,
            version,
            deployment,
            inputs,
            workers,
            clean_state,
            wait,
        } => {
            let args = commands::invoke::InvokeArgs {
                operation,
                blueprint,
                version,
                deployment,
                inputs,
                workers,
                clean_state,
                wait,
            };
            commands::invoke::invoke(&config, args).await
        }
        Command::Status { invocation } => commands::invoke::status(&config, invocation),
        Command::History { deployment } => commands::invoke::history(&config, deployment),
        Command::Deployment { action } => match action {
            DeploymentAction::Show { deployment } => commands::invoke::show_deployment(&config, deployment),
            DeploymentAction::Delete { deployment, force } => {
                commands::invoke::delete_deployment(&config, deployment, force).await
            }
        },
    }
}
