//! `ktl`: apply/delete releases through the Stack Runner, and serve the
//! Mirror Bus over RPC/HTTP (`spec.md` §1, §6).

mod error;
mod executor;
mod logging;
mod plan;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use error::CliError;
use ktl_protocol::domain::{FailMode, RunCommand};
use logging::LogFormat;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "ktl")]
#[command(author, version, about = "Kubernetes-adjacent workstation toolkit", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Stack root directory holding `ktl.yaml`/`ktl.toml` and the event store.
    #[arg(long, global = true, default_value = ".")]
    stack_root: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = logging::LogFormat::Pretty as _, value_parser = clap::value_parser!(LogFormat))]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a stack plan (creates/updates releases in dependency order).
    Apply {
        /// Path to the plan file (YAML; see `ktl::plan::PlanFile`).
        plan: PathBuf,

        /// Program to shell out to for each node's apply/delete.
        #[arg(long, default_value = "helm")]
        executor: String,

        /// Resume a prior run, replaying its already-succeeded nodes.
        #[arg(long)]
        resume_run: Option<String>,
    },

    /// Delete a stack plan (reverse dependency order).
    Delete {
        plan: PathBuf,

        #[arg(long, default_value = "helm")]
        executor: String,
    },

    /// Stack status commands.
    #[command(subcommand)]
    Stack(StackCommands),

    /// Mirror bus commands.
    #[command(subcommand)]
    Mirror(MirrorCommands),
}

#[derive(Subcommand)]
enum StackCommands {
    /// Print the last run's summary for this stack root.
    Status {
        run_id: String,
    },
}

#[derive(Subcommand)]
enum MirrorCommands {
    /// Serve the RPC and HTTP/SSE gateways.
    Serve {
        #[arg(long, default_value = "127.0.0.1:50051")]
        grpc_addr: String,

        #[arg(long, default_value = "127.0.0.1:8080")]
        http_addr: String,

        /// Shared secret clients must present (`spec.md` §4.5 auth).
        #[arg(long, env = "KTL_MIRROR_TOKEN")]
        token: String,
    },

    /// Token management for the HTTP cookie endpoint.
    #[command(subcommand)]
    Token(TokenCommands),
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Issue a new cookie session token against a running gateway.
    Issue,
    /// Revoke a previously issued cookie session token.
    Revoke { token: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    if let Err(err) = run(cli).await {
        eprintln!("{err:?}");
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Apply {
            plan,
            executor,
            resume_run,
        } => run_stack(&cli.stack_root, &plan, RunCommand::Apply, &executor, resume_run).await,
        Commands::Delete { plan, executor } => {
            run_stack(&cli.stack_root, &plan, RunCommand::Delete, &executor, None).await
        }
        Commands::Stack(StackCommands::Status { run_id }) => stack_status(&cli.stack_root, &run_id).await,
        Commands::Mirror(MirrorCommands::Serve {
            grpc_addr,
            http_addr,
            token,
        }) => mirror_serve(&cli.stack_root, &grpc_addr, &http_addr, token).await,
        Commands::Mirror(MirrorCommands::Token(TokenCommands::Issue)) => {
            println!("token issuance happens against a running `mirror serve` gateway via");
            println!("POST /api/v1/mirror/auth/cookie with a Bearer credential.");
            Ok(())
        }
        Commands::Mirror(MirrorCommands::Token(TokenCommands::Revoke { token })) => {
            println!("revoke {token} via DELETE /api/v1/mirror/auth/cookie");
            Ok(())
        }
    }
}

async fn run_stack(
    stack_root: &std::path::Path,
    plan_path: &std::path::Path,
    command: RunCommand,
    executor_program: &str,
    resume_run: Option<String>,
) -> Result<(), CliError> {
    let config = ktl_config::KtlConfig::load(stack_root, &std::env::vars().collect())?;
    let store = ktl_store::Store::open(&stack_root.join("ktl.db"))?;

    let plan_file = plan::load(plan_path)?;
    let fail_mode = match config.scheduler.fail_mode {
        ktl_config::FailModeConfig::FailFast => FailMode::FailFast,
        ktl_config::FailModeConfig::Continue => FailMode::Continue,
    };

    let (run, nodes) = plan::build_run(
        &plan_file,
        command,
        stack_root,
        config.scheduler.concurrency,
        fail_mode,
    );

    let resume = if let Some(run_id) = resume_run {
        let steps = store
            .events
            .load_run_node_steps(ktl_protocol::domain::RunId(run_id))
            .await?;
        ktl_scheduler::ResumeInputs::from_steps(steps)
    } else {
        ktl_scheduler::ResumeInputs::default()
    };

    let executor = Arc::new(executor::ShellNodeExecutor::new(executor_program, Vec::new()));
    let runner = ktl_scheduler::StackRunner::new(store, config.scheduler, config.lock, executor);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    runner.run(run, nodes, resume, cancel).await?;
    println!("run succeeded");
    Ok(())
}

async fn stack_status(stack_root: &std::path::Path, run_id: &str) -> Result<(), CliError> {
    let store = ktl_store::Store::open(&stack_root.join("ktl.db"))?;
    let summary = store
        .events
        .load_summary(ktl_protocol::domain::RunId(run_id.to_string()))
        .await?;
    println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
    Ok(())
}

async fn mirror_serve(
    stack_root: &std::path::Path,
    grpc_addr: &str,
    http_addr: &str,
    token: String,
) -> Result<(), CliError> {
    let config = ktl_config::KtlConfig::load(stack_root, &std::env::vars().collect())?;
    let store = ktl_store::Store::open(&stack_root.join("ktl.db"))?;
    let hub = Arc::new(ktl_mirror::MirrorHub::new(store.sessions, config.mirror.clone()));

    let grpc_addr: SocketAddr = grpc_addr
        .parse()
        .map_err(|_| CliError::InvalidAddress(grpc_addr.to_string()))?;
    let http_addr: SocketAddr = http_addr
        .parse()
        .map_err(|_| CliError::InvalidAddress(http_addr.to_string()))?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    ktl_transport::serve::serve(
        hub,
        ktl_transport::serve::ServeConfig {
            grpc_addr,
            http_addr,
            mirror_config: config.mirror,
            shared_secret: token,
        },
        cancel,
    )
    .await
    .map_err(|e| CliError::Transport(ktl_transport::TransportError::InvalidRequest(e.to_string())))
}
