mod cmd;
mod log_driver;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    batch::BatchSubcommand, config::ConfigSubcommand, op::OpSubcommand,
    queue::QueueSubcommand, resource::ResourceSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "provision",
    about = "Dependency-ordered, queue-driven provisioning of cloud resources",
    version,
    propagate_version = true
)]
struct Cli {
    /// Provisioning root (default: auto-detect from .provision/)
    #[arg(long, global = true, env = "PROVISION_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .provision/ with a default config
    Init,

    /// Register and inspect resources
    Resource {
        #[command(subcommand)]
        subcommand: ResourceSubcommand,
    },

    /// Schedule, inspect and abort operations
    Op {
        #[command(subcommand)]
        subcommand: OpSubcommand,
    },

    /// Put operations on the provisioning queue
    Batch {
        #[command(subcommand)]
        subcommand: BatchSubcommand,
    },

    /// Re-open the failed operation a resource needs redone first
    Retry { resource: String },

    /// Re-open every stalled create in a resource group
    Reschedule { group: String },

    /// Soft-delete a resource and queue its teardown
    Delete {
        resource: String,
        /// Who requested the deletion
        #[arg(long)]
        actor: String,
    },

    /// Fail in-progress operations whose worker stopped heartbeating
    RecoverStale {
        /// Override dispatcher.stale_claim_secs
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Inspect the provisioning queue
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Inspect and validate .provision/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Run dispatchers with the built-in log driver
    Worker {
        /// Drain visible batches once and exit
        #[arg(long)]
        once: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Worker { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root_path = cli.root.as_deref();
    let root = root::resolve_root(root_path);

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Resource { subcommand } => cmd::resource::run(&root, subcommand, cli.json),
        Commands::Op { subcommand } => cmd::op::run(&root, subcommand, cli.json),
        Commands::Batch { subcommand } => cmd::batch::run(&root, subcommand, cli.json),
        Commands::Retry { resource } => cmd::recovery::retry(&root, &resource, cli.json),
        Commands::Reschedule { group } => cmd::recovery::reschedule(&root, &group, cli.json),
        Commands::Delete { resource, actor } => {
            cmd::recovery::delete(&root, &resource, &actor, cli.json)
        }
        Commands::RecoverStale { max_age_secs } => {
            cmd::recovery::recover_stale(&root, max_age_secs, cli.json)
        }
        Commands::Queue { subcommand } => cmd::queue::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Worker { once } => cmd::worker::run(&root, once, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
